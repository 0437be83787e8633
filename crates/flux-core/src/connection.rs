//! 到 Broker 的单条逻辑连接。
//!
//! 对调用方隐藏断线：`send()` 从不阻塞，消息先进入待发队列，由写任务按序
//! 取出写到套接字。最近 `replay_window` 内写出的帧另存一份，连接丢失或主动
//! 断开时放回队首，重连后先于新消息重放。投递语义是至少一次，对端可能收到
//! 重复帧。
//!
//! 状态机：`Disconnected -> Connecting -> Connected`，连接丢失时
//! `Connected -> Connecting`，重试超过总超时进入 `Failed`。所有状态迁移
//! 与队列的修改都在同一把锁内完成。

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{FluxError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 发送 close 帧的最长等待
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 重试超时，不再自动重连
    Failed,
}

/// 连接参数
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// 例如 `ws://127.0.0.1:8000/processor`
    pub url: String,
    /// 握手时以 `Authorization: Bearer` 发送
    pub token: Option<String>,
    /// 两次连接尝试之间的固定间隔
    pub retry_delay: Duration,
    /// 单轮连接的总超时
    pub connect_timeout: Duration,
    /// 连接丢失时重放最近这段时间内写出的帧
    pub replay_window: Duration,
}

impl LinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            replay_window: Duration::from_secs(1),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry_delay: Duration, connect_timeout: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_replay_window(mut self, replay_window: Duration) -> Self {
        self.replay_window = replay_window;
        self
    }
}

/// 入站消息处理器，由连接的所有者实现
///
/// `I` 是按 `type` 区分的枚举，实现方对其做穷尽匹配。
#[async_trait]
pub trait InboundHandler<I>: Send + Sync {
    async fn on_message(&self, message: I);
}

enum Phase {
    Disconnected,
    Connecting,
    /// 用于唤醒当前连接的写任务
    Connected(Arc<Notify>),
    Failed,
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Phase::Disconnected => ConnectionState::Disconnected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
            Phase::Failed => ConnectionState::Failed,
        }
    }

    fn writer(&self) -> Option<Arc<Notify>> {
        match self {
            Phase::Connected(wake) => Some(Arc::clone(wake)),
            _ => None,
        }
    }
}

struct Link {
    phase: Phase,
    /// 尚未写出的帧
    pending: VecDeque<String>,
    /// 已写出且仍在重放窗口内的帧，按写出顺序
    written: VecDeque<(Instant, String)>,
    /// 当前连接还没有写出 hello
    hello_due: bool,
    /// 每次发起连接或主动断开时递增，旧任务据此判断自己是否过期
    epoch: u64,
    /// 连接任务与读任务
    tasks: Vec<JoinHandle<()>>,
    last_error: Option<String>,
}

impl Link {
    /// 把窗口内已写出的帧放回待发队列队首，返回放回的数量
    fn requeue_written(&mut self, window: Duration) -> usize {
        let now = Instant::now();
        let mut requeued = 0;
        while let Some((written_at, text)) = self.written.pop_back() {
            if now.saturating_duration_since(written_at) <= window {
                self.pending.push_front(text);
                requeued += 1;
            }
        }
        requeued
    }

    fn prune_written(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some((written_at, _)) = self.written.front() {
            if now.saturating_duration_since(*written_at) <= window {
                break;
            }
            self.written.pop_front();
        }
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct Inner<I> {
    config: LinkConfig,
    hello: Option<String>,
    handler: RwLock<Option<Weak<dyn InboundHandler<I>>>>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<I> Inner<I> {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, link: &mut Link, phase: Phase) {
        let state = phase.state();
        link.phase = phase;
        self.state_tx.send_replace(state);
    }

    fn timeout_error(&self) -> FluxError {
        let last_error = self
            .lock_link()
            .last_error
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        FluxError::ConnectTimeout {
            url: self.config.url.clone(),
            secs: self.config.connect_timeout.as_secs(),
            last_error,
        }
    }
}

/// 连接管理器
///
/// `O` 为出站消息类型，`I` 为入站消息类型。克隆后共享同一条连接。
/// 必须在 tokio 运行时内使用。
pub struct ConnectionManager<O, I> {
    inner: Arc<Inner<I>>,
    _outbound: PhantomData<fn(O)>,
}

impl<O, I> Clone for ConnectionManager<O, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _outbound: PhantomData,
        }
    }
}

impl<O, I> ConnectionManager<O, I>
where
    O: Serialize,
    I: DeserializeOwned + Send + 'static,
{
    pub fn new(config: LinkConfig) -> Self {
        Self::build(config, None)
    }

    /// 每次（重新）连上后首先发送 `hello`，例如节点的 `identifier`
    pub fn with_hello(config: LinkConfig, hello: &O) -> Result<Self> {
        let hello = serde_json::to_string(hello)?;
        Ok(Self::build(config, Some(hello)))
    }

    fn build(config: LinkConfig, hello: Option<String>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                hello,
                handler: RwLock::new(None),
                link: Mutex::new(Link {
                    phase: Phase::Disconnected,
                    pending: VecDeque::new(),
                    written: VecDeque::new(),
                    hello_due: false,
                    epoch: 0,
                    tasks: Vec::new(),
                    last_error: None,
                }),
                state_tx,
            }),
            _outbound: PhantomData,
        }
    }

    /// 注册入站处理器（只保留弱引用）
    pub fn set_handler(&self, handler: &Arc<dyn InboundHandler<I>>) {
        let mut slot = self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::downgrade(handler));
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_link().phase.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// 待发队列长度
    pub fn pending_len(&self) -> usize {
        self.inner.lock_link().pending.len()
    }

    /// 建立连接，按固定间隔重试直到总超时
    ///
    /// 超时返回 `FluxError::ConnectTimeout`，连接进入 `Failed`。
    pub async fn connect(&self) -> Result<()> {
        {
            let mut guard = self.inner.lock_link();
            match guard.phase.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    start_connecting(&self.inner, &mut guard)
                }
            }
        }

        let mut rx = self.inner.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(self.inner.timeout_error()),
                ConnectionState::Disconnected => {
                    return Err(FluxError::Connection(
                        "disconnected while connecting".to_string(),
                    ))
                }
                ConnectionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(FluxError::Connection("state channel closed".to_string()));
            }
        }
    }

    /// 发送消息，从不阻塞
    ///
    /// 消息总是先进入待发队列：已连接时唤醒写任务；未连接时若当前没有
    /// 进行中的重连则发起一次。
    pub fn send(&self, message: &O) -> Result<()> {
        let text = serde_json::to_string(message)?;
        enqueue(&self.inner, text);
        Ok(())
    }

    /// 主动断开，可重复调用
    ///
    /// 取消进行中的重连，尽力发送 close 帧。未写出的帧以及重放窗口内
    /// 已写出的帧都留在待发队列中，下次连接时按序发送。
    pub fn disconnect(&self) {
        let mut guard = self.inner.lock_link();
        let link = &mut *guard;
        link.epoch += 1;
        link.abort_tasks();
        let requeued = link.requeue_written(self.inner.config.replay_window);

        let writer = link.phase.writer();
        let previous = link.phase.state();
        self.inner.set_phase(link, Phase::Disconnected);
        // 写任务看到 epoch 变化后关闭套接字并退出
        if let Some(wake) = writer {
            wake.notify_one();
        }

        if previous != ConnectionState::Disconnected {
            info!(
                "Disconnected from {} ({} pending, {} to replay)",
                self.inner.config.url,
                link.pending.len(),
                requeued
            );
        }
    }

    /// 等待连接进入 `Failed`，返回致命错误
    pub async fn wait_failed(&self) -> FluxError {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Failed {
                return self.inner.timeout_error();
            }
            if rx.changed().await.is_err() {
                return FluxError::Connection("state channel closed".to_string());
            }
        }
    }
}

fn enqueue<I>(inner: &Arc<Inner<I>>, text: String)
where
    I: DeserializeOwned + Send + 'static,
{
    let mut guard = inner.lock_link();
    let link = &mut *guard;
    link.pending.push_back(text);
    match link.phase.state() {
        ConnectionState::Connected => {
            if let Some(wake) = link.phase.writer() {
                wake.notify_one();
            }
        }
        ConnectionState::Disconnected => start_connecting(inner, link),
        ConnectionState::Connecting | ConnectionState::Failed => {}
    }
}

/// 调用方需持有锁
fn start_connecting<I>(inner: &Arc<Inner<I>>, link: &mut Link)
where
    I: DeserializeOwned + Send + 'static,
{
    link.epoch += 1;
    inner.set_phase(link, Phase::Connecting);
    let task = tokio::spawn(run_connect(Arc::clone(inner), link.epoch));
    link.tasks.retain(|t| !t.is_finished());
    link.tasks.push(task);
}

async fn open(config: &LinkConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| FluxError::Auth(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    let (ws, _response) = connect_async(request).await?;
    Ok(ws)
}

async fn run_connect<I>(inner: Arc<Inner<I>>, epoch: u64)
where
    I: DeserializeOwned + Send + 'static,
{
    let config = &inner.config;
    let deadline = Instant::now() + config.connect_timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = match tokio::time::timeout(remaining, open(config)).await {
            Ok(result) => result,
            Err(_) => Err(FluxError::Connection("handshake timed out".to_string())),
        };

        match result {
            Ok(ws) => {
                info!("Connected to {} (attempt {})", config.url, attempt);
                install(&inner, ws, epoch);
                return;
            }
            Err(e) => {
                if Instant::now() + config.retry_delay >= deadline {
                    fail(&inner, epoch, e);
                    return;
                }
                warn!(
                    "Connect to {} failed (attempt {}): {}. Retrying in {:?}",
                    config.url, attempt, e, config.retry_delay
                );
                tokio::time::sleep(config.retry_delay).await;
            }
        }
    }
}

fn fail<I>(inner: &Inner<I>, epoch: u64, err: FluxError) {
    let mut guard = inner.lock_link();
    if guard.epoch != epoch {
        return;
    }
    error!(
        "Giving up on {} after {:?}: {}",
        inner.config.url, inner.config.connect_timeout, err
    );
    guard.last_error = Some(err.to_string());
    inner.set_phase(&mut guard, Phase::Failed);
}

fn install<I>(inner: &Arc<Inner<I>>, ws: WsStream, epoch: u64)
where
    I: DeserializeOwned + Send + 'static,
{
    let mut guard = inner.lock_link();
    let link = &mut *guard;
    if link.epoch != epoch || !matches!(link.phase, Phase::Connecting) {
        debug!("Discarding stale connection to {}", inner.config.url);
        return;
    }

    let (sink, stream) = ws.split();
    let wake = Arc::new(Notify::new());
    link.hello_due = inner.hello.is_some();
    link.written.clear();

    tokio::spawn(run_writer(Arc::clone(inner), sink, Arc::clone(&wake), epoch));
    let reader = tokio::spawn(run_reader(Arc::clone(inner), stream, epoch));
    link.tasks.retain(|t| !t.is_finished());
    link.tasks.push(reader);
    link.last_error = None;
    inner.set_phase(link, Phase::Connected(wake));

    if !link.pending.is_empty() {
        debug!(
            "Flushing {} pending messages to {}",
            link.pending.len(),
            inner.config.url
        );
    }
}

enum Outgoing {
    Frame(String),
    Idle,
    /// 连接已被主动断开或替换
    Stale,
}

/// 单个连接的写任务：按序取出待发帧写到套接字
///
/// 取出的帧在写之前就记入重放窗口，写到一半被断开也不会丢失。
async fn run_writer<I>(
    inner: Arc<Inner<I>>,
    mut sink: SplitSink<WsStream, WsMessage>,
    wake: Arc<Notify>,
    epoch: u64,
) where
    I: DeserializeOwned + Send + 'static,
{
    let window = inner.config.replay_window;
    loop {
        let next = {
            let mut guard = inner.lock_link();
            let link = &mut *guard;
            if link.epoch != epoch {
                Outgoing::Stale
            } else if let Some(hello) = inner.hello.as_ref().filter(|_| link.hello_due) {
                link.hello_due = false;
                Outgoing::Frame(hello.clone())
            } else if let Some(text) = link.pending.pop_front() {
                link.written.push_back((Instant::now(), text.clone()));
                Outgoing::Frame(text)
            } else {
                Outgoing::Idle
            }
        };

        match next {
            Outgoing::Stale => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
                return;
            }
            Outgoing::Idle => wake.notified().await,
            Outgoing::Frame(text) => match sink.send(WsMessage::Text(text)).await {
                Ok(()) => {
                    let mut guard = inner.lock_link();
                    if guard.epoch == epoch {
                        guard.prune_written(window);
                    }
                }
                Err(e) => {
                    warn!("Write to {} failed: {}", inner.config.url, e);
                    connection_lost(&inner, epoch);
                }
            },
        }
    }
}

/// 重放窗口内的帧放回待发队列队首，并发起重连
fn connection_lost<I>(inner: &Arc<Inner<I>>, epoch: u64)
where
    I: DeserializeOwned + Send + 'static,
{
    let mut guard = inner.lock_link();
    let link = &mut *guard;
    if link.epoch != epoch || !matches!(link.phase, Phase::Connected(_)) {
        return;
    }

    let writer = link.phase.writer();
    link.abort_tasks();
    let requeued = link.requeue_written(inner.config.replay_window);
    warn!(
        "Connection to {} lost, reconnecting ({} pending, {} to replay)",
        inner.config.url,
        link.pending.len(),
        requeued
    );
    start_connecting(inner, link);
    if let Some(wake) = writer {
        wake.notify_one();
    }
}

async fn run_reader<I>(inner: Arc<Inner<I>>, mut stream: SplitStream<WsStream>, epoch: u64)
where
    I: DeserializeOwned + Send + 'static,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => dispatch(&inner, &text).await,
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => dispatch(&inner, &text).await,
                Err(_) => warn!("Dropping non UTF-8 binary frame from {}", inner.config.url),
            },
            Ok(WsMessage::Close(frame)) => {
                debug!("Peer {} sent close: {:?}", inner.config.url, frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Read from {} failed: {}", inner.config.url, e);
                break;
            }
        }
    }
    connection_lost(&inner, epoch);
}

async fn dispatch<I>(inner: &Inner<I>, text: &str)
where
    I: DeserializeOwned + Send + 'static,
{
    let message = match serde_json::from_str::<I>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed message from {}: {}", inner.config.url, e);
            return;
        }
    };

    let handler = inner
        .handler
        .read()
        .ok()
        .and_then(|slot| slot.as_ref().and_then(Weak::upgrade));
    match handler {
        Some(handler) => handler.on_message(message).await,
        None => debug!("No inbound handler registered, dropping message"),
    }
}
