use flux_core::{FluxError, Result, ShutdownSignal};
use flux_types::{ClientMessage, ClientUpdate, NodeCommand, NodeMessage, StartTarget};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::registry::TrackingRegistry;

/// `test` 消息的固定回复序列
const TEST_SEQUENCE: [u32; 3] = [1, 2, 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Node,
    Client,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Node => write!(f, "node"),
            PeerRole::Client => write!(f, "client"),
        }
    }
}

/// 已注册的连接；出站消息进入 FIFO 队列，由该连接的写任务发送
struct Peer {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// 注册凭据
///
/// `generation` 区分同一逻辑 id 的先后连接，旧连接注销时不会删掉新连接。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandle {
    pub role: PeerRole,
    pub id: String,
    pub generation: u64,
}

/// 消息路由器：维护节点表与客户端表，并按协议转发
pub struct Broker {
    nodes: RwLock<HashMap<String, Peer>>,
    clients: RwLock<HashMap<String, Peer>>,
    generation: AtomicU64,
    registry: Arc<TrackingRegistry>,
}

impl Broker {
    pub fn new(registry: Arc<TrackingRegistry>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TrackingRegistry> {
        &self.registry
    }

    fn table(&self, role: PeerRole) -> &RwLock<HashMap<String, Peer>> {
        match role {
            PeerRole::Node => &self.nodes,
            PeerRole::Client => &self.clients,
        }
    }

    fn report_count(role: PeerRole, count: usize) {
        match role {
            PeerRole::Node => metrics::set_connected_nodes(count),
            PeerRole::Client => metrics::set_connected_clients(count),
        }
    }

    /// 注册连接；优先使用对端提供的逻辑 id，否则取 max(数字 id, 0) + 1
    pub async fn register(
        &self,
        role: PeerRole,
        requested_id: Option<String>,
        tx: mpsc::UnboundedSender<String>,
    ) -> PeerHandle {
        let mut table = self.table(role).write().await;
        let id = match requested_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => next_sequential_id(&table),
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        if table
            .insert(id.clone(), Peer { generation, tx })
            .is_some()
        {
            warn!("{} {} reconnected, replacing previous connection", role, id);
        }
        Self::report_count(role, table.len());
        info!("{} {} connected ({} total)", role, id, table.len());

        PeerHandle {
            role,
            id,
            generation,
        }
    }

    /// 注销连接；只有 generation 匹配时才删除
    pub async fn unregister(&self, handle: &PeerHandle) -> bool {
        let mut table = self.table(handle.role).write().await;
        let current = table
            .get(&handle.id)
            .map(|peer| peer.generation == handle.generation)
            .unwrap_or(false);
        if !current {
            debug!(
                "{} {} already replaced, skipping unregister",
                handle.role, handle.id
            );
            return false;
        }

        table.remove(&handle.id);
        Self::report_count(handle.role, table.len());
        info!("{} {} disconnected", handle.role, handle.id);
        true
    }

    /// 连接建立后通过 `identifier` 更换逻辑 id
    pub async fn rename(&self, handle: &mut PeerHandle, new_id: String) {
        if new_id.is_empty() || handle.id == new_id {
            return;
        }

        let mut table = self.table(handle.role).write().await;
        let peer = match table.get(&handle.id) {
            Some(peer) if peer.generation == handle.generation => table.remove(&handle.id),
            _ => None,
        };
        let Some(peer) = peer else {
            warn!(
                "Cannot rename stale {} {} to {}",
                handle.role, handle.id, new_id
            );
            return;
        };

        if table.insert(new_id.clone(), peer).is_some() {
            warn!(
                "{} {} replaced an existing connection with the same id",
                handle.role, new_id
            );
        }
        Self::report_count(handle.role, table.len());
        info!("{} {} identified as {}", handle.role, handle.id, new_id);
        handle.id = new_id;
    }

    pub async fn node_ids(&self) -> Vec<String> {
        sorted_keys(&*self.nodes.read().await)
    }

    pub async fn client_ids(&self) -> Vec<String> {
        sorted_keys(&*self.clients.read().await)
    }

    pub async fn has_node(&self, id: &str) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    async fn send_to(&self, role: PeerRole, id: &str, text: String) -> Result<()> {
        let table = self.table(role).read().await;
        let peer = table
            .get(id)
            .ok_or_else(|| FluxError::UnknownRoute(format!("{} {}", role, id)))?;
        peer.tx
            .send(text)
            .map_err(|_| FluxError::Connection(format!("{} {} outbound queue closed", role, id)))
    }

    async fn broadcast(&self, role: PeerRole, text: String) -> usize {
        let table = self.table(role).read().await;
        let mut delivered = 0;
        for (id, peer) in table.iter() {
            if peer.tx.send(text.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("{} {} outbound queue closed, skipping", role, id);
            }
        }
        delivered
    }

    pub async fn send_to_node(&self, id: &str, command: &NodeCommand) -> Result<()> {
        self.send_to(PeerRole::Node, id, encode(command)?).await
    }

    pub async fn send_to_client(&self, id: &str, update: &ClientUpdate) -> Result<()> {
        self.send_to(PeerRole::Client, id, encode(update)?).await
    }

    /// 发给所有节点，返回投递数
    pub async fn broadcast_nodes(&self, command: &NodeCommand) -> Result<usize> {
        Ok(self.broadcast(PeerRole::Node, encode(command)?).await)
    }

    /// 发给所有客户端，返回投递数
    pub async fn broadcast_clients(&self, update: &ClientUpdate) -> Result<usize> {
        Ok(self.broadcast(PeerRole::Client, encode(update)?).await)
    }

    /// 解码并处理节点消息；错误只记录，不影响连接
    pub async fn handle_node_text(&self, sender: &mut PeerHandle, raw: &str) {
        let result = match serde_json::from_str::<NodeMessage>(raw) {
            Ok(message) => self.handle_node_message(sender, message).await,
            Err(e) => Err(FluxError::Protocol(e.to_string())),
        };
        if let Err(e) = result {
            report_failure(sender, e);
        }
    }

    /// 解码并处理客户端消息；错误只记录，不影响连接
    pub async fn handle_client_text(&self, sender: &PeerHandle, raw: &str) {
        let result = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => self.handle_client_message(sender, message).await,
            Err(e) => Err(FluxError::Protocol(e.to_string())),
        };
        if let Err(e) = result {
            report_failure(sender, e);
        }
    }

    pub async fn handle_node_message(
        &self,
        sender: &mut PeerHandle,
        message: NodeMessage,
    ) -> Result<()> {
        match message {
            NodeMessage::Identifier { id } => {
                self.rename(sender, id).await;
                Ok(())
            }
            NodeMessage::BoundingBoxes { frame_id, boxes } => {
                debug!(
                    "node {} frame {}: {} boxes",
                    sender.id,
                    frame_id,
                    boxes.len()
                );

                let object_ids: Vec<u64> = boxes.iter().filter_map(|b| b.object_id).collect();
                let update = ClientUpdate::BoundingBoxes {
                    camera_id: sender.id.clone(),
                    frame_id,
                    boxes,
                };
                self.broadcast_clients(&update).await?;
                metrics::record_routed("boundingBoxes");

                for object_id in object_ids {
                    self.log_spotting(object_id, &sender.id).await;
                }
                Ok(())
            }
            NodeMessage::FeatureMap {
                object_id,
                feature_map,
            } => {
                self.registry
                    .update_feature_map(object_id, feature_map.clone())
                    .await;
                let delivered = self
                    .broadcast_nodes(&NodeCommand::FeatureMap {
                        object_id,
                        feature_map,
                    })
                    .await?;
                metrics::record_routed("featureMap");
                debug!(
                    "featureMap for object {} from node {} fanned out to {} nodes",
                    object_id, sender.id, delivered
                );
                Ok(())
            }
            NodeMessage::Test { .. } => {
                for seq in TEST_SEQUENCE {
                    self.send_to_node(&sender.id, &NodeCommand::Test { seq: Some(seq) })
                        .await?;
                }
                Ok(())
            }
        }
    }

    pub async fn handle_client_message(
        &self,
        sender: &PeerHandle,
        message: ClientMessage,
    ) -> Result<()> {
        match message {
            ClientMessage::Start {
                ref camera_id, ..
            } => {
                let target = message.start_target().ok_or_else(|| {
                    FluxError::Protocol("start requires frameId and boxId, or image".to_string())
                })?;
                if !self.has_node(camera_id).await {
                    return Err(FluxError::UnknownRoute(format!(
                        "start for unknown camera {}",
                        camera_id
                    )));
                }

                let image = match &target {
                    StartTarget::Image(image) => Some(image.clone()),
                    StartTarget::Box { .. } => None,
                };
                let object = self.registry.create(image).await;

                if let Err(e) = self
                    .send_to_node(camera_id, &NodeCommand::start(object.id, target))
                    .await
                {
                    // 节点已离开，新对象无人负责
                    self.registry.remove(object.id).await;
                    return Err(e);
                }
                metrics::record_routed("start");
                info!(
                    "client {} started tracking object {} on node {}",
                    sender.id, object.id, camera_id
                );
                Ok(())
            }
            ClientMessage::Stop { object_id } => {
                if !self.registry.remove(object_id).await {
                    return Err(FluxError::UnknownRoute(format!(
                        "stop for unknown object {}",
                        object_id
                    )));
                }
                self.broadcast_nodes(&NodeCommand::Stop { object_id }).await?;
                metrics::record_routed("stop");
                info!("client {} stopped object {}", sender.id, object_id);
                Ok(())
            }
            ClientMessage::Test { .. } => {
                for seq in TEST_SEQUENCE {
                    self.send_to_client(&sender.id, &ClientUpdate::Test { seq: Some(seq) })
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn log_spotting(&self, object_id: u64, node_id: &str) {
        if !self.registry.in_history(object_id).await {
            debug!(
                "node {} reported unknown object {}, not logged",
                node_id, object_id
            );
            return;
        }
        if let Err(e) = self.registry.log_spotting(object_id, node_id).await {
            warn!("Failed to log spotting of object {}: {}", object_id, e);
        }
    }

    /// 执行一次超时清理并向所有节点广播 `stop`
    pub async fn sweep_expired(&self, now: Instant) -> Vec<u64> {
        let expired = self.registry.expire(now).await;
        for object_id in &expired {
            if let Err(e) = self
                .broadcast_nodes(&NodeCommand::Stop {
                    object_id: *object_id,
                })
                .await
            {
                error!("Failed to broadcast expiry of object {}: {}", object_id, e);
            }
        }
        expired
    }

    /// 启动后台超时清理任务，收到关闭信号后退出
    pub fn spawn_expiry_sweep(
        self: &Arc<Self>,
        period: Duration,
        shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        broker.sweep_expired(Instant::now()).await;
                    }
                    _ = shutdown.wait() => {
                        info!("Expiry sweep stopped");
                        break;
                    }
                }
            }
        })
    }
}

fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

fn next_sequential_id(table: &HashMap<String, Peer>) -> String {
    let max = table
        .keys()
        .filter_map(|id| id.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    (max + 1).to_string()
}

fn sorted_keys(table: &HashMap<String, Peer>) -> Vec<String> {
    let mut ids: Vec<String> = table.keys().cloned().collect();
    ids.sort();
    ids
}

fn report_failure(sender: &PeerHandle, err: FluxError) {
    let reason = match &err {
        FluxError::Protocol(_) | FluxError::Serialization(_) => "protocol",
        FluxError::UnknownRoute(_) => "unknown_route",
        _ => "internal",
    };
    metrics::record_dropped(reason);

    if err.is_per_message() {
        warn!("Dropped message from {} {}: {}", sender.role, sender.id, err);
    } else {
        error!("Failed to handle message from {} {}: {}", sender.role, sender.id, err);
    }
}
