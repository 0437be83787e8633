use flux_broker::{build_state, create_router, Broker};
use flux_config::BrokerConfig;
use flux_core::ShutdownSignal;
use flux_types::{ClientUpdate, FrameId, NodeCommand};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestBroker {
    addr: SocketAddr,
    broker: Arc<Broker>,
    shutdown: ShutdownSignal,
    _dir: TempDir,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn start_broker(timeout_secs: u64, sweep_interval_ms: u64) -> TestBroker {
    let dir = tempfile::tempdir().unwrap();
    let mut config = BrokerConfig::default();
    config.tracking.timeout_secs = timeout_secs;
    config.tracking.sweep_interval_ms = sweep_interval_ms;
    config.tracking.timeline_dir = dir.path().to_path_buf();

    let state = build_state(&config).unwrap();
    let broker = state.broker.clone();
    let shutdown = ShutdownSignal::new();
    broker.spawn_expiry_sweep(config.tracking.sweep_interval(), shutdown.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state))
            .with_graceful_shutdown(async move { signal.wait().await })
            .await
            .unwrap();
    });

    TestBroker {
        addr,
        broker,
        shutdown,
        _dir: dir,
    }
}

impl TestBroker {
    async fn node(&self, id: &str) -> Socket {
        let url = format!("ws://{}/processor", self.addr);
        let (mut ws, _) = connect_async(url).await.unwrap();
        ws.send(Message::Text(format!(
            r#"{{"type":"identifier","id":"{}"}}"#,
            id
        )))
        .await
        .unwrap();
        self.wait_for_node(id).await;
        ws
    }

    async fn client(&self) -> Socket {
        let before = self.broker.client_ids().await.len();
        let url = format!("ws://{}/interface", self.addr);
        let (ws, _) = connect_async(url).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while self.broker.client_ids().await.len() <= before {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client never registered");
        ws
    }

    async fn wait_for_node(&self, id: &str) {
        timeout(Duration::from_secs(5), async {
            while !self.broker.has_node(id).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("node {} never registered", id));
    }
}

async fn recv<T: DeserializeOwned>(ws: &mut Socket) -> T {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Socket, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(wait, ws.next()).await {
        panic!("unexpected message: {}", text);
    }
}

async fn send(ws: &mut Socket, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_cam1_start_and_feature_map_scenario() {
    let broker = start_broker(60, 1000).await;
    let mut cam1 = broker.node("cam1").await;
    let mut cam2 = broker.node("cam2").await;
    let mut client = broker.client().await;

    send(
        &mut client,
        r#"{"type":"start","cameraId":"cam1","frameId":1,"boxId":5}"#,
    )
    .await;

    let start: NodeCommand = recv(&mut cam1).await;
    assert_eq!(
        start,
        NodeCommand::Start {
            object_id: 1,
            frame_id: Some(FrameId(1.0)),
            box_id: Some(5),
            image: None,
        }
    );

    send(
        &mut cam1,
        r#"{"type":"featureMap","objectId":1,"featureMap":[0.25,0.5,0.75]}"#,
    )
    .await;

    let expected = NodeCommand::FeatureMap {
        object_id: 1,
        feature_map: vec![0.25, 0.5, 0.75],
    };
    assert_eq!(recv::<NodeCommand>(&mut cam1).await, expected);
    assert_eq!(recv::<NodeCommand>(&mut cam2).await, expected);

    // 恰好一次
    assert_silent(&mut cam1, Duration::from_millis(200)).await;
    assert_silent(&mut cam2, Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_start_for_unknown_camera_is_ignored() {
    let broker = start_broker(60, 1000).await;
    let mut cam1 = broker.node("cam1").await;
    let mut client = broker.client().await;

    send(
        &mut client,
        r#"{"type":"start","cameraId":"cam9","frameId":1,"boxId":5}"#,
    )
    .await;
    // 畸形消息同样不会断开连接
    send(&mut client, "not json").await;

    assert_silent(&mut cam1, Duration::from_millis(300)).await;
    assert!(broker.broker.registry().history().await.is_empty());

    // 连接仍然可用
    send(&mut client, r#"{"type":"test"}"#).await;
    let update: ClientUpdate = recv(&mut client).await;
    assert_eq!(update, ClientUpdate::Test { seq: Some(1) });
}

#[tokio::test]
async fn test_bounding_boxes_reach_clients_with_camera_id() {
    let broker = start_broker(60, 1000).await;
    let mut cam1 = broker.node("cam1").await;
    let mut client = broker.client().await;

    send(
        &mut cam1,
        concat!(
            r#"{"type":"boundingBoxes","frameId":7.5,"boxes":["#,
            r#"{"boxId":1,"rect":[0,0,4,4],"objectType":"person","certainty":0.8}"#,
            r#"]}"#,
        ),
    )
    .await;

    match recv::<ClientUpdate>(&mut client).await {
        ClientUpdate::BoundingBoxes {
            camera_id,
            frame_id,
            boxes,
        } => {
            assert_eq!(camera_id, "cam1");
            assert_eq!(frame_id, FrameId(7.5));
            assert_eq!(boxes.len(), 1);
            assert_eq!(boxes[0].box_id, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_expired_object_broadcasts_stop() {
    let broker = start_broker(1, 50).await;
    let mut cam1 = broker.node("cam1").await;
    let mut cam2 = broker.node("cam2").await;
    let mut client = broker.client().await;

    send(
        &mut client,
        r#"{"type":"start","cameraId":"cam1","frameId":1,"boxId":5}"#,
    )
    .await;
    let _start: NodeCommand = recv(&mut cam1).await;

    // 特征更新不会延长存活时间
    send(
        &mut cam1,
        r#"{"type":"featureMap","objectId":1,"featureMap":[1.0]}"#,
    )
    .await;
    let _fm: NodeCommand = recv(&mut cam1).await;
    let _fm: NodeCommand = recv(&mut cam2).await;

    let stop = NodeCommand::Stop { object_id: 1 };
    assert_eq!(recv::<NodeCommand>(&mut cam1).await, stop);
    assert_eq!(recv::<NodeCommand>(&mut cam2).await, stop);
    assert!(!broker.broker.registry().contains(1).await);
}

#[tokio::test]
async fn test_explicitly_stopped_object_never_expires() {
    let broker = start_broker(1, 50).await;
    let mut cam1 = broker.node("cam1").await;
    let mut client = broker.client().await;

    send(
        &mut client,
        r#"{"type":"start","cameraId":"cam1","frameId":1,"boxId":5}"#,
    )
    .await;
    let _start: NodeCommand = recv(&mut cam1).await;

    send(&mut client, r#"{"type":"stop","objectId":1}"#).await;
    assert_eq!(
        recv::<NodeCommand>(&mut cam1).await,
        NodeCommand::Stop { object_id: 1 }
    );

    // 超过超时窗口后不应再收到 stop
    assert_silent(&mut cam1, Duration::from_millis(1500)).await;
}

#[tokio::test]
async fn test_node_disconnect_removes_route_but_keeps_objects() {
    let broker = start_broker(60, 1000).await;
    let mut cam1 = broker.node("cam1").await;
    let mut client = broker.client().await;

    send(
        &mut client,
        r#"{"type":"start","cameraId":"cam1","image":"aW1n"}"#,
    )
    .await;
    let start: NodeCommand = recv(&mut cam1).await;
    assert_eq!(
        start,
        NodeCommand::Start {
            object_id: 1,
            frame_id: None,
            box_id: None,
            image: Some("aW1n".to_string()),
        }
    );

    cam1.close(None).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while broker.broker.has_node("cam1").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cam1 never unregistered");

    assert!(broker.broker.registry().contains(1).await);
}
