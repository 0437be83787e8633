use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use flux_middleware::{bearer_auth, JwtAuth};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::broker::{Broker, PeerRole};

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    /// 为 None 时不做认证
    pub auth: Option<Arc<JwtAuth>>,
}

/// 连接时可选的 `?id=<逻辑名>`
#[derive(Debug, Default, Deserialize)]
pub struct PeerQuery {
    pub id: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    let mut protected = Router::new()
        .route("/processor", get(processor_ws))
        .route("/interface", get(interface_ws))
        .route("/timelines", get(get_timeline))
        .route("/objectIds", get(get_object_ids));

    if let Some(auth) = state.auth.clone() {
        protected = protected.route_layer(middleware::from_fn_with_state(auth, bearer_auth));
    }

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(protected)
        .with_state(state)
}

async fn processor_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<PeerQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_peer(socket, state.broker, PeerRole::Node, query.id))
}

async fn interface_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<PeerQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| serve_peer(socket, state.broker, PeerRole::Client, query.id))
}

/// 单个 websocket 连接：一个读循环 + 一个写任务，保证每条连接内有序
async fn serve_peer(
    socket: WebSocket,
    broker: Arc<Broker>,
    role: PeerRole,
    requested_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut handle = broker.register(role, requested_id, tx).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropped non-UTF-8 binary frame from {} {}", role, handle.id);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("{} {} socket error: {}", role, handle.id, e);
                break;
            }
        };

        match role {
            PeerRole::Node => broker.handle_node_text(&mut handle, &text).await,
            PeerRole::Client => broker.handle_client_text(&handle, &text).await,
        }
    }

    broker.unregister(&handle).await;
    writer.abort();
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
        .into_response()
}

/// GET /timelines?objectId=<id>
async fn get_timeline(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(raw) = params.get("objectId") else {
        return bad_request("missing objectId");
    };
    let Ok(object_id) = raw.trim().parse::<u64>() else {
        return bad_request(format!("invalid objectId '{}'", raw));
    };

    let registry = state.broker.registry();
    if !registry.in_history(object_id).await {
        return bad_request(format!("unknown objectId {}", object_id));
    }

    match registry.timeline(object_id).await {
        Ok(entries) => Json(json!({ "data": entries })).into_response(),
        Err(e) => {
            error!("Failed to read timeline of object {}: {}", object_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// GET /objectIds
async fn get_object_ids(State(state): State<AppState>) -> impl IntoResponse {
    let ids = state.broker.registry().history().await;
    Json(json!({ "data": ids }))
}
