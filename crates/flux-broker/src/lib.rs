pub mod api;
pub mod broker;
pub mod metrics;
pub mod registry;
pub mod timeline;

use anyhow::{anyhow, Result};
use flux_config::{AuthConfig, BrokerConfig};
use flux_core::ShutdownSignal;
use flux_middleware::JwtAuth;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub use api::{create_router, AppState};
pub use broker::{Broker, PeerHandle, PeerRole};
pub use registry::{TrackingObject, TrackingRegistry};
pub use timeline::{TimelineEntry, TimelineStore};

/// 认证关闭时返回 None
pub fn build_auth(config: &AuthConfig) -> Result<Option<Arc<JwtAuth>>> {
    if !config.enabled {
        return Ok(None);
    }
    let secret = config
        .secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("auth.enabled requires auth.secret"))?;

    Ok(Some(Arc::new(JwtAuth::new(
        secret,
        config.audience.clone(),
        config.required_role.clone(),
    ))))
}

/// 由配置组装 Broker 状态
pub fn build_state(config: &BrokerConfig) -> Result<AppState> {
    let registry = TrackingRegistry::shared(
        config.tracking.timeout(),
        TimelineStore::new(&config.tracking.timeline_dir),
    );
    Ok(AppState {
        broker: Arc::new(Broker::new(registry)),
        auth: build_auth(&config.auth)?,
    })
}

/// 在给定监听器上运行 Broker，直到关闭信号触发
pub async fn run(
    config: BrokerConfig,
    listener: TcpListener,
    shutdown: ShutdownSignal,
) -> Result<()> {
    let state = build_state(&config)?;
    let sweep = state
        .broker
        .spawn_expiry_sweep(config.tracking.sweep_interval(), shutdown.clone());

    info!(
        "Broker listening on {} (object timeout {}s, auth {})",
        listener.local_addr()?,
        config.tracking.timeout_secs,
        if state.auth.is_some() { "on" } else { "off" }
    );

    let app = create_router(state);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait().await })
        .await?;

    shutdown.trigger();
    sweep.await?;
    info!("Broker stopped");
    Ok(())
}
