use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// 初始化 Prometheus metrics exporter
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    // 描述所有指标
    describe_metrics();

    tracing::info!("Metrics exporter started on http://{}/metrics", addr);
    Ok(())
}

/// 描述所有指标
fn describe_metrics() {
    // 连接
    describe_gauge!("flux_nodes_connected", "Number of connected processing nodes");
    describe_gauge!("flux_clients_connected", "Number of connected clients");

    // 消息
    describe_counter!(
        "flux_messages_routed_total",
        "Total number of messages routed, labelled by kind"
    );
    describe_counter!(
        "flux_messages_dropped_total",
        "Total number of inbound messages dropped, labelled by reason"
    );

    // 跟踪对象
    describe_counter!(
        "flux_objects_created_total",
        "Total number of tracking objects created"
    );
    describe_counter!(
        "flux_objects_expired_total",
        "Total number of tracking objects removed by the timeout sweep"
    );
    describe_gauge!("flux_objects_active", "Number of live tracking objects");
}

/// 设置已连接节点数
pub fn set_connected_nodes(count: usize) {
    gauge!("flux_nodes_connected", count as f64);
}

/// 设置已连接客户端数
pub fn set_connected_clients(count: usize) {
    gauge!("flux_clients_connected", count as f64);
}

/// 记录一次路由
pub fn record_routed(kind: &'static str) {
    counter!("flux_messages_routed_total", 1, "kind" => kind);
}

/// 记录一次丢弃
pub fn record_dropped(reason: &'static str) {
    counter!("flux_messages_dropped_total", 1, "reason" => reason);
}

pub fn record_object_created() {
    counter!("flux_objects_created_total", 1);
}

pub fn record_objects_expired(count: usize) {
    counter!("flux_objects_expired_total", count as u64);
}

pub fn set_active_objects(count: usize) {
    gauge!("flux_objects_active", count as f64);
}
