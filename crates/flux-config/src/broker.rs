use anyhow::{anyhow, Result};
use flux_logging::LoggingConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Broker 配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub server: ServerConfig,
    pub tracking: TrackingConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// 跟踪对象注册表配置
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// 对象存活时间（秒），从创建时刻起算
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 过期扫描间隔（毫秒）
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// 时间线日志目录，每个对象一个 `<id>.jsonl`
    #[serde(default = "default_timeline_dir")]
    pub timeline_dir: PathBuf,
}

/// Bearer 认证配置
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_audience")]
    pub audience: String,
    #[serde(default = "default_required_role")]
    pub required_role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

// 默认值函数
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_timeline_dir() -> PathBuf {
    PathBuf::from("timelines")
}

fn default_audience() -> String {
    "flux-reid".to_string()
}

fn default_required_role() -> String {
    "tracker".to_string()
}

fn default_metrics_listen() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            timeline_dir: default_timeline_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            audience: default_audience(),
            required_role: default_required_role(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TrackingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl BrokerConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.tracking.timeout_secs == 0 {
            return Err(anyhow!("tracking.timeout_secs must be greater than 0"));
        }

        if self.tracking.sweep_interval_ms == 0 {
            return Err(anyhow!("tracking.sweep_interval_ms must be greater than 0"));
        }

        if self.auth.enabled {
            match self.auth.secret.as_deref() {
                Some(secret) if !secret.is_empty() => {}
                _ => return Err(anyhow!("auth.enabled requires auth.secret")),
            }
        }

        if self.metrics.enabled && self.metrics.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!(
                "metrics.listen is not a socket address: {}",
                self.metrics.listen
            ));
        }

        Ok(())
    }
}
