use anyhow::{anyhow, Result};
use flux_logging::LoggingConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// 处理节点配置
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub link: LinkSettings,
    pub buffer: BufferConfig,
    pub source: SourceConfig,
    pub reid: ReidConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// 逻辑名称，连接后通过 identifier 消息上报
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// 与 Broker 之间的连接重试参数
#[derive(Debug, Clone, Deserialize)]
pub struct LinkSettings {
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 断线后重放最近这段时间内已写出的帧
    #[serde(default = "default_replay_window_ms")]
    pub replay_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

/// 帧来源
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_fps")]
    pub fps: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReidConfig {
    /// 设置后启用本地图库匹配
    #[serde(default)]
    pub match_threshold: Option<f32>,
}

fn default_broker_url() -> String {
    "ws://127.0.0.1:8000/processor".to_string()
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_replay_window_ms() -> u64 {
    1000
}

fn default_capacity() -> usize {
    256
}

fn default_fps() -> f64 {
    5.0
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            broker_url: default_broker_url(),
            token: None,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            replay_window_ms: default_replay_window_ms(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            directory: None,
            fps: default_fps(),
        }
    }
}

impl LinkSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_millis(self.replay_window_ms)
    }
}

impl SourceConfig {
    /// 两帧之间的间隔
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

impl NodeConfig {
    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity == 0 {
            return Err(anyhow!("buffer.capacity must be greater than 0"));
        }

        if !(self.source.fps.is_finite() && self.source.fps > 0.0) {
            return Err(anyhow!("source.fps must be positive, got {}", self.source.fps));
        }

        if self.link.connect_timeout_secs == 0 {
            return Err(anyhow!("link.connect_timeout_secs must be greater than 0"));
        }

        if !self.node.broker_url.starts_with("ws://") && !self.node.broker_url.starts_with("wss://")
        {
            return Err(anyhow!(
                "node.broker_url must be a ws:// or wss:// url: {}",
                self.node.broker_url
            ));
        }

        Ok(())
    }
}
