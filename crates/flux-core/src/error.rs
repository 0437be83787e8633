use thiserror::Error;

/// FLUX 统一错误类型
#[derive(Error, Debug)]
pub enum FluxError {
    /// JSON 格式错误、缺少必填字段、未知消息类型
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `cameraId` / `objectId` 找不到对应的节点或对象
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("Connection error: {0}")]
    Connection(String),

    /// 超过总超时仍未连上，由所属进程决定是否重启
    #[error("Connection to {url} not established within {secs}s: {last_error}")]
    ConnectTimeout {
        url: String,
        secs: u64,
        last_error: String,
    },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, FluxError>;

impl From<anyhow::Error> for FluxError {
    fn from(err: anyhow::Error) -> Self {
        FluxError::Internal(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FluxError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        FluxError::Connection(err.to_string())
    }
}

impl FluxError {
    /// 单条消息级别的错误只需记录并丢弃
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            FluxError::Protocol(_) | FluxError::UnknownRoute(_) | FluxError::Serialization(_)
        )
    }
}
