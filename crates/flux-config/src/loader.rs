use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::{BrokerConfig, NodeConfig};

/// 配置加载器
///
/// TOML 文件为基础，`FLUX_` 前缀的环境变量覆盖（层级用 `__` 分隔，
/// 例如 `FLUX_SERVER__PORT=9000`）。文件不存在时使用默认值。
pub struct ConfigLoader {
    path: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            env_prefix: "FLUX".to_string(),
        }
    }

    /// 替换环境变量前缀
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载并验证 Broker 配置
    pub fn load_broker(&self) -> Result<BrokerConfig> {
        let config: BrokerConfig = self.load()?;
        config.validate()?;
        Ok(config)
    }

    /// 加载并验证节点配置
    pub fn load_node(&self) -> Result<NodeConfig> {
        let config: NodeConfig = self.load()?;
        config.validate()?;
        Ok(config)
    }

    fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let mut builder = Config::builder();

        if self.path.exists() {
            builder = builder.add_source(File::new(
                self.path
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogFormat;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let loader = ConfigLoader::new(temp_dir.path().join("broker.toml"))
            .with_env_prefix("FLUXTEST_MISSING");

        let config = loader.load_broker().unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.tracking.timeout_secs, 60);
    }

    #[test]
    fn test_load_broker_config_from_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("broker.toml");
        let content = r#"
[server]
port = 9001

[tracking]
timeout_secs = 5
timeline_dir = "/var/lib/flux/timelines"

[auth]
enabled = true
secret = "topsecret"

[logging]
level = "debug"
format = "json"
"#;
        fs::write(&path, content).unwrap();

        let config = ConfigLoader::new(&path)
            .with_env_prefix("FLUXTEST_FILE")
            .load_broker()
            .unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.tracking.timeout(), Duration::from_secs(5));
        assert_eq!(config.tracking.sweep_interval_ms, 1000);
        assert_eq!(
            config.tracking.timeline_dir,
            PathBuf::from("/var/lib/flux/timelines")
        );
        assert_eq!(config.auth.secret.as_deref(), Some("topsecret"));
        assert_eq!(config.auth.required_role, "tracker");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("node.toml");
        fs::write(&path, "[buffer]\ncapacity = 16\n").unwrap();

        std::env::set_var("FLUXTEST_ENV_BUFFER__CAPACITY", "32");
        std::env::set_var("FLUXTEST_ENV_NODE__ID", "cam7");
        let config = ConfigLoader::new(&path)
            .with_env_prefix("FLUXTEST_ENV")
            .load_node()
            .unwrap();
        std::env::remove_var("FLUXTEST_ENV_BUFFER__CAPACITY");
        std::env::remove_var("FLUXTEST_ENV_NODE__ID");

        assert_eq!(config.buffer.capacity, 32);
        assert_eq!(config.node.id.as_deref(), Some("cam7"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("node.toml");
        fs::write(&path, "[buffer]\ncapacity = 0\n").unwrap();

        let result = ConfigLoader::new(&path)
            .with_env_prefix("FLUXTEST_INVALID")
            .load_node();
        assert!(result.is_err());
    }
}
