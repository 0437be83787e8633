use flux_core::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// 时间线条目：某个对象在某个节点上被看到的时刻
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// 毫秒时间戳
    pub time_stamp: i64,
    pub processor_id: String,
}

impl TimelineEntry {
    pub fn now(processor_id: impl Into<String>) -> Self {
        Self {
            time_stamp: chrono::Utc::now().timestamp_millis(),
            processor_id: processor_id.into(),
        }
    }
}

/// 按对象划分的追加式日志，`<dir>/<object_id>.jsonl`，每行一个 JSON 条目
pub struct TimelineStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TimelineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, object_id: u64) -> PathBuf {
        self.dir.join(format!("{}.jsonl", object_id))
    }

    /// 追加一条记录
    pub async fn append(&self, object_id: u64, entry: &TimelineEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        // 同一时刻只允许一个写者，保证行完整
        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(&self.dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(object_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 读取全部记录；文件不存在返回空，损坏的行跳过
    pub async fn read(&self, object_id: u64) -> Result<Vec<TimelineEntry>> {
        let content = match fs::read_to_string(self.path_for(object_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TimelineEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    "Skipping malformed timeline line {} for object {}: {}",
                    lineno + 1,
                    object_id,
                    e
                ),
            }
        }
        Ok(entries)
    }
}
