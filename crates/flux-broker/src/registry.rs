use flux_core::Result;
use flux_types::FeatureMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::timeline::{TimelineEntry, TimelineStore};

/// 被跨摄像头跟踪的对象
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingObject {
    pub id: u64,
    /// 客户端上传的参考图（base64）
    pub image: Option<String>,
    pub feature_map: Option<FeatureMap>,
}

struct Entry {
    object: TrackingObject,
    created_at: Instant,
}

#[derive(Default)]
struct RegistryState {
    /// 分配过的全部 id，只增不减
    history: Vec<u64>,
    entries: HashMap<u64, Entry>,
}

/// 跟踪对象注册表
///
/// 负责 id 分配、特征存储、超时淘汰以及时间线日志。
/// `created_at` 只在创建时记录，特征更新不会延长存活时间。
pub struct TrackingRegistry {
    state: RwLock<RegistryState>,
    timeout: Duration,
    timelines: TimelineStore,
}

impl TrackingRegistry {
    pub fn new(timeout: Duration, timelines: TimelineStore) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            timeout,
            timelines,
        }
    }

    pub fn shared(timeout: Duration, timelines: TimelineStore) -> Arc<Self> {
        Arc::new(Self::new(timeout, timelines))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 创建新对象，id = max(历史 id, 0) + 1
    pub async fn create(&self, image: Option<String>) -> TrackingObject {
        let mut state = self.state.write().await;
        let id = state.history.iter().copied().max().unwrap_or(0) + 1;
        state.history.push(id);

        let object = TrackingObject {
            id,
            image,
            feature_map: None,
        };
        state.entries.insert(
            id,
            Entry {
                object: object.clone(),
                created_at: Instant::now(),
            },
        );

        metrics::record_object_created();
        metrics::set_active_objects(state.entries.len());
        info!("Tracking object {} created", id);
        object
    }

    /// 覆盖特征向量；对象不存在时返回 false
    pub async fn update_feature_map(&self, id: u64, feature_map: FeatureMap) -> bool {
        let mut state = self.state.write().await;
        match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.object.feature_map = Some(feature_map);
                debug!("Feature map of object {} updated", id);
                true
            }
            None => {
                warn!("Feature map for unknown object {} ignored", id);
                false
            }
        }
    }

    /// 删除对象（幂等）
    pub async fn remove(&self, id: u64) -> bool {
        let mut state = self.state.write().await;
        let removed = state.entries.remove(&id).is_some();
        if removed {
            metrics::set_active_objects(state.entries.len());
            info!("Tracking object {} removed", id);
        }
        removed
    }

    pub async fn contains(&self, id: u64) -> bool {
        self.state.read().await.entries.contains_key(&id)
    }

    pub async fn get(&self, id: u64) -> Option<TrackingObject> {
        self.state
            .read()
            .await
            .entries
            .get(&id)
            .map(|e| e.object.clone())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 所有分配过的 id（按分配顺序）
    pub async fn history(&self) -> Vec<u64> {
        self.state.read().await.history.clone()
    }

    pub async fn in_history(&self, id: u64) -> bool {
        self.state.read().await.history.contains(&id)
    }

    /// 删除 `created_at < now - timeout` 的对象，返回升序 id
    pub async fn expire(&self, now: Instant) -> Vec<u64> {
        let Some(cutoff) = now.checked_sub(self.timeout) else {
            return Vec::new();
        };

        let mut state = self.state.write().await;
        let mut expired: Vec<u64> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.created_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in &expired {
            state.entries.remove(id);
        }

        if !expired.is_empty() {
            metrics::record_objects_expired(expired.len());
            metrics::set_active_objects(state.entries.len());
            info!("Expired tracking objects: {:?}", expired);
        }
        expired
    }

    /// 记录对象在某节点上被看到
    pub async fn log_spotting(&self, id: u64, node_id: &str) -> Result<()> {
        self.timelines
            .append(id, &TimelineEntry::now(node_id))
            .await
    }

    /// 读取对象的时间线
    pub async fn timeline(&self, id: u64) -> Result<Vec<TimelineEntry>> {
        self.timelines.read(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn registry(timeout: Duration) -> (TrackingRegistry, TempDir) {
        let temp_dir = tempdir().unwrap();
        let registry = TrackingRegistry::new(timeout, TimelineStore::new(temp_dir.path()));
        (registry, temp_dir)
    }

    #[tokio::test]
    async fn test_ids_never_reused() {
        let (registry, _dir) = registry(Duration::from_secs(60));

        let first = registry.create(None).await;
        let second = registry.create(Some("aW1n".to_string())).await;
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.image.as_deref(), Some("aW1n"));

        assert!(registry.remove(2).await);
        assert!(!registry.remove(2).await);

        let third = registry.create(None).await;
        assert_eq!(third.id, 3);
        assert_eq!(registry.history().await, vec![1, 2, 3]);
        assert_eq!(registry.len().await, 2);
        assert!(registry.in_history(2).await);
        assert!(!registry.contains(2).await);
    }

    #[tokio::test]
    async fn test_update_feature_map() {
        let (registry, _dir) = registry(Duration::from_secs(60));
        let object = registry.create(None).await;

        assert!(registry.update_feature_map(object.id, vec![0.5, 0.25]).await);
        assert!(!registry.update_feature_map(99, vec![1.0]).await);

        let stored = registry.get(object.id).await.unwrap();
        assert_eq!(stored.feature_map, Some(vec![0.5, 0.25]));
        assert!(registry.get(99).await.is_none());
    }

    #[tokio::test]
    async fn test_expire_only_old_entries() {
        let (registry, _dir) = registry(Duration::from_millis(100));

        registry.create(None).await;
        registry.create(None).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = registry.create(None).await;

        assert_eq!(registry.expire(Instant::now()).await, vec![1, 2]);
        assert!(registry.contains(fresh.id).await);
        assert!(registry.expire(Instant::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_feature_update_does_not_refresh_expiry() {
        let (registry, _dir) = registry(Duration::from_millis(100));
        let object = registry.create(None).await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.update_feature_map(object.id, vec![1.0]).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(registry.expire(Instant::now()).await, vec![object.id]);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_spotting_timeline() {
        let (registry, _dir) = registry(Duration::from_secs(60));
        let object = registry.create(None).await;

        registry.log_spotting(object.id, "cam1").await.unwrap();
        registry.log_spotting(object.id, "cam2").await.unwrap();

        let timeline = registry.timeline(object.id).await.unwrap();
        let nodes: Vec<_> = timeline.iter().map(|e| e.processor_id.as_str()).collect();
        assert_eq!(nodes, vec!["cam1", "cam2"]);
        assert!(timeline[0].time_stamp <= timeline[1].time_stamp);
    }
}
