use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// 外观特征向量（对本层不透明）
pub type FeatureMap = Vec<f32>;

/// 检测框坐标 `[x1, y1, x2, y2]`
pub type Rect = [f64; 4];

/// 帧 ID（每个节点单调递增的浮点时间戳）
///
/// 以位模式比较，便于作为 HashMap 的键。
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub f64);

impl FrameId {
    pub fn value(self) -> f64 {
        self.0
    }
}

impl PartialEq for FrameId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FrameId {}

impl Hash for FrameId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for FrameId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrameId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl From<f64> for FrameId {
    fn from(v: f64) -> Self {
        FrameId(v)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 单帧内的检测框
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    /// 检测框 ID（跟踪器分配，同一帧内唯一）
    pub box_id: u64,
    pub rect: Rect,
    /// 分类
    pub object_type: String,
    /// 置信度
    pub certainty: f64,
    /// 关联的跟踪对象
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<u64>,
}

impl BoundingBox {
    pub fn new(box_id: u64, rect: Rect, object_type: impl Into<String>, certainty: f64) -> Self {
        Self {
            box_id,
            rect,
            object_type: object_type.into(),
            certainty,
            object_id: None,
        }
    }

    pub fn with_object(mut self, object_id: u64) -> Self {
        self.object_id = Some(object_id);
        self
    }
}
