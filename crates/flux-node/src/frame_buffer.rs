use flux_types::{BoundingBox, FrameId};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameBufferError {
    /// 帧已被淘汰或从未出现
    #[error("frame {0} not found")]
    FrameNotFound(FrameId),

    #[error("box {box_id} not found in frame {frame_id}")]
    BoxNotFound { frame_id: FrameId, box_id: u64 },

    #[error("boxes of frame {0} are not sorted by box id")]
    UnsortedBoxes(FrameId),
}

pub type Result<T> = std::result::Result<T, FrameBufferError>;

struct Slot<F> {
    frame: F,
    /// 按 box_id 严格升序
    boxes: Vec<BoundingBox>,
}

/// 最近 N 帧的环形缓存
///
/// 节点处理完一帧后就把它放进来，之后 Broker 发来的 `start{frameId, boxId}`
/// 可以据此找回像素。按帧 ID 哈希查找，按插入顺序 FIFO 淘汰。
pub struct FrameBuffer<F> {
    capacity: usize,
    order: VecDeque<FrameId>,
    slots: HashMap<FrameId, Slot<F>>,
}

impl<F> FrameBuffer<F> {
    /// 容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity + 1),
            slots: HashMap::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.slots.contains_key(&frame_id)
    }

    pub fn oldest(&self) -> Option<FrameId> {
        self.order.front().copied()
    }

    pub fn newest(&self) -> Option<FrameId> {
        self.order.back().copied()
    }

    /// 添加一帧，返回被淘汰的帧 ID
    ///
    /// 同一帧 ID 重复添加时原地替换，不改变淘汰顺序。
    pub fn add_frame(
        &mut self,
        frame_id: FrameId,
        frame: F,
        boxes: Vec<BoundingBox>,
    ) -> Result<Option<FrameId>> {
        if !boxes.windows(2).all(|w| w[0].box_id < w[1].box_id) {
            return Err(FrameBufferError::UnsortedBoxes(frame_id));
        }

        let slot = Slot { frame, boxes };
        if let Some(existing) = self.slots.get_mut(&frame_id) {
            *existing = slot;
            return Ok(None);
        }

        self.slots.insert(frame_id, slot);
        self.order.push_back(frame_id);

        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.slots.remove(&evicted);
                return Ok(Some(evicted));
            }
        }
        Ok(None)
    }

    fn slot(&self, frame_id: FrameId) -> Result<&Slot<F>> {
        self.slots
            .get(&frame_id)
            .ok_or(FrameBufferError::FrameNotFound(frame_id))
    }

    pub fn get_frame(&self, frame_id: FrameId) -> Result<&F> {
        self.slot(frame_id).map(|s| &s.frame)
    }

    pub fn get_boxes(&self, frame_id: FrameId) -> Result<&[BoundingBox]> {
        self.slot(frame_id).map(|s| s.boxes.as_slice())
    }

    /// 在帧的框列表中二分查找，返回下标
    pub fn box_index(&self, frame_id: FrameId, box_id: u64) -> Result<usize> {
        self.slot(frame_id)?
            .boxes
            .binary_search_by_key(&box_id, |b| b.box_id)
            .map_err(|_| FrameBufferError::BoxNotFound { frame_id, box_id })
    }

    pub fn get_box(&self, frame_id: FrameId, box_id: u64) -> Result<&BoundingBox> {
        let index = self.box_index(frame_id, box_id)?;
        Ok(&self.slot(frame_id)?.boxes[index])
    }
}
