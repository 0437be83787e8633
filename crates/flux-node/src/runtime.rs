use anyhow::{anyhow, Result};
use async_trait::async_trait;
use flux_core::{ConnectionManager, InboundHandler, ShutdownSignal};
use flux_types::{BoundingBox, FeatureMap, FrameId, NodeCommand, NodeMessage, StartTarget};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cutout::{cutout, decode_image};
use crate::frame_buffer::FrameBuffer;
use crate::pipeline::{cosine_similarity, Detector, FrameSource, Reidentifier, Tracker};

pub type NodeLink = ConnectionManager<NodeMessage, NodeCommand>;

/// 节点使用的可替换组件
pub struct Collaborators {
    pub detector: Box<dyn Detector>,
    pub tracker: Box<dyn Tracker>,
    pub reidentifier: Box<dyn Reidentifier>,
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub buffer_capacity: usize,
    /// 设置后，未关联的框会与图库比对
    pub match_threshold: Option<f32>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            match_threshold: None,
        }
    }
}

struct NodeState {
    frames: FrameBuffer<RgbImage>,
    /// box_id -> object_id
    associations: HashMap<u64, u64>,
    /// Broker 广播来的特征，object_id -> 特征
    gallery: HashMap<u64, FeatureMap>,
}

/// 处理节点运行时
///
/// 逐帧执行 检测 → 跟踪 → 关联 → 缓存 → 上报，
/// 并处理 Broker 下发的 start / stop / featureMap。
pub struct NodeRuntime {
    link: NodeLink,
    detector: Box<dyn Detector>,
    tracker: Mutex<Box<dyn Tracker>>,
    reidentifier: Box<dyn Reidentifier>,
    match_threshold: Option<f32>,
    state: Mutex<NodeState>,
}

impl NodeRuntime {
    /// 创建运行时并注册为连接的入站处理器
    pub fn new(link: NodeLink, collaborators: Collaborators, options: RuntimeOptions) -> Arc<Self> {
        let runtime = Arc::new(Self {
            link,
            detector: collaborators.detector,
            tracker: Mutex::new(collaborators.tracker),
            reidentifier: collaborators.reidentifier,
            match_threshold: options.match_threshold,
            state: Mutex::new(NodeState {
                frames: FrameBuffer::new(options.buffer_capacity),
                associations: HashMap::new(),
                gallery: HashMap::new(),
            }),
        });

        let handler: Arc<dyn InboundHandler<NodeCommand>> = runtime.clone();
        runtime.link.set_handler(&handler);
        runtime
    }

    pub fn link(&self) -> &NodeLink {
        &self.link
    }

    pub async fn buffered_frames(&self) -> usize {
        self.state.lock().await.frames.len()
    }

    pub async fn gallery_len(&self) -> usize {
        self.state.lock().await.gallery.len()
    }

    pub async fn association(&self, box_id: u64) -> Option<u64> {
        self.state.lock().await.associations.get(&box_id).copied()
    }

    /// 处理一帧并上报检测框，返回上报的框
    pub async fn process_frame(
        &self,
        frame: RgbImage,
        frame_id: FrameId,
    ) -> Result<Vec<BoundingBox>> {
        let detections = self.detector.detect(&frame);
        let mut boxes = self.tracker.lock().await.track(&frame, detections);
        boxes.sort_by_key(|b| b.box_id);
        boxes.dedup_by_key(|b| b.box_id);

        let mut state = self.state.lock().await;
        for bbox in boxes.iter_mut() {
            if let Some(object_id) = state.associations.get(&bbox.box_id) {
                bbox.object_id = Some(*object_id);
                continue;
            }
            if let Some(object_id) = self.match_gallery(&state, &frame, bbox) {
                debug!("box {} matched object {} from gallery", bbox.box_id, object_id);
                state.associations.insert(bbox.box_id, object_id);
                bbox.object_id = Some(object_id);
            }
        }

        if let Some(evicted) = state.frames.add_frame(frame_id, frame, boxes.clone())? {
            debug!("frame {} evicted from buffer", evicted);
        }
        drop(state);

        self.link.send(&NodeMessage::BoundingBoxes {
            frame_id,
            boxes: boxes.clone(),
        })?;
        Ok(boxes)
    }

    fn match_gallery(
        &self,
        state: &NodeState,
        frame: &RgbImage,
        bbox: &BoundingBox,
    ) -> Option<u64> {
        let threshold = self.match_threshold?;
        if state.gallery.is_empty() {
            return None;
        }

        let crop = cutout(frame, &bbox.rect).ok()?;
        let features = match self.reidentifier.extract(&crop) {
            Ok(features) => features,
            Err(e) => {
                debug!("Feature extraction for box {} failed: {}", bbox.box_id, e);
                return None;
            }
        };

        state
            .gallery
            .iter()
            .filter_map(|(object_id, known)| {
                cosine_similarity(&features, known).map(|score| (*object_id, score))
            })
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(object_id, _)| object_id)
    }

    /// 处理 Broker 下发的命令
    pub async fn handle_command(&self, command: NodeCommand) -> Result<()> {
        match command {
            NodeCommand::Start { object_id, .. } => {
                let target = command
                    .start_target()
                    .ok_or_else(|| anyhow!("start for object {} has no target", object_id))?;
                self.start_tracking(object_id, target).await
            }
            NodeCommand::Stop { object_id } => {
                let mut state = self.state.lock().await;
                state.gallery.remove(&object_id);
                state.associations.retain(|_, o| *o != object_id);
                info!("Stopped tracking object {}", object_id);
                Ok(())
            }
            NodeCommand::FeatureMap {
                object_id,
                feature_map,
            } => {
                self.state
                    .lock()
                    .await
                    .gallery
                    .insert(object_id, feature_map);
                debug!("Gallery updated with object {}", object_id);
                Ok(())
            }
            NodeCommand::Test { seq } => {
                debug!("Test message from broker (seq {:?})", seq);
                Ok(())
            }
        }
    }

    async fn start_tracking(&self, object_id: u64, target: StartTarget) -> Result<()> {
        let feature_map = match target {
            StartTarget::Box { frame_id, box_id } => {
                let crop = {
                    let state = self.state.lock().await;
                    let frame = state.frames.get_frame(frame_id)?;
                    let bbox = state.frames.get_box(frame_id, box_id)?;
                    cutout(frame, &bbox.rect)?
                };
                let feature_map = self.reidentifier.extract(&crop)?;
                self.state
                    .lock()
                    .await
                    .associations
                    .insert(box_id, object_id);
                feature_map
            }
            StartTarget::Image(encoded) => {
                let image = decode_image(&encoded)?;
                self.reidentifier.extract(&image)?
            }
        };

        info!("Started tracking object {}", object_id);
        self.link.send(&NodeMessage::FeatureMap {
            object_id,
            feature_map,
        })?;
        Ok(())
    }

    /// 连接 Broker 并按固定间隔处理帧，直到关闭或连接彻底失败
    pub async fn run(
        self: Arc<Self>,
        mut source: Box<dyn FrameSource>,
        frame_interval: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<()> {
        self.link.connect().await?;
        info!("Connected to broker at {}", self.link.url());

        let failed = self.link.wait_failed();
        tokio::pin!(failed);

        let mut interval = tokio::time::interval(frame_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some((frame, frame_id)) = source.next_frame() else {
                        continue;
                    };
                    if let Err(e) = self.process_frame(frame, frame_id).await {
                        warn!("Failed to process frame {}: {}", frame_id, e);
                    }
                }
                err = &mut failed => {
                    return Err(err.into());
                }
                _ = shutdown.wait() => {
                    info!("Node runtime stopping");
                    self.link.disconnect();
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler<NodeCommand> for NodeRuntime {
    async fn on_message(&self, message: NodeCommand) {
        if let Err(e) = self.handle_command(message).await {
            warn!("Dropped broker command: {}", e);
        }
    }
}
