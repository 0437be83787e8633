//! 节点侧的可替换组件：帧来源、检测、跟踪与外观特征提取。
//!
//! 随包提供的实现只保证流程可运行，真正的模型由部署方替换。

use anyhow::{anyhow, Result};
use flux_types::{BoundingBox, FeatureMap, FrameId};
use image::RgbImage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 目标检测
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Vec<BoundingBox>;
}

/// 多目标跟踪：为跨帧的同一目标维持稳定的 box_id
pub trait Tracker: Send {
    fn track(&mut self, frame: &RgbImage, detections: Vec<BoundingBox>) -> Vec<BoundingBox>;
}

/// 外观特征提取
pub trait Reidentifier: Send + Sync {
    fn extract(&self, crop: &RgbImage) -> Result<FeatureMap>;
}

/// 帧来源，返回 None 表示暂无可用帧
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Option<(RgbImage, FrameId)>;
}

/// 不产生任何检测结果
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn detect(&self, _frame: &RgbImage) -> Vec<BoundingBox> {
        Vec::new()
    }
}

/// 原样透传检测结果
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTracker;

impl Tracker for IdentityTracker {
    fn track(&mut self, _frame: &RgbImage, detections: Vec<BoundingBox>) -> Vec<BoundingBox> {
        detections
    }
}

/// 按通道归一化的颜色直方图，长度 `3 * bins`
#[derive(Debug, Clone, Copy)]
pub struct HistogramReidentifier {
    bins: usize,
}

impl Default for HistogramReidentifier {
    fn default() -> Self {
        Self::new(8)
    }
}

impl HistogramReidentifier {
    pub fn new(bins: usize) -> Self {
        Self {
            bins: bins.clamp(1, 256),
        }
    }

    pub fn dimension(&self) -> usize {
        self.bins * 3
    }
}

impl Reidentifier for HistogramReidentifier {
    fn extract(&self, crop: &RgbImage) -> Result<FeatureMap> {
        let pixels = crop.width() as usize * crop.height() as usize;
        if pixels == 0 {
            return Err(anyhow!("Cannot extract features from an empty crop"));
        }

        let mut histogram = vec![0f32; self.dimension()];
        for pixel in crop.pixels() {
            for (channel, value) in pixel.0.iter().enumerate() {
                let bin = *value as usize * self.bins / 256;
                histogram[channel * self.bins + bin] += 1.0;
            }
        }

        let total = pixels as f32;
        for value in histogram.iter_mut() {
            *value /= total;
        }
        Ok(histogram)
    }
}

/// 余弦相似度，长度不一致或存在零向量时返回 None
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        Some(dot / (norm_a * norm_b))
    } else {
        None
    }
}

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 循环读取目录中的图片文件（按文件名排序）
///
/// 帧 ID 取毫秒时间戳，并保证严格递增。
pub struct DirectorySource {
    files: Vec<PathBuf>,
    cursor: usize,
    last_frame_id: f64,
}

impl DirectorySource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| anyhow!("Cannot read source directory {}: {}", dir.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(anyhow!("No image files in {}", dir.display()));
        }
        debug!("Frame source {} has {} images", dir.display(), files.len());

        Ok(Self {
            files,
            cursor: 0,
            last_frame_id: 0.0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn next_frame_id(&mut self) -> FrameId {
        let now = chrono::Utc::now().timestamp_millis() as f64;
        let id = if now > self.last_frame_id {
            now
        } else {
            self.last_frame_id + 1.0
        };
        self.last_frame_id = id;
        FrameId(id)
    }
}

impl FrameSource for DirectorySource {
    fn next_frame(&mut self) -> Option<(RgbImage, FrameId)> {
        // 最多尝试一轮，跳过无法解码的文件
        for _ in 0..self.files.len() {
            let path = &self.files[self.cursor];
            self.cursor = (self.cursor + 1) % self.files.len();

            match image::open(path) {
                Ok(image) => {
                    let frame = image.to_rgb8();
                    return Some((frame, self.next_frame_id()));
                }
                Err(e) => warn!("Skipping unreadable frame {}: {}", path.display(), e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn test_histogram_is_normalized_per_channel() {
        let reid = HistogramReidentifier::new(4);
        let crop = RgbImage::from_fn(4, 2, |x, _| {
            if x < 2 {
                Rgb([0, 255, 10])
            } else {
                Rgb([255, 255, 10])
            }
        });

        let features = reid.extract(&crop).unwrap();
        assert_eq!(features.len(), 12);
        assert_eq!(&features[0..4], &[0.5, 0.0, 0.0, 0.5]);
        assert_eq!(&features[4..8], &[0.0, 0.0, 0.0, 1.0]);
        assert_eq!(&features[8..12], &[1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_histogram_rejects_empty_crop() {
        let reid = HistogramReidentifier::default();
        assert!(reid.extract(&RgbImage::new(0, 0)).is_err());
    }

    #[test]
    fn test_cosine_similarity() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]), Some(1.0));
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 3.0]), Some(0.0));
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn test_directory_source_cycles_sorted_images() {
        let dir = tempdir().unwrap();
        RgbImage::from_pixel(2, 2, Rgb([10, 0, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(3, 3, Rgb([20, 0, 0]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = DirectorySource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 2);

        let (first, id1) = source.next_frame().unwrap();
        let (second, id2) = source.next_frame().unwrap();
        let (third, id3) = source.next_frame().unwrap();

        assert_eq!(first.dimensions(), (3, 3));
        assert_eq!(second.dimensions(), (2, 2));
        assert_eq!(third.dimensions(), (3, 3));
        assert!(id1 < id2 && id2 < id3);
    }

    #[test]
    fn test_directory_source_requires_images() {
        let dir = tempdir().unwrap();
        assert!(DirectorySource::open(dir.path()).is_err());
        assert!(DirectorySource::open(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_shipped_detector_and_tracker() {
        let frame = RgbImage::new(4, 4);
        assert!(NoopDetector.detect(&frame).is_empty());

        let detections = vec![BoundingBox::new(3, [0.0, 0.0, 2.0, 2.0], "person", 0.5)];
        assert_eq!(IdentityTracker.track(&frame, detections.clone()), detections);
    }
}
