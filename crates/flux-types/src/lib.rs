pub mod detection;
pub mod message;

pub use detection::{BoundingBox, FeatureMap, FrameId, Rect};
pub use message::{ClientMessage, ClientUpdate, NodeCommand, NodeMessage, StartTarget};
