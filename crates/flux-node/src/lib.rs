pub mod cutout;
pub mod frame_buffer;
pub mod pipeline;
pub mod runtime;

pub use cutout::{cutout, decode_image};
pub use frame_buffer::{FrameBuffer, FrameBufferError};
pub use pipeline::{
    cosine_similarity, Detector, DirectorySource, FrameSource, HistogramReidentifier,
    IdentityTracker, NoopDetector, Reidentifier, Tracker,
};
pub use runtime::{Collaborators, NodeLink, NodeRuntime, RuntimeOptions};
