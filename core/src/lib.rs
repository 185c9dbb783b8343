pub mod tensor;
pub mod error;
pub mod model;
pub mod routing;
pub mod downsample;
pub mod smoothing;
pub mod straight_through;
pub mod upsample;
pub mod transform;
pub mod ratio_loss;
pub mod compositor;
pub mod gradient;

pub use compositor::{ChunkingGrads, ChunkingTrace, Stage, StageCompositor, StageRecord};
pub use error::{ChunkError, ChunkResult};
pub use model::{ChunkingConfig, ChunkingParams};
pub use routing::ChunkDecision;
pub use tensor::SeqLayout;
pub use transform::SequenceTransform;
