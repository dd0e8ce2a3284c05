//! Typed adapters over raw model handles, one per pipeline stage.
//!
//! Each adapter owns exactly one [`RawModel`](crate::model::RawModel) behind a
//! mutex (handles are not safe for concurrent use), exposes the single
//! operation its stage performs, and validates every shape relationship it
//! can at construction so mismatches surface as configuration errors instead
//! of corrupted buffers.

mod extractor;
mod head_trainer;
mod inference;
mod initializer;
mod optimizer;

pub use extractor::BottleneckExtractor;
pub use head_trainer::HeadTrainer;
pub use inference::InferenceHead;
pub use initializer::Initializer;
pub use optimizer::OptimizerStage;
