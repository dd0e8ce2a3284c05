//! On-device incremental learning over a fixed feature extractor.
//!
//! A [`TransferLearningEngine`] owns the trainable head's parameter buffers
//! and coordinates background sample ingestion, background training and
//! concurrent inference against them. The tensor math itself lives behind
//! the [`model::RawModel`] trait: a loaded graph is treated as a pure
//! function from input buffers to output buffers, and a [`model::ModelLoader`]
//! supplies the five graphs one transfer-learning model is made of.
//!
//! [`ContinuousTrainer`] layers a start/stop toggle on top, turning the
//! engine's one-shot train operation into continuous background epochs.

pub mod coordinator;
pub mod engine;
pub mod error;
pub mod model;
pub mod stages;

#[cfg(test)]
pub(crate) mod fixtures;

pub use coordinator::ContinuousTrainer;
pub use engine::{ClassTable, LossCallback, Prediction, TransferLearningEngine};
pub use error::{EngineErr, Result};
