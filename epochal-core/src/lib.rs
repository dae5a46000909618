//! # Epochal Core
//!
//! Foundation for the Epochal training control plane.
//! Provides the error taxonomy, atomic state persistence, layered
//! configuration loading, the optimizer parameter-group boundary, loss
//! registers, and the cross-worker abort protocol.

pub mod abort;
pub mod config;
pub mod error;
pub mod loss;
pub mod optimizer;
pub mod persistence;

// Re-export commonly used types at the crate root.
pub use abort::{AbortCoordinator, AbortSignal, PRIMARY_RANK, WorkerGroup};
pub use error::{ConfigError, EpochalError, PolicyError, Result, StateError};
pub use loss::{LossRegister, LossRegisterPool, Phase};
pub use optimizer::{
    LearningRate, LrMap, ParamGroup, ParamGroupSet, ParamGroups, read_lrs, scale_lrs, write_lrs,
};
