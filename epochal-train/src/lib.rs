//! # epochal-train - training control policies
//!
//! Policies that decide, epoch by epoch, how a training run proceeds:
//! learning-rate schedules, loss weighting, early stopping and checkpoint
//! cadence. Every policy persists the minimal state needed to resume a run
//! bit-identically from a saved directory.
//!
//! [`TrainingControl`] drives all four through the epoch lifecycle.

pub mod checkpoint;
pub mod config;
pub mod control;
pub mod early_stop;
pub mod loss_weight;
pub mod schedulers;

// Re-exports
pub use checkpoint::CheckpointPolicy;
pub use config::{
    CheckpointConfig, ControlConfig, EarlyStopConfig, ExponentialConfig, LinearConfig,
    LossWeightConfig, SchedulerConfig, SequentialConfig, TargetKind, load_config,
};
pub use control::{EpochDecision, TrainingControl};
pub use early_stop::{EarlyStopPolicy, TargetValue, TrainingLoss, ValidationLoss};
pub use loss_weight::{
    DynamicLossWeighter, LossWeightPolicy, LossWeighter, StaticLossWeighter, UniformLossWeighter,
};
pub use schedulers::{ExponentialLr, LinearLr, LrSchedule, LrScheduler, LrSnapshot, SequentialLr};
