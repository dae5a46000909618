//! Facade that drives every policy through one epoch lifecycle.
//!
//! Per epoch the training loop calls, in order:
//! 1. [`TrainingControl::before_train_epoch`]
//! 2. [`TrainingControl::after_train_step`] once per step
//! 3. [`TrainingControl::after_train_epoch`]
//! 4. [`TrainingControl::before_val_epoch`] and [`TrainingControl::after_val_epoch`]
//! 5. [`TrainingControl::end_epoch`], which yields the [`EpochDecision`]
//!
//! The initialization epoch (epoch 0) usually skips the training hooks and
//! only validates before calling `end_epoch`.

use std::path::Path;

use epochal_core::persistence::{ensure_dir, recreate_dir};
use epochal_core::{AbortCoordinator, LossRegisterPool, ParamGroupSet, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::checkpoint::CheckpointPolicy;
use crate::config::ControlConfig;
use crate::early_stop::EarlyStopPolicy;
use crate::loss_weight::{LossWeightPolicy, LossWeighter};
use crate::schedulers::{LrSchedule, LrScheduler};

pub const LR_SCHEDULER_DIR: &str = "lr_scheduler";
pub const LOSS_WEIGHTER_DIR: &str = "loss_weighter";
pub const EARLY_STOPPER_DIR: &str = "early_stopper";
pub const CHECKPOINT_SAVER_DIR: &str = "checkpoint_saver";
pub const LOSS_WEIGHTS_FILE: &str = "loss_weights.json";

/// Outcome of [`TrainingControl::end_epoch`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochDecision {
    pub epoch: i64,
    pub target_value: f64,
    pub improvement: bool,
    pub early_stop: bool,
    pub save_checkpoints: bool,
}

/// The LR schedule, loss weights, early stopper and checkpoint policy of one run.
#[derive(Debug)]
pub struct TrainingControl {
    scheduler: LrScheduler,
    loss_weights: LossWeightPolicy,
    early_stop: EarlyStopPolicy,
    checkpoint: CheckpointPolicy,
}

impl TrainingControl {
    pub fn new(
        scheduler: LrScheduler,
        loss_weights: LossWeightPolicy,
        early_stop: EarlyStopPolicy,
        checkpoint: CheckpointPolicy,
    ) -> Self {
        Self {
            scheduler,
            loss_weights,
            early_stop,
            checkpoint,
        }
    }

    /// Build every policy from `config`, capturing base rates from `optimizer`.
    pub fn from_config(config: &ControlConfig, optimizer: &dyn ParamGroupSet) -> Result<Self> {
        Ok(Self::new(
            LrScheduler::from_config(&config.scheduler, optimizer)?,
            LossWeightPolicy::from_config(&config.loss_weights)?,
            EarlyStopPolicy::from_config(&config.early_stop)?,
            CheckpointPolicy::new(&config.checkpoint)?,
        ))
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn loss_weighter(&self) -> &LossWeightPolicy {
        &self.loss_weights
    }

    pub fn early_stopper(&self) -> &EarlyStopPolicy {
        &self.early_stop
    }

    pub fn checkpoint_saver(&self) -> &CheckpointPolicy {
        &self.checkpoint
    }

    /// Fast-forward the LR schedule; call once after [`load`](Self::load).
    pub fn initialize(&mut self, optimizer: &mut dyn ParamGroupSet, start_epoch: u32) -> Result<()> {
        self.scheduler.initialize(optimizer, start_epoch, None)
    }

    pub fn before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        pool: &LossRegisterPool,
        num_steps: usize,
    ) -> Result<()> {
        self.loss_weights.event_before_train_epoch(pool);
        self.scheduler.event_before_train_epoch(optimizer, num_steps)
    }

    pub fn after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        pool: &LossRegisterPool,
        step_idx: usize,
    ) -> Result<()> {
        self.loss_weights.event_after_train_step(pool);
        self.scheduler.event_after_train_step(optimizer, step_idx)
    }

    pub fn after_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        pool: &LossRegisterPool,
    ) -> Result<()> {
        self.loss_weights.event_after_train_epoch(pool);
        self.scheduler.event_after_train_epoch(optimizer)
    }

    pub fn before_val_epoch(&mut self, pool: &LossRegisterPool) {
        self.loss_weights.event_before_val_epoch(pool);
    }

    pub fn after_val_epoch(&mut self, pool: &LossRegisterPool) {
        self.loss_weights.event_after_val_epoch(pool);
    }

    /// Update the early stopper, then the checkpoint policy.
    pub fn end_epoch(&mut self, pool: &LossRegisterPool) -> Result<EpochDecision> {
        self.early_stop.update(pool, &self.loss_weights)?;
        self.checkpoint.update(&self.early_stop);

        let decision = EpochDecision {
            epoch: self.early_stop.current_epoch(),
            target_value: self.early_stop.target_value().unwrap_or(f64::NAN),
            improvement: self.early_stop.improvement(),
            early_stop: self.early_stop.early_stop(),
            save_checkpoints: self.checkpoint.save_checkpoints(),
        };
        info!(
            epoch = decision.epoch,
            target = decision.target_value,
            improvement = decision.improvement,
            early_stop = decision.early_stop,
            save_checkpoints = decision.save_checkpoints,
            "Epoch finished"
        );
        Ok(decision)
    }

    /// Share the primary worker's loss weights with every worker.
    pub async fn synchronize(&mut self, coordinator: &mut AbortCoordinator) -> Result<()> {
        self.loss_weights.synchronize(coordinator).await
    }

    /// Write the last epoch's LR trace and the weights of `loss_keys` into `dir`.
    pub fn save_epoch_data(&self, dir: &Path, loss_keys: &[String]) -> Result<()> {
        ensure_dir(dir)?;
        self.scheduler.save_epoch_lr_data(dir)?;
        self.loss_weights
            .save_loss_weights(&dir.join(LOSS_WEIGHTS_FILE), loss_keys)
    }

    /// Persist every policy into its own sub-directory of an existing `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        ensure_dir(dir)?;
        self.scheduler.save(&recreate_dir(&dir.join(LR_SCHEDULER_DIR))?)?;
        self.loss_weights.save(&recreate_dir(&dir.join(LOSS_WEIGHTER_DIR))?)?;
        self.early_stop.save(&recreate_dir(&dir.join(EARLY_STOPPER_DIR))?)?;
        self.checkpoint.save(&recreate_dir(&dir.join(CHECKPOINT_SAVER_DIR))?)?;
        info!(dir = %dir.display(), "Training control state saved");
        Ok(())
    }

    /// Restore state written by [`save`](Self::save).
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        ensure_dir(dir)?;
        self.scheduler.load(&dir.join(LR_SCHEDULER_DIR))?;
        self.loss_weights.load(&dir.join(LOSS_WEIGHTER_DIR))?;
        self.early_stop.load(&dir.join(EARLY_STOPPER_DIR))?;
        self.checkpoint.load(&dir.join(CHECKPOINT_SAVER_DIR))?;
        info!(
            dir = %dir.display(),
            epoch = self.early_stop.current_epoch(),
            "Training control state loaded"
        );
        Ok(())
    }
}
