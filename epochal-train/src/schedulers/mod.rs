//! Learning-rate schedules.
//!
//! A schedule mutates the learning rates of an externally owned optimizer at
//! epoch and step boundaries:
//! - `LinearLr` - linear ramp of a factor applied to base rates
//! - `ExponentialLr` - multiply the live rates by `gamma` every epoch
//! - `SequentialLr` - chain sub-schedules at epoch milestones
//!
//! The training loop calls, per epoch: `event_before_train_epoch`, then
//! `event_after_train_step` once per step, then `event_after_train_epoch`.
//! After loading state, `initialize` is called once before the first epoch.

mod exponential;
mod linear;
mod sequential;
mod snapshot;

use std::path::Path;

use epochal_core::{LrMap, ParamGroupSet, Result};

use crate::config::SchedulerConfig;

pub use exponential::ExponentialLr;
pub use linear::LinearLr;
pub use sequential::SequentialLr;
pub use snapshot::LrSnapshot;

/// Operations shared by every learning-rate schedule.
pub trait LrSchedule {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Fast-forward to behave as if `start_epoch - 1` epochs already ran.
    ///
    /// `base_lrs`, when given, replaces the rates the schedule scales from.
    fn initialize(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        start_epoch: u32,
        base_lrs: Option<LrMap>,
    ) -> Result<()>;

    /// Apply the rate of the epoch's first step and start a step trace.
    fn event_before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        num_steps: usize,
    ) -> Result<()>;

    /// Record the rate used by `step_idx` and apply the rate for the next step.
    fn event_after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        step_idx: usize,
    ) -> Result<()>;

    /// Capture the final rates and advance the epoch counter.
    fn event_after_train_epoch(&mut self, optimizer: &mut dyn ParamGroupSet) -> Result<()>;

    /// Epoch the next `event_before_train_epoch` belongs to.
    fn current_epoch(&self) -> u32;

    /// Diagnostics of the last completed epoch.
    fn last_epoch_lrs(&self) -> Option<&LrSnapshot>;

    /// Replace the base rates after a restart.
    fn restore_base_lrs(&mut self, base_lrs: LrMap);

    /// Persist the last epoch's diagnostics into `dir`.
    fn save_epoch_lr_data(&self, dir: &Path) -> Result<()> {
        snapshot::save_last_epoch(self.last_epoch_lrs(), self.name(), dir)
    }

    /// Persist the resumable state into an existing directory.
    fn save(&self, dir: &Path) -> Result<()>;

    /// Restore state written by [`LrSchedule::save`].
    fn load(&mut self, dir: &Path) -> Result<()>;
}

/// A learning-rate schedule selected by configuration.
#[derive(Debug, Clone)]
pub enum LrScheduler {
    Linear(LinearLr),
    Exponential(ExponentialLr),
    Sequential(SequentialLr),
}

impl LrScheduler {
    /// Build a schedule, capturing base rates from `optimizer` where needed.
    pub fn from_config(config: &SchedulerConfig, optimizer: &dyn ParamGroupSet) -> Result<Self> {
        Ok(match config {
            SchedulerConfig::Linear(cfg) => LrScheduler::Linear(LinearLr::new(cfg, optimizer)?),
            SchedulerConfig::Exponential(cfg) => LrScheduler::Exponential(ExponentialLr::new(cfg)),
            SchedulerConfig::Sequential(cfg) => {
                let schedulers = cfg
                    .schedulers
                    .iter()
                    .map(|sub| LrScheduler::from_config(sub, optimizer))
                    .collect::<Result<Vec<_>>>()?;
                LrScheduler::Sequential(SequentialLr::new(
                    schedulers,
                    cfg.start_epochs.clone(),
                    cfg.milestones.clone(),
                )?)
            }
        })
    }

    fn inner(&self) -> &dyn LrSchedule {
        match self {
            LrScheduler::Linear(s) => s,
            LrScheduler::Exponential(s) => s,
            LrScheduler::Sequential(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LrSchedule {
        match self {
            LrScheduler::Linear(s) => s,
            LrScheduler::Exponential(s) => s,
            LrScheduler::Sequential(s) => s,
        }
    }
}

impl LrSchedule for LrScheduler {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn initialize(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        start_epoch: u32,
        base_lrs: Option<LrMap>,
    ) -> Result<()> {
        self.inner_mut().initialize(optimizer, start_epoch, base_lrs)
    }

    fn event_before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        num_steps: usize,
    ) -> Result<()> {
        self.inner_mut().event_before_train_epoch(optimizer, num_steps)
    }

    fn event_after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        step_idx: usize,
    ) -> Result<()> {
        self.inner_mut().event_after_train_step(optimizer, step_idx)
    }

    fn event_after_train_epoch(&mut self, optimizer: &mut dyn ParamGroupSet) -> Result<()> {
        self.inner_mut().event_after_train_epoch(optimizer)
    }

    fn current_epoch(&self) -> u32 {
        self.inner().current_epoch()
    }

    fn last_epoch_lrs(&self) -> Option<&LrSnapshot> {
        self.inner().last_epoch_lrs()
    }

    fn restore_base_lrs(&mut self, base_lrs: LrMap) {
        self.inner_mut().restore_base_lrs(base_lrs)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.inner().save(dir)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        self.inner_mut().load(dir)
    }
}
