//! Linear LR schedule.

use std::path::Path;

use epochal_core::persistence::{INTERNAL_STATE_FILE, load_state_file, save_state_file};
use epochal_core::{ConfigError, LrMap, ParamGroupSet, Result, read_lrs, scale_lrs, write_lrs};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::snapshot::EpochLrRecorder;
use super::{LrSchedule, LrSnapshot};
use crate::config::LinearConfig;

/// Scales the base rates by a factor moving linearly from `start_factor`
/// to `end_factor` over `num_epochs` epochs.
///
/// The factor at epoch position `p` is `(1 - p) * start_factor + p * end_factor`.
/// Past `num_epochs` the line is extrapolated, not clamped. Within an epoch
/// the factor is interpolated per step, and each step's rate is written one
/// step ahead (after the previous step finishes).
#[derive(Debug, Clone)]
pub struct LinearLr {
    start_factor: f64,
    end_factor: f64,
    num_epochs: u32,
    base_lrs: LrMap,
    curr_epoch: u32,
    epoch_ratios: (f64, f64),
    epoch_num_steps: usize,
    recorder: EpochLrRecorder,
}

#[derive(Debug, Serialize, Deserialize)]
struct LinearState {
    curr_epoch: u32,
    base_lr_dict: LrMap,
}

impl LinearLr {
    pub fn new(config: &LinearConfig, optimizer: &dyn ParamGroupSet) -> Result<Self> {
        if config.num_epochs == 0 {
            return Err(ConfigError::invalid("linear schedule needs `num_epochs` > 0").into());
        }
        if config.start_epoch == 0 {
            return Err(ConfigError::invalid("linear schedule epochs start at 1").into());
        }
        Ok(Self {
            start_factor: config.start_factor,
            end_factor: config.end_factor,
            num_epochs: config.num_epochs,
            base_lrs: read_lrs(optimizer)?,
            curr_epoch: config.start_epoch,
            epoch_ratios: (config.start_factor, config.start_factor),
            epoch_num_steps: 0,
            recorder: EpochLrRecorder::default(),
        })
    }

    fn factor_at(&self, position: f64) -> f64 {
        (1.0 - position) * self.start_factor + position * self.end_factor
    }

    /// Factors at the start and end of `epoch`.
    pub fn epoch_lr_ratios(&self, epoch: u32) -> (f64, f64) {
        let n = f64::from(self.num_epochs);
        (
            self.factor_at((f64::from(epoch) - 1.0) / n),
            self.factor_at(f64::from(epoch) / n),
        )
    }

    /// Factor in effect during `step_idx` of an epoch with `num_steps` steps.
    ///
    /// Step 0 already sits one position into the epoch: its factor is
    /// `start - (start - end) / num_steps`, not the epoch's start factor.
    pub fn step_lr_ratio(&self, epoch: u32, step_idx: usize, num_steps: usize) -> f64 {
        let (start, end) = self.epoch_lr_ratios(epoch);
        interpolate(start, end, step_idx as f64 + 1.0, num_steps)
    }

    pub fn base_lrs(&self) -> &LrMap {
        &self.base_lrs
    }

    /// Write the factor for the step after `prev_step` (`-1` before the first step).
    fn apply_step(&self, optimizer: &mut dyn ParamGroupSet, prev_step: f64) -> Result<()> {
        let (start, end) = self.epoch_ratios;
        let factor = interpolate(start, end, prev_step + 2.0, self.epoch_num_steps);
        trace!(epoch = self.curr_epoch, factor, "Linear LR step update");
        write_lrs(optimizer, &scale_lrs(&self.base_lrs, factor))
    }
}

/// Linear interpolation at `numerator / num_steps`; an empty epoch stays at `start`.
fn interpolate(start: f64, end: f64, numerator: f64, num_steps: usize) -> f64 {
    if num_steps == 0 {
        return start;
    }
    let p = numerator / num_steps as f64;
    (1.0 - p) * start + p * end
}

impl LrSchedule for LinearLr {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn initialize(
        &mut self,
        _optimizer: &mut dyn ParamGroupSet,
        start_epoch: u32,
        base_lrs: Option<LrMap>,
    ) -> Result<()> {
        if let Some(base_lrs) = base_lrs {
            self.base_lrs = base_lrs;
        }
        if start_epoch > self.curr_epoch {
            debug!(from = self.curr_epoch, to = start_epoch, "Linear LR fast-forward");
            self.curr_epoch = start_epoch;
        }
        Ok(())
    }

    fn event_before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        num_steps: usize,
    ) -> Result<()> {
        self.epoch_ratios = self.epoch_lr_ratios(self.curr_epoch);
        self.epoch_num_steps = num_steps;
        debug!(
            epoch = self.curr_epoch,
            start_ratio = self.epoch_ratios.0,
            end_ratio = self.epoch_ratios.1,
            num_steps,
            "Linear LR epoch"
        );

        self.apply_step(optimizer, -1.0)?;
        self.recorder.begin(optimizer, num_steps)
    }

    fn event_after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        step_idx: usize,
    ) -> Result<()> {
        self.recorder.record_step(optimizer, step_idx)?;
        if step_idx + 1 < self.epoch_num_steps {
            self.apply_step(optimizer, step_idx as f64)?;
        }
        Ok(())
    }

    fn event_after_train_epoch(&mut self, optimizer: &mut dyn ParamGroupSet) -> Result<()> {
        self.curr_epoch += 1;
        self.recorder.finish(optimizer)
    }

    fn current_epoch(&self) -> u32 {
        self.curr_epoch
    }

    fn last_epoch_lrs(&self) -> Option<&LrSnapshot> {
        self.recorder.last_epoch()
    }

    fn restore_base_lrs(&mut self, base_lrs: LrMap) {
        self.base_lrs = base_lrs;
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let state = LinearState {
            curr_epoch: self.curr_epoch,
            base_lr_dict: self.base_lrs.clone(),
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        let state: LinearState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        self.curr_epoch = state.curr_epoch;
        self.base_lrs = state.base_lr_dict;
        Ok(())
    }
}
