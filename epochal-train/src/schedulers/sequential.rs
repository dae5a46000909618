//! Composite LR schedule that chains sub-schedules at epoch milestones.

use std::path::{Path, PathBuf};

use epochal_core::persistence::{
    INTERNAL_STATE_FILE, ensure_dir, load_state_file, recreate_dir, save_state_file,
};
use epochal_core::{ConfigError, LrMap, ParamGroupSet, Result, StateError, read_lrs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LrSchedule, LrScheduler, LrSnapshot};

/// Delegates every event to one active sub-schedule.
///
/// Sub-schedule `i` is responsible for epochs up to and including
/// `milestones[i]`; the last one runs indefinitely. When a sub-schedule
/// becomes active it receives the live rates as its base rates and is
/// initialized at `start_epochs[i]` plus the epochs already elapsed past
/// the previous milestone.
#[derive(Debug, Clone)]
pub struct SequentialLr {
    schedulers: Vec<LrScheduler>,
    start_epochs: Vec<u32>,
    milestones: Vec<u32>,
    curr_epoch: u32,
    curr_idx: usize,
    curr_base_lrs: Option<LrMap>,
    init_next: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct SequentialState {
    curr_epoch: u32,
    curr_sched_idx: usize,
    init_next_sched: bool,
    curr_sched_base_lr_dict: Option<LrMap>,
}

fn sub_dir(dir: &Path, idx: usize) -> PathBuf {
    dir.join(format!("sched_{idx}"))
}

impl SequentialLr {
    pub fn new(
        schedulers: Vec<LrScheduler>,
        start_epochs: Vec<u32>,
        milestones: Vec<u32>,
    ) -> Result<Self> {
        if schedulers.is_empty() {
            return Err(ConfigError::invalid("sequential schedule needs at least one sub-schedule").into());
        }
        if start_epochs.len() != schedulers.len() {
            return Err(ConfigError::invalid(format!(
                "sequential schedule has {} sub-schedules but {} start epochs",
                schedulers.len(),
                start_epochs.len()
            ))
            .into());
        }
        if milestones.len() + 1 != schedulers.len() {
            return Err(ConfigError::invalid(format!(
                "sequential schedule with {} sub-schedules needs {} milestones, got {}",
                schedulers.len(),
                schedulers.len() - 1,
                milestones.len()
            ))
            .into());
        }
        if milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid("sequential milestones must be strictly increasing").into());
        }
        if start_epochs.contains(&0) {
            return Err(ConfigError::invalid("sequential start epochs begin at 1").into());
        }
        Ok(Self {
            schedulers,
            start_epochs,
            milestones,
            curr_epoch: 1,
            curr_idx: 0,
            curr_base_lrs: None,
            init_next: true,
        })
    }

    /// Index of the sub-schedule currently receiving events.
    pub fn active_index(&self) -> usize {
        self.curr_idx
    }

    pub fn active(&self) -> &LrScheduler {
        &self.schedulers[self.curr_idx]
    }

    /// Last epoch of the sub-schedule before `idx`; `0` for the first.
    fn last_milestone(&self, idx: usize) -> u32 {
        match idx {
            0 => 0,
            idx => self.milestones[idx - 1],
        }
    }

    /// Epoch the active sub-schedule is initialized at for the current epoch.
    fn effective_start_epoch(&self) -> Result<u32> {
        let elapsed = self
            .curr_epoch
            .checked_sub(self.last_milestone(self.curr_idx) + 1)
            .ok_or_else(|| {
                ConfigError::invalid(format!(
                    "epoch {} precedes sub-schedule {}",
                    self.curr_epoch, self.curr_idx
                ))
            })?;
        Ok(self.start_epochs[self.curr_idx] + elapsed)
    }

    fn advance(&mut self) {
        while self
            .milestones
            .get(self.curr_idx)
            .is_some_and(|&milestone| self.curr_epoch > milestone)
        {
            self.curr_idx += 1;
            self.init_next = true;
        }
    }
}

impl LrSchedule for SequentialLr {
    fn name(&self) -> &'static str {
        "sequential"
    }

    // Sub-schedules take their base rates from the optimizer when activated.
    fn initialize(
        &mut self,
        _optimizer: &mut dyn ParamGroupSet,
        start_epoch: u32,
        _base_lrs: Option<LrMap>,
    ) -> Result<()> {
        if start_epoch > self.curr_epoch {
            debug!(from = self.curr_epoch, to = start_epoch, "Sequential LR fast-forward");
            self.curr_epoch = start_epoch;
        }
        Ok(())
    }

    fn event_before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        num_steps: usize,
    ) -> Result<()> {
        let previous = self.curr_idx;
        self.advance();
        if self.curr_idx != previous {
            info!(
                epoch = self.curr_epoch,
                from = previous,
                to = self.curr_idx,
                "Sequential LR switched sub-schedule"
            );
        }

        if self.init_next {
            let start_epoch = self.effective_start_epoch()?;
            let base_lrs = read_lrs(optimizer)?;
            debug!(
                epoch = self.curr_epoch,
                index = self.curr_idx,
                start_epoch,
                "Initializing sub-schedule"
            );
            self.curr_base_lrs = Some(base_lrs.clone());
            self.schedulers[self.curr_idx].initialize(optimizer, start_epoch, Some(base_lrs))?;
            self.init_next = false;
        }

        self.schedulers[self.curr_idx].event_before_train_epoch(optimizer, num_steps)
    }

    fn event_after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        step_idx: usize,
    ) -> Result<()> {
        self.schedulers[self.curr_idx].event_after_train_step(optimizer, step_idx)
    }

    fn event_after_train_epoch(&mut self, optimizer: &mut dyn ParamGroupSet) -> Result<()> {
        self.schedulers[self.curr_idx].event_after_train_epoch(optimizer)?;
        self.curr_epoch += 1;
        Ok(())
    }

    fn current_epoch(&self) -> u32 {
        self.curr_epoch
    }

    fn last_epoch_lrs(&self) -> Option<&LrSnapshot> {
        self.schedulers[self.curr_idx].last_epoch_lrs()
    }

    fn restore_base_lrs(&mut self, base_lrs: LrMap) {
        self.schedulers[self.curr_idx].restore_base_lrs(base_lrs);
    }

    fn save(&self, dir: &Path) -> Result<()> {
        ensure_dir(dir)?;
        for (idx, sched) in self.schedulers.iter().enumerate() {
            let sub = recreate_dir(&sub_dir(dir, idx))?;
            sched.save(&sub)?;
        }
        let state = SequentialState {
            curr_epoch: self.curr_epoch,
            curr_sched_idx: self.curr_idx,
            init_next_sched: self.init_next,
            curr_sched_base_lr_dict: self.curr_base_lrs.clone(),
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        for (idx, sched) in self.schedulers.iter_mut().enumerate() {
            sched.load(&sub_dir(dir, idx))?;
        }
        let state: SequentialState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        let malformed = |message: String| StateError::Malformed {
            path: dir.join(INTERNAL_STATE_FILE),
            message,
        };
        if state.curr_sched_idx >= self.schedulers.len() {
            return Err(malformed(format!(
                "active sub-schedule {} out of range for {} sub-schedules",
                state.curr_sched_idx,
                self.schedulers.len()
            ))
            .into());
        }
        if state.curr_epoch == 0 {
            return Err(malformed("epochs start at 1, got 0".to_string()).into());
        }
        let last_milestone = self.last_milestone(state.curr_sched_idx);
        if state.curr_epoch <= last_milestone {
            return Err(malformed(format!(
                "epoch {} is not past milestone {} of active sub-schedule {}",
                state.curr_epoch, last_milestone, state.curr_sched_idx
            ))
            .into());
        }
        self.curr_epoch = state.curr_epoch;
        self.curr_idx = state.curr_sched_idx;
        self.init_next = state.init_next_sched;
        self.curr_base_lrs = state.curr_sched_base_lr_dict;
        if let Some(base_lrs) = self.curr_base_lrs.clone() {
            self.schedulers[self.curr_idx].restore_base_lrs(base_lrs);
        }
        Ok(())
    }
}
