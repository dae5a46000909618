//! Checkpoint saving policy.

use std::path::Path;

use epochal_core::persistence::{INTERNAL_STATE_FILE, load_state_file, save_state_file};
use epochal_core::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CheckpointConfig;
use crate::early_stop::EarlyStopPolicy;

/// Decides at the end of each epoch whether model checkpoints are written.
///
/// Periodic and improvement triggers are independent; either one saves.
/// The initialization epoch (epoch 0) never saves.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy {
    period_active: bool,
    period_start: u32,
    period_step: u32,
    improvement_active: bool,
    curr_epoch: i64,
    save_checkpoints: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointState {
    curr_epoch_num: i64,
    save_checkpoints: bool,
}

impl CheckpointPolicy {
    pub fn new(config: &CheckpointConfig) -> Result<Self> {
        if config.period_active && config.period_step == 0 {
            return Err(ConfigError::invalid("checkpoint `period_step` must be > 0").into());
        }
        Ok(Self {
            period_active: config.period_active,
            period_start: config.period_start,
            period_step: config.period_step,
            improvement_active: config.improvement_active,
            curr_epoch: -1,
            save_checkpoints: false,
        })
    }

    fn periodic_hit(&self) -> bool {
        let offset = self.curr_epoch - i64::from(self.period_start);
        offset.rem_euclid(i64::from(self.period_step)) == 0
    }

    /// Advance one epoch; call after the early stopper has been updated.
    pub fn update(&mut self, early_stop: &EarlyStopPolicy) {
        self.curr_epoch += 1;
        self.save_checkpoints = false;

        if self.period_active && self.periodic_hit() {
            self.save_checkpoints = true;
        }
        if self.improvement_active && early_stop.improvement() {
            self.save_checkpoints = true;
        }
        debug!(
            epoch = self.curr_epoch,
            save = self.save_checkpoints(),
            "Checkpoint decision"
        );
    }

    pub fn save_checkpoints(&self) -> bool {
        self.curr_epoch > 0 && self.save_checkpoints
    }

    /// Epoch counter; `-1` before the first update.
    pub fn current_epoch(&self) -> i64 {
        self.curr_epoch
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let state = CheckpointState {
            curr_epoch_num: self.curr_epoch,
            save_checkpoints: self.save_checkpoints,
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    pub fn load(&mut self, dir: &Path) -> Result<()> {
        let state: CheckpointState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        self.curr_epoch = state.curr_epoch_num;
        self.save_checkpoints = state.save_checkpoints;
        Ok(())
    }
}
