//! Exponential LR schedule.

use std::path::Path;

use epochal_core::persistence::{INTERNAL_STATE_FILE, load_state_file, save_state_file};
use epochal_core::{LrMap, ParamGroupSet, Result, read_lrs, scale_lrs, write_lrs};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::snapshot::EpochLrRecorder;
use super::{LrSchedule, LrSnapshot};
use crate::config::ExponentialConfig;

/// Multiplies the live rates by `gamma` before every epoch except the first.
///
/// The rates the optimizer was built with are used for the first epoch.
/// Resuming at a later epoch applies `gamma^(start_epoch - curr_epoch)` once.
#[derive(Debug, Clone)]
pub struct ExponentialLr {
    gamma: f64,
    curr_epoch: u32,
    first_update: bool,
    recorder: EpochLrRecorder,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExponentialState {
    curr_epoch: u32,
    first_update: bool,
}

impl ExponentialLr {
    pub fn new(config: &ExponentialConfig) -> Self {
        Self {
            gamma: config.gamma,
            curr_epoch: 1,
            first_update: true,
            recorder: EpochLrRecorder::default(),
        }
    }

    fn scale(&self, optimizer: &mut dyn ParamGroupSet, factor: f64) -> Result<()> {
        let lrs = read_lrs(optimizer)?;
        write_lrs(optimizer, &scale_lrs(&lrs, factor))
    }
}

impl LrSchedule for ExponentialLr {
    fn name(&self) -> &'static str {
        "exponential"
    }

    fn initialize(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        start_epoch: u32,
        _base_lrs: Option<LrMap>,
    ) -> Result<()> {
        if start_epoch > self.curr_epoch {
            let skipped = start_epoch - self.curr_epoch;
            debug!(from = self.curr_epoch, to = start_epoch, "Exponential LR fast-forward");
            self.scale(optimizer, self.gamma.powi(skipped as i32))?;
            self.curr_epoch = start_epoch;
        }
        Ok(())
    }

    fn event_before_train_epoch(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        num_steps: usize,
    ) -> Result<()> {
        if self.first_update {
            self.first_update = false;
        } else {
            self.scale(optimizer, self.gamma)?;
        }
        debug!(epoch = self.curr_epoch, gamma = self.gamma, "Exponential LR epoch");
        self.recorder.begin(optimizer, num_steps)
    }

    fn event_after_train_step(
        &mut self,
        optimizer: &mut dyn ParamGroupSet,
        step_idx: usize,
    ) -> Result<()> {
        self.recorder.record_step(optimizer, step_idx)
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

    // Works on the live rates; there is no base to restore.
    fn restore_base_lrs(&mut self, _base_lrs: LrMap) {}

    fn save(&self, dir: &Path) -> Result<()> {
        let state = ExponentialState {
            curr_epoch: self.curr_epoch,
            first_update: self.first_update,
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        let state: ExponentialState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        self.curr_epoch = state.curr_epoch;
        self.first_update = state.first_update;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::test_support::run_epoch;
    use epochal_core::ParamGroups;
    use tempfile::TempDir;

    fn sched(gamma: f64) -> ExponentialLr {
        ExponentialLr::new(&ExponentialConfig { gamma })
    }

    #[test]
    fn test_first_epoch_uses_base_rate() {
        let mut opt = ParamGroups::from_pairs([("head", 1.0)]);
        let mut s = sched(0.5);

        assert_eq!(run_epoch(&mut s, &mut opt, 2, "head"), vec![1.0, 1.0]);
        assert_eq!(run_epoch(&mut s, &mut opt, 2, "head"), vec![0.5, 0.5]);
        assert_eq!(run_epoch(&mut s, &mut opt, 1, "head"), vec![0.25]);
        assert_eq!(s.last_epoch_lrs().unwrap().last["head"], 0.25);
    }

    #[test]
    fn test_initialize_matches_unresumed_run() {
        let mut reference = ParamGroups::from_pairs([("head", 1.0), ("body", 0.1)]);
        let mut s = sched(0.9);
        for _ in 1..5 {
            run_epoch(&mut s, &mut reference, 1, "head");
        }
        let expected = run_epoch(&mut s, &mut reference, 1, "head");

        let mut opt = ParamGroups::from_pairs([("head", 1.0), ("body", 0.1)]);
        let mut resumed = sched(0.9);
        resumed.initialize(&mut opt, 5, None).unwrap();
        assert_eq!(resumed.current_epoch(), 5);
        let actual = run_epoch(&mut resumed, &mut opt, 1, "head");

        assert!((actual[0] - expected[0]).abs() < 1e-12);
        assert!((opt.lr("body").unwrap() - 0.1 * 0.9f64.powi(4)).abs() < 1e-12);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut opt = ParamGroups::from_pairs([("head", 1.0)]);
        let mut s = sched(0.8);
        for _ in 0..3 {
            run_epoch(&mut s, &mut opt, 2, "head");
        }
        s.save(dir.path()).unwrap();

        let mut resumed_opt = opt.clone();
        let mut resumed = sched(0.8);
        resumed.load(dir.path()).unwrap();
        assert_eq!(resumed.current_epoch(), 4);

        for _ in 0..5 {
            assert_eq!(
                run_epoch(&mut resumed, &mut resumed_opt, 2, "head"),
                run_epoch(&mut s, &mut opt, 2, "head")
            );
        }
    }
}
