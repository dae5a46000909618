//! Per-epoch learning-rate diagnostics shared by every schedule.

use std::collections::BTreeMap;
use std::path::Path;

use epochal_core::persistence::{
    FINAL_LR_FILE, INIT_LR_FILE, STEP_LR_FILE, load_state_file, save_state_file,
};
use epochal_core::{LrMap, ParamGroupSet, PolicyError, Result, StateError, read_lrs};
use serde::{Deserialize, Serialize};

/// Learning rates observed during one epoch, keyed by parameter-group name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LrSnapshot {
    /// Rates in effect when the epoch's first step started.
    pub init: LrMap,
    /// Rate in effect during each step of the epoch.
    pub steps: BTreeMap<String, Vec<f64>>,
    /// Rates left in the optimizer when the epoch ended.
    pub last: LrMap,
}

impl LrSnapshot {
    /// Persist the snapshot as `init_lr_dict`, `step_lr_arr_dict` and `final_lr_dict`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        save_state_file(dir, INIT_LR_FILE, &self.init)?;
        save_state_file(dir, STEP_LR_FILE, &self.steps)?;
        save_state_file(dir, FINAL_LR_FILE, &self.last)?;
        Ok(())
    }

    /// Load a snapshot written by [`LrSnapshot::save`].
    ///
    /// Every group must carry a step trace, and all traces must share one length.
    pub fn load(dir: &Path) -> Result<Self> {
        let init: LrMap = load_state_file(dir, INIT_LR_FILE)?;
        let steps: BTreeMap<String, Vec<f64>> = load_state_file(dir, STEP_LR_FILE)?;
        let last: LrMap = load_state_file(dir, FINAL_LR_FILE)?;

        let expected = steps.values().next().map_or(0, Vec::len);
        for name in init.keys() {
            let actual = steps.get(name).map(Vec::len).ok_or_else(|| {
                StateError::Malformed {
                    path: dir.join(STEP_LR_FILE),
                    message: format!("missing step trace for '{name}'"),
                }
            })?;
            if actual != expected {
                return Err(StateError::ShapeMismatch {
                    name: name.clone(),
                    expected,
                    actual,
                }
                .into());
            }
        }
        Ok(Self { init, steps, last })
    }
}

/// Accumulates an [`LrSnapshot`] across the lifecycle events of one epoch.
#[derive(Debug, Clone, Default)]
pub(crate) struct EpochLrRecorder {
    current: Option<LrSnapshot>,
    completed: Option<LrSnapshot>,
}

impl EpochLrRecorder {
    /// Register the starting rates and allocate a trace of `num_steps` entries.
    pub(crate) fn begin(&mut self, optimizer: &dyn ParamGroupSet, num_steps: usize) -> Result<()> {
        let init = read_lrs(optimizer)?;
        let steps = init
            .iter()
            .map(|(name, lr)| (name.clone(), vec![*lr; num_steps]))
            .collect();
        self.current = Some(LrSnapshot {
            init,
            steps,
            last: LrMap::new(),
        });
        Ok(())
    }

    /// Store the rates in effect during `step_idx`.
    pub(crate) fn record_step(&mut self, optimizer: &dyn ParamGroupSet, step_idx: usize) -> Result<()> {
        let Some(snapshot) = self.current.as_mut() else {
            return Ok(());
        };
        for (name, lr) in read_lrs(optimizer)? {
            let trace = snapshot
                .steps
                .get_mut(&name)
                .ok_or(PolicyError::UnknownParamGroup { name: name.clone() })?;
            let len = trace.len();
            let slot = trace
                .get_mut(step_idx)
                .ok_or_else(|| StateError::ShapeMismatch {
                    name: name.clone(),
                    expected: len,
                    actual: step_idx + 1,
                })?;
            *slot = lr;
        }
        Ok(())
    }

    /// Register the final rates and publish the epoch's snapshot.
    pub(crate) fn finish(&mut self, optimizer: &dyn ParamGroupSet) -> Result<()> {
        if let Some(mut snapshot) = self.current.take() {
            snapshot.last = read_lrs(optimizer)?;
            self.completed = Some(snapshot);
        }
        Ok(())
    }

    pub(crate) fn last_epoch(&self) -> Option<&LrSnapshot> {
        self.completed.as_ref()
    }
}

/// Save a schedule's last completed epoch, failing if none exists yet.
pub(crate) fn save_last_epoch(snapshot: Option<&LrSnapshot>, policy: &str, dir: &Path) -> Result<()> {
    snapshot
        .ok_or_else(|| PolicyError::NoEpochData {
            policy: policy.to_string(),
        })?
        .save(dir)
}
