//! Patience-based early stopping.

use std::fmt;
use std::path::Path;

use epochal_core::persistence::{INTERNAL_STATE_FILE, load_state_file, save_state_file};
use epochal_core::{ConfigError, LossRegisterPool, Phase, PolicyError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EarlyStopConfig, TargetKind};
use crate::loss_weight::LossWeighter;

/// Computes the scalar an [`EarlyStopPolicy`] tracks.
pub trait TargetValue: fmt::Debug + Send + Sync {
    fn compute(&self, pool: &LossRegisterPool, weighter: &dyn LossWeighter) -> Result<f64>;
}

/// Weighted sum of the most recent validation losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationLoss;

/// Weighted sum of the most recent training losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingLoss;

fn weighted_last_losses(
    pool: &LossRegisterPool,
    weighter: &dyn LossWeighter,
    phase: Phase,
    policy: &str,
) -> Result<f64> {
    let losses = pool.last_epoch_losses(phase);
    if losses.is_empty() {
        return Err(PolicyError::NoEpochData {
            policy: policy.to_string(),
        }
        .into());
    }
    Ok(losses
        .iter()
        .map(|(key, loss)| loss * weighter.get_loss_weight(key))
        .sum())
}

impl TargetValue for ValidationLoss {
    fn compute(&self, pool: &LossRegisterPool, weighter: &dyn LossWeighter) -> Result<f64> {
        weighted_last_losses(pool, weighter, Phase::Val, "validation_loss")
    }
}

impl TargetValue for TrainingLoss {
    fn compute(&self, pool: &LossRegisterPool, weighter: &dyn LossWeighter) -> Result<f64> {
        weighted_last_losses(pool, weighter, Phase::Train, "training_loss")
    }
}

/// Stops training once the target has not improved for `patience` epochs.
///
/// The first [`update`](Self::update) is the initialization epoch (epoch 0):
/// it only records the best value. Patience starts decreasing once the
/// epoch counter passes `startup`.
#[derive(Debug)]
pub struct EarlyStopPolicy {
    startup: u32,
    patience: u32,
    max_epochs: Option<u32>,
    abs_tol: Option<f64>,
    rel_tol: Option<f64>,
    minimize: bool,
    target: Box<dyn TargetValue>,
    curr_epoch: i64,
    best: Option<f64>,
    curr_patience: u32,
    last_value: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EarlyStopState {
    best_target_value: Option<f64>,
    curr_epoch_num: i64,
    curr_patience: u32,
}

impl EarlyStopPolicy {
    pub fn new(config: &EarlyStopConfig, target: Box<dyn TargetValue>) -> Result<Self> {
        if config.abs_tol.is_some() && config.rel_tol.is_some() {
            return Err(ConfigError::ConflictingTolerances.into());
        }
        if config.patience == 0 {
            return Err(ConfigError::invalid("early stopping needs `patience` > 0").into());
        }
        Ok(Self {
            startup: config.startup,
            patience: config.patience,
            max_epochs: config.max_epochs,
            abs_tol: config.abs_tol,
            rel_tol: config.rel_tol,
            minimize: config.minimize,
            target,
            curr_epoch: -1,
            best: None,
            curr_patience: config.patience,
            last_value: None,
        })
    }

    /// Build with the target named by `config.target`.
    pub fn from_config(config: &EarlyStopConfig) -> Result<Self> {
        let target: Box<dyn TargetValue> = match config.target {
            TargetKind::ValidationLoss => Box::new(ValidationLoss),
            TargetKind::TrainingLoss => Box::new(TrainingLoss),
        };
        Self::new(config, target)
    }

    fn threshold(&self, best: f64) -> f64 {
        let sign = if self.minimize { -1.0 } else { 1.0 };
        match (self.abs_tol, self.rel_tol) {
            (Some(abs_tol), _) => best + sign * abs_tol,
            (None, Some(rel_tol)) => best * (1.0 + sign * rel_tol),
            (None, None) => best,
        }
    }

    fn improves(&self, value: f64, best: f64) -> bool {
        let threshold = self.threshold(best);
        if self.minimize {
            value < threshold
        } else {
            value > threshold
        }
    }

    /// Advance one epoch and evaluate the target.
    pub fn update(&mut self, pool: &LossRegisterPool, weighter: &dyn LossWeighter) -> Result<()> {
        let value = self.target.compute(pool, weighter)?;
        self.curr_epoch += 1;
        self.last_value = Some(value);

        let best = match self.best {
            Some(best) if self.curr_epoch > 0 => best,
            _ => {
                debug!(epoch = self.curr_epoch, value, "Early stopping baseline recorded");
                self.best = Some(value);
                return Ok(());
            }
        };

        if self.improves(value, best) {
            debug!(epoch = self.curr_epoch, value, previous = best, "Target improved");
            self.best = Some(value);
            self.curr_patience = self.patience;
        } else if self.curr_epoch > i64::from(self.startup) {
            self.curr_patience = self.curr_patience.saturating_sub(1);
            debug!(
                epoch = self.curr_epoch,
                value,
                best,
                patience = self.curr_patience,
                "No improvement"
            );
        }

        if self.early_stop() {
            info!(
                epoch = self.curr_epoch,
                best = ?self.best,
                patience = self.curr_patience,
                "Early stopping triggered"
            );
        }
        Ok(())
    }

    /// Whether training should stop after this epoch.
    pub fn early_stop(&self) -> bool {
        if self.curr_epoch <= 0 {
            return false;
        }
        let out_of_epochs = self
            .max_epochs
            .is_some_and(|max| self.curr_epoch >= i64::from(max));
        self.curr_patience == 0 || out_of_epochs
    }

    /// Whether this epoch improved on the best target value.
    pub fn improvement(&self) -> bool {
        self.curr_epoch > 0 && self.curr_patience == self.patience
    }

    /// Target computed by the last update.
    pub fn target_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn best_target_value(&self) -> Option<f64> {
        self.best
    }

    /// Epoch counter; `-1` before the first update.
    pub fn current_epoch(&self) -> i64 {
        self.curr_epoch
    }

    pub fn current_patience(&self) -> u32 {
        self.curr_patience
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let state = EarlyStopState {
            best_target_value: self.best,
            curr_epoch_num: self.curr_epoch,
            curr_patience: self.curr_patience,
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    pub fn load(&mut self, dir: &Path) -> Result<()> {
        let state: EarlyStopState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        self.best = state.best_target_value;
        self.curr_epoch = state.curr_epoch_num;
        self.curr_patience = state.curr_patience;
        Ok(())
    }
}
