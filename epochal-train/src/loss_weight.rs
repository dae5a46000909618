//! Loss weighting strategies.
//!
//! A loss weighter decides how much each named loss term contributes to
//! the total. Weights may only change inside lifecycle hooks; reading a
//! weight never mutates state.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::Path;

use async_trait::async_trait;
use epochal_core::persistence::{
    INTERNAL_STATE_FILE, atomic_write_json, load_state_file, save_state_file,
};
use epochal_core::{
    AbortCoordinator, ConfigError, LossRegisterPool, Phase, PolicyError, Result,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LossWeightConfig;

/// Phase name used when broadcasting weights from the primary worker.
const SYNC_PHASE: &str = "loss_weights";

/// Strategy for per-loss weights.
#[async_trait]
pub trait LossWeighter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Weight of the loss registered under `key`.
    fn get_loss_weight(&self, key: &str) -> f64;

    fn event_before_train_epoch(&mut self, _pool: &LossRegisterPool) {}

    fn event_after_train_step(&mut self, _pool: &LossRegisterPool) {}

    fn event_after_train_epoch(&mut self, _pool: &LossRegisterPool) {}

    fn event_before_val_epoch(&mut self, _pool: &LossRegisterPool) {}

    fn event_after_val_epoch(&mut self, _pool: &LossRegisterPool) {}

    /// Make every worker hold the primary worker's weights.
    async fn synchronize(&mut self, _coordinator: &mut AbortCoordinator) -> Result<()> {
        Err(PolicyError::unimplemented(self.name(), "synchronize").into())
    }

    /// Write `{key: weight}` for `keys` to `path`. The parent directory must exist.
    fn save_loss_weights(&self, path: &Path, keys: &[String]) -> Result<()> {
        let weights: BTreeMap<&str, f64> = keys
            .iter()
            .map(|key| (key.as_str(), self.get_loss_weight(key)))
            .collect();
        atomic_write_json(path, &weights)?;
        Ok(())
    }

    fn save(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn load(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Every loss weighs 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformLossWeighter;

#[async_trait]
impl LossWeighter for UniformLossWeighter {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn get_loss_weight(&self, _key: &str) -> f64 {
        1.0
    }

    async fn synchronize(&mut self, _coordinator: &mut AbortCoordinator) -> Result<()> {
        Ok(())
    }
}

/// Fixed weights looked up by key; unknown keys weigh 1.0.
#[derive(Debug, Clone, Default)]
pub struct StaticLossWeighter {
    weights: BTreeMap<String, f64>,
}

impl StaticLossWeighter {
    pub fn new(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }
}

#[async_trait]
impl LossWeighter for StaticLossWeighter {
    fn name(&self) -> &'static str {
        "static"
    }

    fn get_loss_weight(&self, key: &str) -> f64 {
        self.weights.get(key).copied().unwrap_or(1.0)
    }

    async fn synchronize(&mut self, _coordinator: &mut AbortCoordinator) -> Result<()> {
        Ok(())
    }
}

/// Dynamic weight averaging over the training losses.
///
/// Before each training epoch, every key with at least two recorded epochs
/// gets `K * softmax(r / T)`, where `r` is the ratio of its last two epoch
/// totals and `K` the number of such keys. Other keys weigh 1.0.
#[derive(Debug, Clone)]
pub struct DynamicLossWeighter {
    temperature: f64,
    weights: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DynamicState {
    weights: BTreeMap<String, f64>,
}

impl DynamicLossWeighter {
    pub fn new(temperature: f64) -> Self {
        Self {
            temperature,
            weights: BTreeMap::new(),
        }
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    fn recompute(&mut self, pool: &LossRegisterPool) {
        let ratios: Vec<(String, f64)> = pool
            .phase(Phase::Train)
            .filter_map(|(key, reg)| {
                let last = reg.nth_back(0)?;
                let prev = reg.nth_back(1)?;
                let ratio = if prev == 0.0 { 1.0 } else { last / prev };
                Some((key.to_string(), ratio))
            })
            .collect();

        if ratios.is_empty() {
            self.weights.clear();
            return;
        }

        let scaled: Vec<f64> = ratios.iter().map(|(_, r)| r / self.temperature).collect();
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scaled.iter().map(|s| (s - max).exp()).collect();
        let sum: f64 = exps.iter().sum();
        let count = ratios.len() as f64;

        self.weights = ratios
            .into_iter()
            .zip(exps)
            .map(|((key, _), e)| (key, count * e / sum))
            .collect();
        debug!(weights = ?self.weights, "Dynamic loss weights updated");
    }
}

#[async_trait]
impl LossWeighter for DynamicLossWeighter {
    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn get_loss_weight(&self, key: &str) -> f64 {
        self.weights.get(key).copied().unwrap_or(1.0)
    }

    fn event_before_train_epoch(&mut self, pool: &LossRegisterPool) {
        self.recompute(pool);
    }

    async fn synchronize(&mut self, coordinator: &mut AbortCoordinator) -> Result<()> {
        let weights = &self.weights;
        let shared = coordinator
            .primary_phase(SYNC_PHASE, || Ok::<_, Infallible>(weights.clone()))
            .await?;
        self.weights = shared;
        Ok(())
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let state = DynamicState {
            weights: self.weights.clone(),
        };
        save_state_file(dir, INTERNAL_STATE_FILE, &state)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        let state: DynamicState = load_state_file(dir, INTERNAL_STATE_FILE)?;
        self.weights = state.weights;
        Ok(())
    }
}

/// A loss weighting strategy selected by configuration.
#[derive(Debug, Clone)]
pub enum LossWeightPolicy {
    Uniform(UniformLossWeighter),
    Static(StaticLossWeighter),
    Dynamic(DynamicLossWeighter),
}

impl Default for LossWeightPolicy {
    fn default() -> Self {
        LossWeightPolicy::Uniform(UniformLossWeighter)
    }
}

impl LossWeightPolicy {
    pub fn from_config(config: &LossWeightConfig) -> Result<Self> {
        Ok(match config {
            LossWeightConfig::Uniform => LossWeightPolicy::Uniform(UniformLossWeighter),
            LossWeightConfig::Static { weights } => {
                LossWeightPolicy::Static(StaticLossWeighter::new(weights.clone()))
            }
            LossWeightConfig::Dynamic { temperature } => {
                if !(temperature.is_finite() && *temperature > 0.0) {
                    return Err(ConfigError::invalid(format!(
                        "dynamic loss weighting needs a positive `temperature`, got {temperature}"
                    ))
                    .into());
                }
                LossWeightPolicy::Dynamic(DynamicLossWeighter::new(*temperature))
            }
        })
    }

    fn inner(&self) -> &dyn LossWeighter {
        match self {
            LossWeightPolicy::Uniform(w) => w,
            LossWeightPolicy::Static(w) => w,
            LossWeightPolicy::Dynamic(w) => w,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn LossWeighter {
        match self {
            LossWeightPolicy::Uniform(w) => w,
            LossWeightPolicy::Static(w) => w,
            LossWeightPolicy::Dynamic(w) => w,
        }
    }
}

#[async_trait]
impl LossWeighter for LossWeightPolicy {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn get_loss_weight(&self, key: &str) -> f64 {
        self.inner().get_loss_weight(key)
    }

    fn event_before_train_epoch(&mut self, pool: &LossRegisterPool) {
        self.inner_mut().event_before_train_epoch(pool)
    }

    fn event_after_train_step(&mut self, pool: &LossRegisterPool) {
        self.inner_mut().event_after_train_step(pool)
    }

    fn event_after_train_epoch(&mut self, pool: &LossRegisterPool) {
        self.inner_mut().event_after_train_epoch(pool)
    }

    fn event_before_val_epoch(&mut self, pool: &LossRegisterPool) {
        self.inner_mut().event_before_val_epoch(pool)
    }

    fn event_after_val_epoch(&mut self, pool: &LossRegisterPool) {
        self.inner_mut().event_after_val_epoch(pool)
    }

    async fn synchronize(&mut self, coordinator: &mut AbortCoordinator) -> Result<()> {
        self.inner_mut().synchronize(coordinator).await
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.inner().save(dir)
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        self.inner_mut().load(dir)
    }
}
