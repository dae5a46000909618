//! Configuration types for the training control policies.
//!
//! Every policy is selected and parameterized here; nothing is read from
//! the environment at construction time. Use [`load_config`] to layer a TOML
//! file and `EPOCHAL_*` variables over the defaults.

use std::collections::BTreeMap;
use std::path::Path;

use epochal_core::ConfigError;
use serde::{Deserialize, Serialize};

/// Top-level configuration of a [`TrainingControl`](crate::TrainingControl).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Learning-rate schedule.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Early stopping policy.
    #[serde(default)]
    pub early_stop: EarlyStopConfig,
    /// Checkpoint saving policy.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Loss weighting strategy.
    #[serde(default)]
    pub loss_weights: LossWeightConfig,
}

/// Learning-rate schedule selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    Linear(LinearConfig),
    Exponential(ExponentialConfig),
    Sequential(SequentialConfig),
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig::Linear(LinearConfig::default())
    }
}

/// Linear ramp of the LR factor between `start_factor` and `end_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    #[serde(default = "default_factor")]
    pub start_factor: f64,
    #[serde(default = "default_factor")]
    pub end_factor: f64,
    /// Epochs the ramp lasts; past this the trend continues.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: u32,
    /// Epoch the schedule believes it starts at.
    #[serde(default = "default_start_epoch")]
    pub start_epoch: u32,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            start_factor: default_factor(),
            end_factor: default_factor(),
            num_epochs: default_num_epochs(),
            start_epoch: default_start_epoch(),
        }
    }
}

/// Per-epoch multiplicative decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExponentialConfig {
    #[serde(default = "default_factor")]
    pub gamma: f64,
}

impl Default for ExponentialConfig {
    fn default() -> Self {
        Self {
            gamma: default_factor(),
        }
    }
}

/// Sub-schedules chained at epoch milestones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SequentialConfig {
    pub schedulers: Vec<SchedulerConfig>,
    /// Epoch each sub-schedule is initialized at when it becomes active.
    pub start_epochs: Vec<u32>,
    /// Last epoch each sub-schedule (except the last) is responsible for.
    pub milestones: Vec<u32>,
}

/// Quantity the early stopper tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// Weighted sum of the latest validation losses.
    #[default]
    ValidationLoss,
    /// Weighted sum of the latest training losses.
    TrainingLoss,
}

/// Early stopping policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopConfig {
    /// Epochs to wait before patience starts decreasing.
    #[serde(default)]
    pub startup: u32,
    /// Non-improving epochs tolerated before stopping.
    #[serde(default = "default_patience")]
    pub patience: u32,
    /// Hard epoch limit.
    #[serde(default)]
    pub max_epochs: Option<u32>,
    /// Minimum absolute change that counts as improvement.
    #[serde(default)]
    pub abs_tol: Option<f64>,
    /// Minimum relative change that counts as improvement.
    #[serde(default)]
    pub rel_tol: Option<f64>,
    #[serde(default = "default_true")]
    pub minimize: bool,
    #[serde(default)]
    pub target: TargetKind,
}

impl Default for EarlyStopConfig {
    fn default() -> Self {
        Self {
            startup: 0,
            patience: default_patience(),
            max_epochs: None,
            abs_tol: None,
            rel_tol: None,
            minimize: true,
            target: TargetKind::default(),
        }
    }
}

/// Checkpoint saving policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save regularly every `period_step` epochs from `period_start`.
    #[serde(default)]
    pub period_active: bool,
    #[serde(default)]
    pub period_start: u32,
    #[serde(default = "default_period_step")]
    pub period_step: u32,
    /// Save whenever the early stopper reports an improvement.
    #[serde(default)]
    pub improvement_active: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            period_active: false,
            period_start: 0,
            period_step: default_period_step(),
            improvement_active: false,
        }
    }
}

/// Loss weighting strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossWeightConfig {
    #[default]
    Uniform,
    Static {
        weights: BTreeMap<String, f64>,
    },
    Dynamic {
        #[serde(default = "default_temperature")]
        temperature: f64,
    },
}

fn default_factor() -> f64 {
    1.0
}

fn default_num_epochs() -> u32 {
    1
}

fn default_start_epoch() -> u32 {
    1
}

fn default_patience() -> u32 {
    1
}

fn default_period_step() -> u32 {
    1
}

fn default_temperature() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Load a [`ControlConfig`] from defaults, an optional TOML file and `EPOCHAL_*` variables.
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&ControlConfig>,
) -> Result<ControlConfig, ConfigError> {
    epochal_core::config::load_layered(path, overrides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_control_config() {
        let config = ControlConfig::default();
        assert_eq!(config.early_stop.patience, 1);
        assert!(config.early_stop.minimize);
        assert_eq!(config.checkpoint.period_step, 1);
        assert_eq!(config.loss_weights, LossWeightConfig::Uniform);
        assert!(matches!(config.scheduler, SchedulerConfig::Linear(_)));
    }

    #[test]
    fn test_parse_sequential_toml() {
        let source = r#"
            [scheduler]
            type = "sequential"
            start_epochs = [1, 1]
            milestones = [5]

            [[scheduler.schedulers]]
            type = "linear"
            start_factor = 0.1
            end_factor = 1.0
            num_epochs = 5

            [[scheduler.schedulers]]
            type = "exponential"
            gamma = 0.9

            [early_stop]
            patience = 3
            abs_tol = 0.01

            [checkpoint]
            period_active = true
            period_step = 2
            improvement_active = true

            [loss_weights]
            type = "static"
            weights = { cls = 2.0, attr = 0.5 }
        "#;
        let config: ControlConfig = epochal_core::config::from_toml_str(source).unwrap();

        let SchedulerConfig::Sequential(seq) = &config.scheduler else {
            panic!("expected sequential scheduler");
        };
        assert_eq!(seq.milestones, vec![5]);
        assert_eq!(
            seq.schedulers[1],
            SchedulerConfig::Exponential(ExponentialConfig { gamma: 0.9 })
        );
        assert_eq!(config.early_stop.abs_tol, Some(0.01));
        assert_eq!(config.early_stop.rel_tol, None);
        assert!(config.checkpoint.improvement_active);
        assert_eq!(
            config.loss_weights,
            LossWeightConfig::Static {
                weights: BTreeMap::from([("attr".into(), 0.5), ("cls".into(), 2.0)]),
            }
        );
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ControlConfig {
            loss_weights: LossWeightConfig::Dynamic { temperature: 2.0 },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ControlConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
