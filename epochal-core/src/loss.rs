//! Loss registers: per-epoch loss totals grouped by phase and loss key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline phase a loss register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Val,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Val => write!(f, "val"),
        }
    }
}

/// Append-only history of one loss term's per-epoch totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossRegister {
    epoch_total_losses: Vec<f64>,
}

impl LossRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_epoch(&mut self, total: f64) {
        self.epoch_total_losses.push(total);
    }

    /// Total of the most recent epoch.
    pub fn last(&self) -> Option<f64> {
        self.epoch_total_losses.last().copied()
    }

    /// Total `back` epochs before the most recent one.
    pub fn nth_back(&self, back: usize) -> Option<f64> {
        self.epoch_total_losses.iter().rev().nth(back).copied()
    }

    pub fn history(&self) -> &[f64] {
        &self.epoch_total_losses
    }

    pub fn len(&self) -> usize {
        self.epoch_total_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epoch_total_losses.is_empty()
    }
}

/// All loss registers of a pipeline, indexed by phase and loss key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossRegisterPool {
    registers: BTreeMap<Phase, BTreeMap<String, LossRegister>>,
}

impl LossRegisterPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an epoch total, creating the register on first use.
    pub fn record(&mut self, phase: Phase, key: impl Into<String>, total: f64) {
        self.registers
            .entry(phase)
            .or_default()
            .entry(key.into())
            .or_default()
            .push_epoch(total);
    }

    pub fn register(&self, phase: Phase, key: &str) -> Option<&LossRegister> {
        self.registers.get(&phase)?.get(key)
    }

    /// Registers of one phase, in key order.
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = (&str, &LossRegister)> {
        self.registers
            .get(&phase)
            .into_iter()
            .flat_map(|regs| regs.iter().map(|(k, r)| (k.as_str(), r)))
    }

    /// Most recent epoch total of every register in `phase` that has one.
    pub fn last_epoch_losses(&self, phase: Phase) -> BTreeMap<String, f64> {
        self.phase(phase)
            .filter_map(|(key, reg)| reg.last().map(|v| (key.to_string(), v)))
            .collect()
    }

    /// Every loss key seen in any phase.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .registers
            .values()
            .flat_map(|regs| regs.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
