//! Optimizer boundary: named parameter groups and their learning rates.
//!
//! The optimizer itself lives outside this workspace. Policies only see it
//! through [`ParamGroupSet`] and always address groups by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PolicyError, Result, StateError};

/// Learning rates keyed by parameter-group name.
pub type LrMap = BTreeMap<String, f64>;

/// Storage of a parameter group's learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LearningRate {
    /// A plain number.
    Scalar(f64),
    /// A single-element buffer that is written in place.
    Tensor(Vec<f64>),
}

impl LearningRate {
    pub fn get(&self, name: &str) -> Result<f64> {
        match self {
            LearningRate::Scalar(lr) => Ok(*lr),
            LearningRate::Tensor(buf) => match buf.as_slice() {
                [lr] => Ok(*lr),
                _ => Err(shape_mismatch(name, buf.len())),
            },
        }
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match self {
            LearningRate::Scalar(lr) => *lr = value,
            LearningRate::Tensor(buf) => {
                if buf.len() != 1 {
                    return Err(shape_mismatch(name, buf.len()));
                }
                buf.fill(value);
            }
        }
        Ok(())
    }
}

fn shape_mismatch(name: &str, actual: usize) -> crate::error::EpochalError {
    StateError::ShapeMismatch {
        name: name.to_string(),
        expected: 1,
        actual,
    }
    .into()
}

/// A named group of optimizable parameters sharing one learning rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamGroup {
    pub name: String,
    pub lr: LearningRate,
}

impl ParamGroup {
    pub fn new(name: impl Into<String>, lr: f64) -> Self {
        Self {
            name: name.into(),
            lr: LearningRate::Scalar(lr),
        }
    }

    pub fn tensor(name: impl Into<String>, lr: f64) -> Self {
        Self {
            name: name.into(),
            lr: LearningRate::Tensor(vec![lr]),
        }
    }
}

/// The optimizer seam: an ordered collection of named parameter groups.
pub trait ParamGroupSet {
    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];
}

/// Plain in-memory parameter groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamGroups {
    groups: Vec<ParamGroup>,
}

impl ParamGroups {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self { groups }
    }

    /// Build scalar groups from `(name, lr)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, lr)| ParamGroup::new(name, lr))
                .collect(),
        )
    }

    /// Current learning rate of the group called `name`.
    pub fn lr(&self, name: &str) -> Result<f64> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| unknown_group(name))?
            .lr
            .get(name)
    }
}

impl ParamGroupSet for ParamGroups {
    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }
}

fn unknown_group(name: &str) -> crate::error::EpochalError {
    PolicyError::UnknownParamGroup {
        name: name.to_string(),
    }
    .into()
}

/// Snapshot the learning rate of every parameter group.
pub fn read_lrs(optimizer: &dyn ParamGroupSet) -> Result<LrMap> {
    optimizer
        .param_groups()
        .iter()
        .map(|g| Ok((g.name.clone(), g.lr.get(&g.name)?)))
        .collect()
}

/// Write learning rates by name; every group must have an entry in `lrs`.
pub fn write_lrs(optimizer: &mut dyn ParamGroupSet, lrs: &LrMap) -> Result<()> {
    for group in optimizer.param_groups_mut() {
        let lr = *lrs.get(&group.name).ok_or_else(|| unknown_group(&group.name))?;
        group.lr.set(&group.name, lr)?;
    }
    Ok(())
}

/// Multiply every entry of `lrs` by `factor`.
pub fn scale_lrs(lrs: &LrMap, factor: f64) -> LrMap {
    lrs.iter()
        .map(|(name, lr)| (name.clone(), lr * factor))
        .collect()
}
