use crate::cell_data::distinct_in_order;
use crate::lupin_common::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const ENCODER_FILE: &str = "condition_encoder.json";

/// Maps condition labels (batches) to dense indices `0..n`
///
/// Indices are assigned in order of first appearance and never change
/// once given, so a model extended with new conditions keeps reading
/// the old ones from the same rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionEncoder {
    labels: Vec<Box<str>>,
    #[serde(skip)]
    index: HashMap<Box<str>, u32>,
}

impl ConditionEncoder {
    pub fn from_labels(labels: &[Box<str>]) -> Self {
        let mut ret = Self::default();
        for label in distinct_in_order(labels) {
            ret.push(label);
        }
        ret
    }

    fn push(&mut self, label: Box<str>) {
        self.index.insert(label.clone(), self.labels.len() as u32);
        self.labels.push(label);
    }

    /// Append a new label at index `len()`
    pub fn add(&mut self, label: &str) -> Result<u32, LupinError> {
        if self.index.contains_key(label) {
            return Err(LupinError::DuplicateCondition(label.to_string()));
        }
        self.push(label.into());
        Ok(self.labels.len() as u32 - 1)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn encode_one(&self, label: &str) -> Result<u32, LupinError> {
        self.index
            .get(label)
            .copied()
            .ok_or_else(|| LupinError::UnknownCondition(label.to_string()))
    }

    pub fn encode(&self, labels: &[Box<str>]) -> Result<Vec<u32>, LupinError> {
        labels.iter().map(|l| self.encode_one(l)).collect()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn labels(&self) -> &[Box<str>] {
        &self.labels
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(ENCODER_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(dir.join(ENCODER_FILE))?;
        let stored: ConditionEncoder = serde_json::from_str(&text)?;
        let mut ret = Self::default();
        for label in stored.labels {
            if ret.contains(&label) {
                return Err(LupinError::DuplicateCondition(label.to_string()).into());
            }
            ret.push(label);
        }
        Ok(ret)
    }
}
