//! Evaluation settings.

use crate::data::DataSet;
use crate::partition::DataPartition;
use pwa_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How a data set is split for parallel evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Partitioning {
    /// `n` contiguous blocks
    Block {
        /// Number of blocks
        n: usize,
    },
    /// Contiguous blocks of `size` points
    BlockSize {
        /// Points per block
        size: usize,
    },
    /// `n` interleaved partitions
    Weave {
        /// Number of partitions
        n: usize,
    },
}

impl Default for Partitioning {
    fn default() -> Self {
        Partitioning::Block { n: rayon::current_num_threads() }
    }
}

/// Settings of a likelihood evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Partitioning of data and integration samples
    pub partitioning: Partitioning,
    /// Constant subtracted from every log intensity
    pub pedestal: f64,
    /// Size of a dedicated thread pool; `None` uses the global pool
    pub threads: Option<usize>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { partitioning: Partitioning::default(), pedestal: 0.0, threads: None }
    }
}

impl EvaluationConfig {
    /// Parse from JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Reject settings that cannot be evaluated.
    pub fn validate(&self) -> Result<()> {
        match self.partitioning {
            Partitioning::Block { n: 0 } | Partitioning::Weave { n: 0 } => {
                return Err(Error::Validation("number of partitions must be positive".into()));
            }
            Partitioning::BlockSize { size: 0 } => {
                return Err(Error::Validation("partition size must be positive".into()));
            }
            _ => {}
        }
        if !self.pedestal.is_finite() {
            let msg = format!("pedestal must be finite, got {}", self.pedestal);
            return Err(Error::Validation(msg));
        }
        if self.threads == Some(0) {
            return Err(Error::Validation("thread count must be positive".into()));
        }
        Ok(())
    }

    /// Partitions of `data` following [`EvaluationConfig::partitioning`].
    pub fn partitions(&self, data: &DataSet) -> Result<Vec<DataPartition>> {
        match self.partitioning {
            Partitioning::Block { n } => DataPartition::create_block(data, n),
            Partitioning::BlockSize { size } => DataPartition::create_block_by_size(data, size),
            Partitioning::Weave { n } => DataPartition::create_weave(data, n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weave_config() {
        let c = EvaluationConfig::from_json_str(
            r#"{"partitioning": {"type": "weave", "n": 4}, "pedestal": -1.5}"#,
        )
        .unwrap();
        assert_eq!(c.partitioning, Partitioning::Weave { n: 4 });
        assert_eq!(c.pedestal, -1.5);
        assert_eq!(c.threads, None);
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let c = EvaluationConfig::from_json_str(r#"{"threads": 2}"#).unwrap();
        assert_eq!(c.threads, Some(2));
        assert!(matches!(c.partitioning, Partitioning::Block { .. }));
    }

    #[test]
    fn test_invalid_configs_rejected() {
        for json in [
            r#"{"partitioning": {"type": "block", "n": 0}}"#,
            r#"{"partitioning": {"type": "block_size", "size": 0}}"#,
            r#"{"threads": 0}"#,
        ] {
            assert!(matches!(EvaluationConfig::from_json_str(json), Err(Error::Validation(_))));
        }
        assert!(matches!(EvaluationConfig::from_json_str("{"), Err(Error::Json(_))));
    }
}
