//! Tunables for each pipeline stage. Built once in `main` and passed down explicitly.

use crate::retry::RetryPolicy;

pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_RETRIEVAL_THRESHOLD: f32 = 0.7;
pub const DEFAULT_VERIFY_THRESHOLD: f32 = 0.8;
pub const DEFAULT_CONCURRENCY: usize = 30;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 100;
pub const DEFAULT_CHECKPOINT_BATCHES: usize = 20;
pub const DEFAULT_SAMPLING_TIMES: usize = 5;
pub const DEFAULT_CONSISTENCY_THRESHOLD: usize = 3;
pub const DEFAULT_SAVE_INTERVAL: usize = 100;
pub const VERIFY_TEMPERATURE: f32 = 0.0;
pub const SAMPLING_TEMPERATURE: f32 = 0.3;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f32 },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error(
        "consistency threshold {threshold} is unreachable with {sampling_times} sampling rounds (max {} votes)",
        .sampling_times + 1
    )]
    UnreachableConsensus {
        threshold: usize,
        sampling_times: usize,
    },
}

fn check_unit_range(name: &'static str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}

fn check_positive(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero(name))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_RETRIEVAL_THRESHOLD,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("top_k", self.top_k)?;
        check_unit_range("retrieval threshold", self.threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationConfig {
    /// Stricter similarity floor applied before a candidate is shown to the oracle.
    pub threshold: f32,
    /// Maximum simultaneous in-flight oracle calls.
    pub concurrency: usize,
    /// Source entities per progress batch.
    pub batch_size: usize,
    /// Verified pairs buffered in memory before a batch file is written.
    pub flush_threshold: usize,
    /// Completed batches between checkpoints, whether or not the pair buffer is full.
    pub checkpoint_batches: usize,
    pub temperature: f32,
    pub retry: RetryPolicy,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_VERIFY_THRESHOLD,
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            checkpoint_batches: DEFAULT_CHECKPOINT_BATCHES,
            temperature: VERIFY_TEMPERATURE,
            retry: RetryPolicy::default(),
        }
    }
}

impl VerificationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit_range("verification threshold", self.threshold)?;
        check_positive("concurrency", self.concurrency)?;
        check_positive("batch size", self.batch_size)?;
        check_positive("flush threshold", self.flush_threshold)?;
        check_positive("checkpoint batches", self.checkpoint_batches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurifyConfig {
    pub sampling_times: usize,
    /// Votes needed out of `sampling_times + 1` (the first-pass extraction votes once).
    pub consistency_threshold: usize,
    pub concurrency: usize,
    /// Newly purified articles between dataset checkpoints.
    pub save_interval: usize,
    pub temperature: f32,
    pub retry: RetryPolicy,
}

impl Default for PurifyConfig {
    fn default() -> Self {
        Self {
            sampling_times: DEFAULT_SAMPLING_TIMES,
            consistency_threshold: DEFAULT_CONSISTENCY_THRESHOLD,
            concurrency: DEFAULT_CONCURRENCY,
            save_interval: DEFAULT_SAVE_INTERVAL,
            temperature: SAMPLING_TEMPERATURE,
            retry: RetryPolicy::default(),
        }
    }
}

impl PurifyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("sampling times", self.sampling_times)?;
        check_positive("consistency threshold", self.consistency_threshold)?;
        check_positive("concurrency", self.concurrency)?;
        check_positive("save interval", self.save_interval)?;
        if self.consistency_threshold > self.sampling_times + 1 {
            return Err(ConfigError::UnreachableConsensus {
                threshold: self.consistency_threshold,
                sampling_times: self.sampling_times,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmbedConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

impl EmbedConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("concurrency", self.concurrency)
    }
}
