//! Engine configuration.
//!
//! [`EngineSettings`] is plain serde data with defaults for every field.
//! Loading it from files or the environment is the caller's job. A
//! canonical snapshot of the settings is stored on every run record.

use crate::landscape::{FilesystemPayloadStore, InMemoryPayloadStore, Landscape, PayloadStore};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Invalid settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid setting '{field}': {reason}")]
pub struct SettingsError {
    /// Dotted path of the offending field.
    pub field: String,
    /// What is wrong with it.
    pub reason: String,
}

impl SettingsError {
    /// Creates an error for `field`.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// How often checkpoints are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// After every fully processed row.
    EveryRow,
    /// After every `n` fully processed rows.
    EveryN(u64),
    /// Only after rows that touched an aggregation buffer.
    AggregationOnly,
}

/// Checkpoint cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// Whether to checkpoint at all.
    pub enabled: bool,
    /// Row-count cadence.
    pub frequency: CheckpointFrequency,
    /// Time cadence, checked alongside the row cadence.
    pub interval_secs: Option<u64>,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: CheckpointFrequency::EveryRow,
            interval_secs: None,
        }
    }
}

/// Worker pool bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    /// Rows processed in parallel.
    pub max_workers: usize,
    /// How long dispatch waits for a free worker before failing.
    pub acquire_timeout_ms: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            acquire_timeout_ms: 300_000,
        }
    }
}

/// Where the ledger and payloads live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LandscapeSettings {
    /// SQLite database file. In memory when absent.
    pub database_path: Option<PathBuf>,
    /// Payload directory. In memory when absent.
    pub payload_dir: Option<PathBuf>,
}

impl LandscapeSettings {
    /// Opens the ledger these settings describe.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or payload directory cannot be
    /// opened.
    pub fn open(&self) -> crate::landscape::Result<Landscape> {
        let payloads: Arc<dyn PayloadStore> = match &self.payload_dir {
            Some(dir) => Arc::new(FilesystemPayloadStore::open(dir.clone())?),
            None => Arc::new(InMemoryPayloadStore::new()),
        };
        match &self.database_path {
            Some(path) => Landscape::open(path, payloads),
            None => Landscape::in_memory_with_payloads(payloads),
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Retry policy for transforms.
    pub retry: RetryConfig,
    /// Checkpoint cadence.
    pub checkpoint: CheckpointSettings,
    /// Worker pool.
    pub concurrency: ConcurrencySettings,
    /// Ledger location.
    pub landscape: LandscapeSettings,
    /// Payloads of runs older than this may be purged.
    pub payload_retention_days: Option<u32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            checkpoint: CheckpointSettings::default(),
            concurrency: ConcurrencySettings::default(),
            landscape: LandscapeSettings::default(),
            payload_retention_days: None,
        }
    }
}

impl EngineSettings {
    /// Default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the checkpoint cadence.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointSettings) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub const fn with_max_workers(mut self, workers: usize) -> Self {
        self.concurrency.max_workers = workers;
        self
    }

    /// Sets the ledger location.
    #[must_use]
    pub fn with_landscape(mut self, landscape: LandscapeSettings) -> Self {
        self.landscape = landscape;
        self
    }

    /// Sets the payload retention.
    #[must_use]
    pub const fn with_payload_retention_days(mut self, days: u32) -> Self {
        self.payload_retention_days = Some(days);
        self
    }

    /// Checks every bound.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.retry.validate()?;
        if self.concurrency.max_workers == 0 {
            return Err(SettingsError::invalid(
                "concurrency.max_workers",
                "must be at least 1",
            ));
        }
        if self.concurrency.acquire_timeout_ms == 0 {
            return Err(SettingsError::invalid(
                "concurrency.acquire_timeout_ms",
                "must be positive",
            ));
        }
        if self.checkpoint.frequency == CheckpointFrequency::EveryN(0) {
            return Err(SettingsError::invalid(
                "checkpoint.frequency",
                "every_n must be at least 1",
            ));
        }
        if self.checkpoint.interval_secs == Some(0) {
            return Err(SettingsError::invalid(
                "checkpoint.interval_secs",
                "must be positive",
            ));
        }
        if self.payload_retention_days == Some(0) {
            return Err(SettingsError::invalid(
                "payload_retention_days",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// The settings as JSON, for the run record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn snapshot(&self) -> Result<serde_json::Value, SettingsError> {
        serde_json::to_value(self).map_err(|e| SettingsError::invalid("<root>", e.to_string()))
    }
}
