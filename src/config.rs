//! Engine configuration.
//!
//! Every section defaults sensibly; a host usually overrides a handful of
//! fields from JSON:
//!
//! ```rust
//! use fimsync::FimConfig;
//!
//! let cfg = FimConfig::from_json_str(r#"{ "dispatch": { "batch_size": 64 } }"#)?;
//! assert_eq!(cfg.dispatch.batch_size, 64);
//! # Ok::<(), fimsync::FimError>(())
//! ```

use serde::Deserialize;

use crate::detector::DetectorConfig;
use crate::dispatch::{DispatchConfig, WorkerConfig};
use crate::error::{FimResult, ValidationError};

#[cfg(feature = "persistent")]
use crate::storage::PersistentConfig;

/// Sequence allocator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Ids reserved per persisted counter write. 1 persists every id.
    pub reserve_block: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self { reserve_block: 1 }
    }
}

impl SequenceConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` for a zero block.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.reserve_block == 0 {
            return Err(ValidationError::config("reserve_block", "must be at least 1"));
        }
        Ok(self)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FimConfig {
    /// Durable backend settings, used by [`FimDb::open`](crate::FimDb::open).
    #[cfg(feature = "persistent")]
    pub persistent: PersistentConfig,
    /// Change classification.
    pub detector: DetectorConfig,
    /// Delivery, retry and cycle limits.
    pub dispatch: DispatchConfig,
    /// Sequence id reservation.
    pub sequence: SequenceConfig,
    /// Background worker; `None` leaves cycles to the caller.
    pub worker: Option<WorkerConfig>,
    /// Compact the store after a commit once it reports it is due.
    pub auto_compact: bool,
}

impl Default for FimConfig {
    fn default() -> Self {
        Self {
            #[cfg(feature = "persistent")]
            persistent: PersistentConfig::default(),
            detector: DetectorConfig::default(),
            dispatch: DispatchConfig::default(),
            sequence: SequenceConfig::default(),
            worker: None,
            auto_compact: true,
        }
    }
}

impl FimConfig {
    /// Parses a (possibly partial) JSON document and validates it.
    ///
    /// # Errors
    /// `InvalidConfig` on malformed JSON or out-of-range values.
    pub fn from_json_str(json: &str) -> FimResult<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| ValidationError::config("<document>", e.to_string()))?;
        Ok(cfg.validate()?)
    }

    /// Validates every section.
    ///
    /// # Errors
    /// The first section that fails.
    pub fn validate(self) -> Result<Self, ValidationError> {
        Ok(Self {
            #[cfg(feature = "persistent")]
            persistent: self.persistent.validate()?,
            detector: self.detector.validate()?,
            dispatch: self.dispatch.validate()?,
            sequence: self.sequence.validate()?,
            worker: self.worker.map(WorkerConfig::validate).transpose()?,
            auto_compact: self.auto_compact,
        })
    }
}
