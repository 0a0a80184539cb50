//! Change detection.
//!
//! The detector compares a fresh observation from the scanner with the
//! stored record, classifies the transition and, for anything but a no-op,
//! commits the updated record and its change event in one step under a
//! freshly allocated sequence id.
//!
//! Observations of one identifier are serialized by a striped lock table;
//! different identifiers only meet in the short commit critical section.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Deserialize;

use crate::change::{ChangeCommit, ChangeEvent, ChangeKind};
use crate::entity::{Attributes, CompareSet, EntityId, EntityRecord};
use crate::error::{FimError, FimResult, ValidationError};
use crate::sequence::SequenceAllocator;
use crate::storage::{StateStore, StorageError};

/// What the scanner saw for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// The entity exists with these attributes.
    Present(Attributes),
    /// The entity was confirmed removed.
    Removed,
}

/// Change detector settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Fields compared for `modified` classification.
    pub compare: CompareSet,
    /// Number of per-identifier lock stripes.
    pub lock_stripes: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            compare: CompareSet::default(),
            lock_stripes: 64,
        }
    }
}

impl DetectorConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `lock_stripes` is zero.
    pub fn validate(self) -> Result<Self, ValidationError> {
        if self.lock_stripes == 0 {
            return Err(ValidationError::config("lock_stripes", "must be at least 1"));
        }
        Ok(self)
    }
}

/// Classifies a transition without touching any state.
///
/// Returns `None` for an idempotent no-op: identical attributes, or a
/// removal of something already absent.
#[must_use]
pub fn classify(
    prior: Option<&EntityRecord>,
    observation: &Observation,
    compare: &CompareSet,
) -> Option<ChangeKind> {
    let live = prior.filter(|r| r.is_live());
    match (live, observation) {
        (None, Observation::Present(_)) => Some(ChangeKind::Created),
        (None, Observation::Removed) => None,
        (Some(_), Observation::Removed) => Some(ChangeKind::Deleted),
        (Some(record), Observation::Present(attrs)) => compare
            .differs(&record.attributes, attrs)
            .then_some(ChangeKind::Modified),
    }
}

/// Detects and commits changes to the state store.
pub struct ChangeDetector {
    store: Arc<dyn StateStore>,
    sequence: Arc<SequenceAllocator>,
    compare: CompareSet,
    stripes: Vec<Mutex<()>>,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("compare", &self.compare)
            .field("stripes", &self.stripes.len())
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    /// A detector committing into `store` with ids from `sequence`.
    pub fn new(
        store: Arc<dyn StateStore>,
        sequence: Arc<SequenceAllocator>,
        config: DetectorConfig,
    ) -> Self {
        let stripes = (0..config.lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            store,
            sequence,
            compare: config.compare,
            stripes,
        }
    }

    /// The comparison set in effect.
    #[must_use]
    pub const fn compare_set(&self) -> &CompareSet {
        &self.compare
    }

    /// Applies an observation.
    ///
    /// Returns the committed event, or `None` when nothing changed.
    ///
    /// # Errors
    /// Storage and sequence allocation failures. In either case nothing was
    /// committed and the caller may retry.
    pub fn observe(&self, id: &EntityId, observation: Observation) -> FimResult<Option<ChangeEvent>> {
        let _guard = self.stripes[self.stripe_of(id)]
            .lock()
            .map_err(|_| StorageError::LockPoisoned("detector.stripe"))?;

        let prior = self.store.get(id)?;
        let Some(kind) = classify(prior.as_ref(), &observation, &self.compare) else {
            return Ok(None);
        };

        // Deletions keep the last known attributes in the tombstone.
        let attributes = match observation {
            Observation::Present(attrs) => attrs,
            Observation::Removed => match prior {
                Some(record) => record.attributes,
                None => return Err(FimError::internal("deletion classified without a prior record")),
            },
        };

        // The allocator lock spans the commit, WAL write and fsync included,
        // so commit order equals sequence order. Distinct identifiers only
        // contend here; classification above runs under the stripe alone.
        let event = self.sequence.allocate_with(|sequence| -> FimResult<ChangeEvent> {
            let now = Utc::now();
            let event = ChangeEvent {
                identifier: id.clone(),
                kind,
                sequence,
                payload: (kind != ChangeKind::Deleted).then(|| attributes.clone()),
                detected_at: now,
            };
            let record = EntityRecord {
                id: id.clone(),
                attributes,
                last_sequence: sequence,
                tombstone: kind == ChangeKind::Deleted,
                updated_at: now,
            };
            self.store.commit(ChangeCommit {
                record,
                event: event.clone(),
            })?;
            Ok(event)
        })?;

        Ok(Some(event))
    }

    fn stripe_of(&self, id: &EntityId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let h = hasher.finish() as usize;
        h % self.stripes.len()
    }
}
