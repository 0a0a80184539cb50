//! Change events produced by the detector and drained by the dispatcher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Attributes, EntityId, EntityRecord};

/// Classification of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The entity was not known (or was tombstoned) and is now present
    Created,
    /// The entity's compared attributes changed
    Modified,
    /// The entity was confirmed removed
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A detected change waiting in the pending log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The entity that changed.
    pub identifier: EntityId,

    /// What happened to it.
    pub kind: ChangeKind,

    /// Position in the delivery order; unique and never reused.
    pub sequence: u64,

    /// New attribute snapshot; `None` for deletions.
    pub payload: Option<Attributes>,

    /// When the change was observed.
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Encodes the event into the buffer handed to the notification sink.
    ///
    /// # Errors
    /// Returns an error if JSON serialization fails.
    pub fn to_buffer(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SyncMessage::from(self))
    }
}

/// Wire form of a change event as delivered to the notification sink.
///
/// ```json
/// {"identifier":"/etc/passwd","kind":"modified","sequence":2,
///  "attributes":{...},"detected_at":"2026-10-14T08:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Path or registry key of the entity.
    pub identifier: String,
    /// Created, modified or deleted.
    pub kind: ChangeKind,
    /// Sequence id of the event.
    pub sequence: u64,
    /// Attributes after the change; `null` for deletions.
    pub attributes: Option<Attributes>,
    /// When the change was observed.
    pub detected_at: DateTime<Utc>,
}

impl From<&ChangeEvent> for SyncMessage {
    fn from(event: &ChangeEvent) -> Self {
        Self {
            identifier: event.identifier.to_string(),
            kind: event.kind,
            sequence: event.sequence,
            attributes: event.payload.clone(),
            detected_at: event.detected_at,
        }
    }
}

impl SyncMessage {
    /// Decodes a buffer produced by [`ChangeEvent::to_buffer`].
    ///
    /// # Errors
    /// Returns an error if the buffer is not a valid sync message.
    pub fn from_buffer(buffer: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(buffer)
    }
}

/// A record update and its change event, applied to the store as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeCommit {
    /// The record as it reads after the change.
    pub record: EntityRecord,
    /// The event appended to the pending log.
    pub event: ChangeEvent,
}

impl ChangeCommit {
    /// Sequence id shared by the record and the event.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.event.sequence
    }
}
