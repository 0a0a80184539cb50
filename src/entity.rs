//! Monitored entities and their attribute snapshots.
//!
//! An entity is anything the scanner watches: a file, a registry key or a
//! registry value. The state table is keyed by [`EntityId`] and holds the
//! last-known [`Attributes`] of each entity together with the sequence id
//! of its most recent change.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum identifier length in bytes (long registry paths included).
pub const MAX_IDENTIFIER_LEN: usize = 4096;

/// Identifier of a monitored entity (file path or registry key).
///
/// Identifiers are compared byte-wise, so the state table iterates them in
/// a stable order.
///
/// # Examples
///
/// ```
/// use fimsync::EntityId;
///
/// let id = EntityId::new("/etc/passwd").unwrap();
/// assert_eq!(id.as_str(), "/etc/passwd");
/// assert!(EntityId::new("").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Creates a validated identifier.
    ///
    /// # Errors
    /// Returns `EmptyIdentifier` for an empty (or all-NUL) string and
    /// `IdentifierTooLong` past [`MAX_IDENTIFIER_LEN`].
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() || id.bytes().all(|b| b == 0) {
            return Err(ValidationError::EmptyIdentifier);
        }
        if id.len() > MAX_IDENTIFIER_LEN {
            return Err(ValidationError::IdentifierTooLong {
                max_length: MAX_IDENTIFIER_LEN,
            });
        }
        Ok(Self(id))
    }

    /// Returns the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EntityId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What kind of object an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A regular file, directory or link on disk
    #[default]
    File,
    /// A Windows registry key
    RegistryKey,
    /// A Windows registry value
    RegistryValue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::RegistryKey => write!(f, "registry_key"),
            Self::RegistryValue => write!(f, "registry_value"),
        }
    }
}

/// A blake3 content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes the given content.
    #[must_use]
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    /// Wraps a precomputed digest.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the lowercase hex encoding of the digest.
    #[must_use]
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// Parses a 64-character hex digest.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content hash: {s:?}")))
    }
}

/// Attribute snapshot of a monitored entity as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// File, registry key or registry value.
    #[serde(default)]
    pub kind: EntityKind,

    /// Size in bytes.
    pub size: u64,

    /// Mode bits on Unix, a flattened ACL digest on Windows.
    pub permissions: u32,

    /// Owner, as a uid or a Windows SID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Group owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,

    /// Content digest, if the scanner hashed the entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<ContentHash>,

    /// Last modification time.
    pub mtime: DateTime<Utc>,

    /// Inode number, where the platform has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
}

impl Attributes {
    /// Creates a file snapshot with the mandatory fields.
    #[must_use]
    pub fn file(size: u64, permissions: u32, mtime: DateTime<Utc>) -> Self {
        Self {
            kind: EntityKind::File,
            size,
            permissions,
            uid: None,
            gid: None,
            hash: None,
            mtime,
            inode: None,
        }
    }

    /// Sets the entity kind.
    #[must_use]
    pub fn with_kind(mut self, kind: EntityKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the content digest.
    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.hash = Some(hash);
        self
    }

    /// Hashes `content` and sets the digest.
    #[must_use]
    pub fn with_content(self, content: &[u8]) -> Self {
        self.with_hash(ContentHash::of(content))
    }

    /// Sets the owner and group.
    #[must_use]
    pub fn with_owner(mut self, uid: impl Into<String>, gid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self.gid = Some(gid.into());
        self
    }

    /// Sets the inode number.
    #[must_use]
    pub fn with_inode(mut self, inode: u64) -> Self {
        self.inode = Some(inode);
        self
    }
}

/// Attribute fields that participate in `modified` classification.
///
/// The default compares content hash, size, modification time and
/// permissions. Owner and inode changes are opt-in since they churn on
/// some filesystems without any content change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareSet {
    /// Content digest.
    pub hash: bool,
    /// Size in bytes.
    pub size: bool,
    /// Modification time.
    pub mtime: bool,
    /// Permission bits or ACL digest.
    pub permissions: bool,
    /// uid and gid together.
    pub owner: bool,
    /// Inode number.
    pub inode: bool,
}

impl Default for CompareSet {
    fn default() -> Self {
        Self {
            hash: true,
            size: true,
            mtime: true,
            permissions: true,
            owner: false,
            inode: false,
        }
    }
}

impl CompareSet {
    /// Every field participates.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            hash: true,
            size: true,
            mtime: true,
            permissions: true,
            owner: true,
            inode: true,
        }
    }

    /// Content only: hash and size.
    #[must_use]
    pub const fn content_only() -> Self {
        Self {
            hash: true,
            size: true,
            mtime: false,
            permissions: false,
            owner: false,
            inode: false,
        }
    }

    /// Returns true if `a` and `b` differ in any compared field.
    ///
    /// A change of entity kind always counts as a difference.
    #[must_use]
    pub fn differs(&self, a: &Attributes, b: &Attributes) -> bool {
        a.kind != b.kind
            || (self.hash && a.hash != b.hash)
            || (self.size && a.size != b.size)
            || (self.mtime && a.mtime != b.mtime)
            || (self.permissions && a.permissions != b.permissions)
            || (self.owner && (a.uid != b.uid || a.gid != b.gid))
            || (self.inode && a.inode != b.inode)
    }
}

/// Last-known state of an entity in the state table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Key of the record.
    pub id: EntityId,

    /// Last known attributes; kept on tombstones.
    pub attributes: Attributes,

    /// Sequence id of the change that produced this record.
    pub last_sequence: u64,

    /// Set once the entity is confirmed removed. The record is purged after
    /// its deletion event is acknowledged.
    #[serde(default)]
    pub tombstone: bool,

    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    /// Returns true if the record describes an entity currently present.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.tombstone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attrs() -> Attributes {
        Attributes::file(10, 0o644, Utc.timestamp_opt(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn test_identifier_validation() {
        assert!(EntityId::new("/etc/passwd").is_ok());
        assert!(matches!(EntityId::new(""), Err(ValidationError::EmptyIdentifier)));
        assert!(matches!(EntityId::new("\0\0"), Err(ValidationError::EmptyIdentifier)));

        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            EntityId::new(long),
            Err(ValidationError::IdentifierTooLong { .. })
        ));
    }

    #[test]
    fn test_identifier_deserialize_rejects_empty() {
        let parsed: Result<EntityId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());

        let parsed: EntityId = serde_json::from_str("\"HKEY_LOCAL_MACHINE\\\\Software\"").unwrap();
        assert_eq!(parsed.as_str(), "HKEY_LOCAL_MACHINE\\Software");
    }

    #[test]
    fn test_identifiers_order_bytewise() {
        let a = EntityId::new("/etc/a").unwrap();
        let b = EntityId::new("/etc/b").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_content_hash_serializes_as_hex() {
        let hash = ContentHash::of(b"root:x:0:0");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json.len(), 64 + 2);

        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"zz\"").is_err());
    }

    #[test]
    fn test_compare_set_default_ignores_owner() {
        let a = attrs().with_owner("0", "0");
        let b = attrs().with_owner("1000", "1000");
        assert!(!CompareSet::default().differs(&a, &b));
        assert!(CompareSet::all().differs(&a, &b));
    }

    #[test]
    fn test_compare_set_detects_content_change() {
        let a = attrs().with_content(b"one");
        let b = attrs().with_content(b"two");
        assert!(CompareSet::default().differs(&a, &b));
        assert!(CompareSet::content_only().differs(&a, &b));
    }

    #[test]
    fn test_content_only_ignores_mtime() {
        let a = attrs();
        let mut b = attrs();
        b.mtime = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        assert!(!CompareSet::content_only().differs(&a, &b));
        assert!(CompareSet::default().differs(&a, &b));
    }

    #[test]
    fn test_kind_change_always_differs() {
        let a = attrs();
        let b = attrs().with_kind(EntityKind::RegistryKey);
        assert!(CompareSet::content_only().differs(&a, &b));
    }
}
