// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change events: the immutable record of one replicable change.
//!
//! A [`Change`] carries its kind and the kind's payload in a single tagged
//! enum, so a `key_create` without key material cannot be constructed.
//! Validation of raw input happens in [`crate::intake`]; everything past
//! intake works with typed changes only.
//!
//! # Wire Format
//!
//! Changes serialize with an internal `kind` tag, which is also what the
//! job store persists as the job payload:
//!
//! ```json
//! {"kind": "repository_update", "project_id": "17"}
//! {"kind": "key_create", "key_id": "42", "key": "ssh-ed25519 AAAA...", "fingerprint": "SHA256:..."}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// The kinds of change the dispatcher replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A project repository was pushed to.
    RepositoryUpdate,
    /// A project wiki repository was changed.
    WikiUpdate,
    /// An SSH key was added on the primary.
    KeyCreate,
    /// An SSH key was removed on the primary.
    KeyDestroy,
}

impl ChangeKind {
    /// All kinds, in declaration order.
    pub const ALL: [ChangeKind; 4] = [
        ChangeKind::RepositoryUpdate,
        ChangeKind::WikiUpdate,
        ChangeKind::KeyCreate,
        ChangeKind::KeyDestroy,
    ];

    /// Stable string form, used in job ids, the job table and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::RepositoryUpdate => "repository_update",
            ChangeKind::WikiUpdate => "wiki_update",
            ChangeKind::KeyCreate => "key_create",
            ChangeKind::KeyDestroy => "key_destroy",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "repository_update" => Ok(ChangeKind::RepositoryUpdate),
            "wiki_update" => Ok(ChangeKind::WikiUpdate),
            "key_create" => Ok(ChangeKind::KeyCreate),
            "key_destroy" => Ok(ChangeKind::KeyDestroy),
            other => Err(ValidationError::UnknownKind(other.to_string())),
        }
    }
}

/// Payload of a key event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChange {
    /// Identifier of the key on the primary.
    pub key_id: String,
    /// Public key material as sent by the primary.
    pub key: String,
    /// `SHA256:<hex>` fingerprint of the key material.
    pub fingerprint: String,
}

impl KeyChange {
    /// Build a key payload, deriving the fingerprint from the key material.
    pub fn new(key_id: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        let fingerprint = fingerprint_of(&key);
        Self {
            key_id: key_id.into(),
            key,
            fingerprint,
        }
    }
}

/// Fingerprint of SSH key material: `SHA256:` followed by the hex digest.
pub fn fingerprint_of(key: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("SHA256:{}", hex::encode(Sha256::digest(key.trim().as_bytes())))
}

/// A typed change: kind plus the payload that kind requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    RepositoryUpdate { project_id: String },
    WikiUpdate { project_id: String },
    KeyCreate(KeyChange),
    KeyDestroy(KeyChange),
}

impl Change {
    /// The kind tag of this change.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::RepositoryUpdate { .. } => ChangeKind::RepositoryUpdate,
            Change::WikiUpdate { .. } => ChangeKind::WikiUpdate,
            Change::KeyCreate(_) => ChangeKind::KeyCreate,
            Change::KeyDestroy(_) => ChangeKind::KeyDestroy,
        }
    }

    /// Identifier of the affected entity (project id or key id).
    pub fn subject_id(&self) -> &str {
        match self {
            Change::RepositoryUpdate { project_id } | Change::WikiUpdate { project_id } => project_id,
            Change::KeyCreate(key) | Change::KeyDestroy(key) => &key.key_id,
        }
    }
}

/// One accepted change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Time-ordered unique id assigned at intake.
    pub id: Uuid,
    pub change: Change,
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Stamp a change with a fresh id and the current time.
    pub fn new(change: Change) -> Self {
        Self::received_at(change, Utc::now())
    }

    /// Stamp a change with a fresh id and an explicit intake time.
    pub fn received_at(change: Change, received_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            change,
            received_at,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        self.change.kind()
    }

    pub fn subject_id(&self) -> &str {
        self.change.subject_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_from_str() {
        for kind in ChangeKind::ALL {
            assert_eq!(kind.as_str().parse::<ChangeKind>().unwrap(), kind);
        }
        let err = "push".parse::<ChangeKind>().unwrap_err();
        assert_eq!(err, ValidationError::UnknownKind("push".to_string()));
    }

    #[test]
    fn test_change_kind_is_case_sensitive() {
        assert!("KEY_CREATE".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn test_change_subject_and_kind() {
        let repo = Change::RepositoryUpdate { project_id: "17".into() };
        assert_eq!(repo.kind(), ChangeKind::RepositoryUpdate);
        assert_eq!(repo.subject_id(), "17");

        let key = Change::KeyDestroy(KeyChange::new("key-42", "ssh-ed25519 AAAAC3"));
        assert_eq!(key.kind(), ChangeKind::KeyDestroy);
        assert_eq!(key.subject_id(), "key-42");
    }

    #[test]
    fn test_fingerprint_is_stable_and_trimmed() {
        let a = fingerprint_of("ssh-rsa AAAAB3Nza");
        let b = fingerprint_of("  ssh-rsa AAAAB3Nza\n");
        assert_eq!(a, b);
        assert!(a.starts_with("SHA256:"));
        assert_eq!(a.len(), "SHA256:".len() + 64);
        assert_ne!(a, fingerprint_of("ssh-rsa AAAAB3Nzb"));
    }

    #[test]
    fn test_change_serializes_with_kind_tag() {
        let change = Change::WikiUpdate { project_id: "9".into() };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "wiki_update");
        assert_eq!(json["project_id"], "9");

        let key = Change::KeyCreate(KeyChange::new("7", "ssh-ed25519 AAAA"));
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["kind"], "key_create");
        assert_eq!(json["key_id"], "7");
        let parsed: Change = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_change_event_ids_are_unique() {
        let change = Change::RepositoryUpdate { project_id: "1".into() };
        let a = ChangeEvent::new(change.clone());
        let b = ChangeEvent::new(change);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.get_version_num(), 7);
        assert_eq!(a.kind(), ChangeKind::RepositoryUpdate);
        assert_eq!(a.subject_id(), "1");
    }
}
