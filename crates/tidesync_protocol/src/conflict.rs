//! Conflict detection records and resolution.

use crate::entity::Entity;
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a conflict was discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both copies changed after the watermark (found while pulling).
    ConcurrentUpdate,
    /// The server refused an upload and reported its own version.
    ServerReported(String),
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::ConcurrentUpdate => write!(f, "concurrent_update"),
            ConflictKind::ServerReported(kind) => write!(f, "server:{kind}"),
        }
    }
}

/// A divergence between the local and remote copy of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Generated conflict ID.
    pub id: String,
    /// Entity ID.
    pub entity_id: String,
    /// Entity type.
    pub entity_type: String,
    /// How the conflict was discovered.
    pub kind: ConflictKind,
    /// Local copy.
    pub local_entity: Entity,
    /// Remote copy.
    pub remote_entity: Entity,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    /// Creates a new conflict record with a generated ID.
    pub fn new(kind: ConflictKind, local: Entity, remote: Entity, detected_at: DateTime<Utc>) -> Self {
        let entity_type = if local.entity_type.is_empty() {
            remote.entity_type.clone()
        } else {
            local.entity_type.clone()
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: local.id.clone(),
            entity_type,
            kind,
            local_entity: local,
            remote_entity: remote,
            detected_at,
        }
    }
}

/// Strategy used when a conflict is detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Newer `updated_at` wins; ties go to remote.
    LastWriteWins,
    /// Older `updated_at` wins; ties go to local.
    FirstWriteWins,
    /// Field-by-field merge, remote authoritative for present fields.
    AutoMerge,
    /// Park the conflict until the caller resolves it.
    #[default]
    UserGuided,
}

impl ConflictStrategy {
    /// Returns true if this strategy resolves conflicts without the caller.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::UserGuided)
    }
}

/// Caller decision for a parked conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local copy.
    UseLocal,
    /// Accept the remote copy.
    UseRemote,
    /// Apply the automatic field merge.
    MergeAuto,
    /// Use a caller-supplied entity.
    UseCustom,
}

/// Pure conflict resolution functions.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolves a conflict with a strategy.
    ///
    /// Returns `None` for [`ConflictStrategy::UserGuided`], which never
    /// picks a winner on its own.
    pub fn resolve(
        strategy: ConflictStrategy,
        local: &Entity,
        remote: &Entity,
        now: DateTime<Utc>,
    ) -> Option<Entity> {
        match strategy {
            ConflictStrategy::LastWriteWins => Some(Self::last_write_wins(local, remote)),
            ConflictStrategy::FirstWriteWins => Some(Self::first_write_wins(local, remote)),
            ConflictStrategy::AutoMerge => Some(Self::auto_merge(local, remote, now)),
            ConflictStrategy::UserGuided => None,
        }
    }

    /// Picks the copy with the newer `updated_at`, remote on ties.
    pub fn last_write_wins(local: &Entity, remote: &Entity) -> Entity {
        if local.updated_at > remote.updated_at {
            local.clone()
        } else {
            remote.clone()
        }
    }

    /// Picks the copy with the older `updated_at`, local on ties.
    pub fn first_write_wins(local: &Entity, remote: &Entity) -> Entity {
        if remote.updated_at < local.updated_at {
            remote.clone()
        } else {
            local.clone()
        }
    }

    /// Merges two copies field by field.
    ///
    /// `id` always comes from local and `created_at` keeps the later value.
    /// Any other field takes the remote value unless remote is missing or
    /// null. The result is stamped `updated_at = now`.
    pub fn auto_merge(local: &Entity, remote: &Entity, now: DateTime<Utc>) -> Entity {
        let mut merged = local.clone();

        if merged.entity_type.is_empty() {
            merged.entity_type = remote.entity_type.clone();
        }
        merged.created_at = match (local.created_at, remote.created_at) {
            (Some(l), Some(r)) => Some(l.max(r)),
            (l, r) => l.or(r),
        };

        for (name, value) in &remote.fields {
            let local_empty = merged.fields.get(name).map_or(true, |v| v.is_null());
            if !value.is_null() || local_empty {
                merged.fields.insert(name.clone(), value.clone());
            }
        }

        merged.updated_at = now;
        merged
    }

    /// Produces the winning entity for a caller decision.
    pub fn apply(
        resolution: Resolution,
        record: &ConflictRecord,
        custom: Option<Entity>,
        now: DateTime<Utc>,
    ) -> ProtocolResult<Entity> {
        match resolution {
            Resolution::UseLocal => Ok(record.local_entity.clone()),
            Resolution::UseRemote => Ok(record.remote_entity.clone()),
            Resolution::MergeAuto => Ok(Self::auto_merge(
                &record.local_entity,
                &record.remote_entity,
                now,
            )),
            Resolution::UseCustom => custom.ok_or(ProtocolError::MissingCustomEntity),
        }
    }
}
