use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Role, ServerRole, SliceType, SyncStatus};
use crate::codec::Encoding;

/// Ordered key/value metadata attached to a slice.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub sync_addr: String,
    /// Encrypted at rest; never leaves the server.
    #[serde(skip)]
    pub sync_api_key: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub company_id: Uuid,
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub id: Uuid,
    pub name: String,
    pub slice_type: SliceType,
    /// Digest of the grain set. `None` until it has been computed, and while
    /// grains change under a lock; never equal to any real digest.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub content_count: i64,
    pub content_date: DateTime<Utc>,
    pub allow_sync: bool,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_good_sync: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Slice {
    /// A fresh, empty slice that is open for sync.
    #[must_use]
    pub fn new(name: impl Into<String>, slice_type: SliceType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            slice_type,
            content_hash: None,
            content_count: 0,
            content_date: now,
            allow_sync: true,
            sync_status: SyncStatus::None,
            last_sync_attempt: None,
            last_good_sync: None,
            created_at: now,
            updated_at: now,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grain {
    pub id: Uuid,
    pub slice_id: Uuid,
    pub grain_key: String,
    pub encoding: Encoding,
    /// Absent when the grain was listed in brief mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Grain {
    #[must_use]
    pub fn new(
        slice_id: Uuid,
        grain_key: impl Into<String>,
        encoding: Encoding,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            slice_id,
            grain_key: grain_key.into(),
            encoding,
            payload: Some(payload.into()),
            source: String::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub sub_id: Uuid,
    pub slice_id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Populated by slice-joined loads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<Slice>,
}

impl Subscription {
    #[must_use]
    pub fn new(slice_id: Uuid, company_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            sub_id: Uuid::new_v4(),
            slice_id,
            company_id,
            name: name.into(),
            description: String::new(),
            active: true,
            created_at: Utc::now(),
            slice: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_id: Option<Uuid>,
    pub success: bool,
    pub message: String,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// This server's identity, stored as a singleton row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub server_role: ServerRole,
    pub server_id: Uuid,
}
