mod digest;
mod schema;
mod sqlite;

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use digest::ContentDigest;
pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use crate::types::*;

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

/// A row filter limiting a query to one company's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub field: &'static str,
    pub company_id: Uuid,
}

impl Scope {
    #[must_use]
    pub fn condition(&self) -> String {
        format!("{} = ?", self.field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<i64>, offset: Option<i64>) -> Result<Self> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let offset = offset.unwrap_or(0);
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(Error::BadRequest(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        if offset < 0 {
            return Err(Error::BadRequest("offset cannot be negative".to_string()));
        }
        Ok(Self { limit, offset })
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering and values
/// survive a JSON round trip unchanged.
#[must_use]
pub fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Store defines the database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Settings
    fn settings(&self) -> Result<Option<Settings>>;
    fn save_settings(&self, settings: &Settings) -> Result<()>;

    // Company operations
    fn create_company(&self, company: &Company) -> Result<()>;
    fn company(&self, id: Uuid) -> Result<Company>;
    fn company_by_name(&self, name: &str) -> Result<Option<Company>>;
    fn list_companies(&self, scope: Option<&Scope>, page: Pagination) -> Result<Vec<Company>>;
    fn update_company(&self, company: &Company) -> Result<()>;
    fn delete_company(&self, id: Uuid) -> Result<()>;

    // User operations
    fn create_user(&self, user: &User) -> Result<()>;
    fn user(&self, id: Uuid) -> Result<User>;
    fn user_by_username(&self, username: &str) -> Result<Option<User>>;

    // Slice operations. Loaded slices always carry their metadata.
    fn create_slice(&self, slice: &Slice) -> Result<()>;
    fn slice(&self, id: Uuid) -> Result<Slice>;
    fn slice_by_name(&self, name: &str) -> Result<Slice>;
    fn list_slices(
        &self,
        scope: Option<&Scope>,
        page: Pagination,
        tag: Option<&str>,
    ) -> Result<Vec<Slice>>;
    fn update_slice(&self, slice: &Slice) -> Result<()>;
    fn delete_slice(&self, id: Uuid) -> Result<()>;
    fn lock_slice(&self, id: Uuid) -> Result<()>;
    /// Reopens a slice for sync, settling its summary if grains changed
    /// while it was locked.
    fn unlock_slice(&self, id: Uuid) -> Result<()>;
    /// Recomputes content hash, count, and date from the stored grains.
    fn refresh_slice(&self, id: Uuid) -> Result<Slice>;
    /// Inserts a slice first seen on a remote: no metadata and an unknown
    /// (`NULL`) content summary.
    fn add_slice(&self, slice: &Slice) -> Result<()>;
    /// Makes `target` describe what `source` describes. Metadata rows are
    /// replaced in one transaction when they differ; returns whether they did.
    fn update_slice_metadata(&self, target: Uuid, source: &Slice) -> Result<bool>;
    /// Fails with `Forbidden` unless `company_id` holds an active
    /// subscription to `slice_id`.
    fn slice_access(&self, company_id: Uuid, slice_id: Uuid) -> Result<()>;
    fn set_slice_sync_status(&self, id: Uuid, status: SyncStatus) -> Result<()>;
    /// Moves a slice to `updating` unless another session already holds it.
    fn begin_slice_sync(&self, id: Uuid) -> Result<bool>;

    // Tag operations
    fn create_tag(&self, name: &str, description: &str) -> Result<()>;
    fn tag_slice(&self, slice_id: Uuid, tag: &str) -> Result<()>;

    // Grain operations. Creating or deleting a single grain keeps an open
    // slice's summary current; the bulk primitives below leave that to
    // `refresh_slice`.
    fn create_grain(&self, replace: bool, grain: &Grain) -> Result<()>;
    fn grain(&self, id: Uuid, include_payload: bool) -> Result<Grain>;
    fn grain_by_key(&self, slice_id: Uuid, key: &str, include_payload: bool) -> Result<Grain>;
    fn list_grains(
        &self,
        slice_id: Option<Uuid>,
        include_payload: bool,
        scope: Option<&Scope>,
        page: Pagination,
    ) -> Result<Vec<Grain>>;
    /// Every grain of a slice; `brief` leaves payloads out.
    fn grains(&self, slice_id: Uuid, brief: bool) -> Result<Vec<Grain>>;
    fn company_subscribed(&self, company_id: Uuid, grain_id: Uuid) -> Result<bool>;
    /// Inserts a grain as-is, keeping its id and creation time.
    fn add_grain(&self, grain: &Grain) -> Result<()> {
        let payload = grain
            .payload
            .as_deref()
            .ok_or_else(|| Error::BadRequest(format!("grain '{}' has no payload", grain.grain_key)))?;
        self.add_grain_from(grain, payload.len() as u64, &mut payload.as_bytes())
    }
    /// Like `add_grain`, but streams exactly `len` payload bytes from
    /// `payload`; the payload field of `grain` is ignored.
    fn add_grain_from(&self, grain: &Grain, len: u64, payload: &mut dyn Read) -> Result<()>;
    fn delete_grains(&self, ids: &[Uuid]) -> Result<usize>;
    fn delete_grain(&self, id: Uuid) -> Result<()>;

    // Subscription operations
    fn subscriptions(&self, company_id: Uuid) -> Result<Vec<Subscription>>;
    /// Records a subscription and, if it is not yet known, its slice.
    fn add_subscription(&self, sub: &Subscription, slice: &Slice) -> Result<()>;
    fn deactivate_subscription(&self, sub_id: Uuid) -> Result<()>;

    // Activity log
    fn log_activity(
        &self,
        sub_id: Option<Uuid>,
        message: &str,
        duration: Duration,
        err: Option<&str>,
    ) -> Result<()>;
    fn list_activity(&self, page: Pagination) -> Result<Vec<Activity>>;
}
