use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What one session did, returned by `POST /v1/sync/{id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub primary_id: Uuid,
    pub primary_name: String,
    pub slices: Vec<SliceReport>,
    /// Subscriptions the primary turned off during this session.
    pub deactivated: Vec<Uuid>,
    pub duration_ms: i64,
}

impl SyncReport {
    #[must_use]
    pub fn errors(&self) -> usize {
        self.slices.iter().filter(|s| s.error.is_some()).count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SliceReport {
    pub sub_id: Uuid,
    pub slice_id: Uuid,
    pub slice_name: String,
    /// Hashes already matched; nothing was transferred.
    pub unchanged: bool,
    pub added: usize,
    pub deleted: usize,
    pub metadata_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
