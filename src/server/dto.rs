use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Encoding;
use crate::error::{Error, Result};
use crate::store::Pagination;
use crate::types::{Activity, Company, Grain, Metadata, Slice, SliceType, Subscription};

// Request types

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSliceRequest {
    pub name: String,
    pub slice_type: SliceType,
    #[serde(default)]
    pub allow_sync: Option<bool>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSliceRequest {
    pub name: Option<String>,
    pub slice_type: Option<SliceType>,
    pub allow_sync: Option<bool>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCompanyRequest {
    pub name: Option<String>,
    pub sync_addr: Option<String>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTagRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGrainRequest {
    pub slice_id: Uuid,
    pub grain_key: String,
    pub encoding: Encoding,
    pub payload: String,
    #[serde(default)]
    pub source: String,
}

// Query parameters. Booleans arrive as `yes`/`no`.

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    pub fn pagination(&self) -> Result<Pagination> {
        Pagination::new(self.limit, self.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListSlicesParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListGrainsParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub slice_id: Option<String>,
    /// Narrows the listing to one grain; only meaningful with `slice_id`.
    pub grain_key: Option<String>,
    pub payload: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BriefParams {
    pub brief: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PayloadParams {
    pub payload: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplaceParams {
    pub replace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub encoding: Option<String>,
    pub replace: Option<String>,
    pub source: Option<String>,
}

/// Reads a `yes`/`no` query flag, falling back to `default` when absent.
pub fn flag(value: Option<&str>, default: bool) -> Result<bool> {
    match value {
        None | Some("") => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("yes") || v == "true" || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("no") || v == "false" || v == "0" => Ok(false),
        Some(v) => Err(Error::BadRequest(format!("expected yes or no, got '{v}'"))),
    }
}

pub fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| Error::InvalidUuid(value.to_string()))
}

// Response types

#[derive(Debug, Serialize, Deserialize)]
pub struct CompanyList {
    pub companies: Vec<Company>,
    pub page: Pagination,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SliceList {
    pub slices: Vec<Slice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Pagination>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrainList {
    pub grains: Vec<Grain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Pagination>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscriptionList {
    pub subscriptions: Vec<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<Pagination>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivityList {
    pub activity: Vec<Activity>,
    pub page: Pagination,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert!(flag(None, true).unwrap());
        assert!(!flag(None, false).unwrap());
        assert!(flag(Some("yes"), false).unwrap());
        assert!(flag(Some("YES"), false).unwrap());
        assert!(!flag(Some("no"), true).unwrap());
        assert!(matches!(flag(Some("maybe"), true), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_parse_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(parse_uuid(&id.to_string()).unwrap(), id);
        assert!(matches!(parse_uuid("nope"), Err(Error::InvalidUuid(_))));
    }

    #[test]
    fn test_brief_grain_list_omits_payloads() {
        let mut grain = Grain::new(Uuid::new_v4(), "k", Encoding::Raw, "body");
        grain.payload = None;
        let json = serde_json::to_value(GrainList {
            grains: vec![grain],
            page: None,
        })
        .unwrap();
        assert!(json["grains"][0].get("payload").is_none());
        assert!(json.get("page").is_none());
    }
}
