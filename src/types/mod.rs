mod models;
mod role;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use models::*;
pub use role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Primary,
    Secondary,
}

impl ServerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

impl FromStr for ServerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown server role '{other}'")),
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SliceType {
    #[serde(rename = "aces-file")]
    AcesFile,
    #[serde(rename = "aces-items")]
    AcesItems,
    #[serde(rename = "asset-files")]
    AssetFiles,
    #[serde(rename = "pies-file")]
    PiesFile,
    #[serde(rename = "pies-items")]
    PiesItems,
    #[serde(rename = "pies-marketcopy")]
    PiesMarketcopy,
    #[serde(rename = "pies-pricesheet")]
    PiesPricesheet,
    #[serde(rename = "partspro-file")]
    PartsproFile,
    #[serde(rename = "partspro-items")]
    PartsproItems,
}

impl SliceType {
    pub const ALL: [SliceType; 9] = [
        Self::AcesFile,
        Self::AcesItems,
        Self::AssetFiles,
        Self::PiesFile,
        Self::PiesItems,
        Self::PiesMarketcopy,
        Self::PiesPricesheet,
        Self::PartsproFile,
        Self::PartsproItems,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AcesFile => "aces-file",
            Self::AcesItems => "aces-items",
            Self::AssetFiles => "asset-files",
            Self::PiesFile => "pies-file",
            Self::PiesItems => "pies-items",
            Self::PiesMarketcopy => "pies-marketcopy",
            Self::PiesPricesheet => "pies-pricesheet",
            Self::PartsproFile => "partspro-file",
            Self::PartsproItems => "partspro-items",
        }
    }
}

impl FromStr for SliceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown slice type '{s}'"))
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a slice stands in its most recent sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    None,
    Updating,
    Success,
    Error,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Updating => "updating",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "updating" => Ok(Self::Updating),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_type_round_trips_through_str() {
        for t in SliceType::ALL {
            assert_eq!(t.as_str().parse::<SliceType>(), Ok(t));
        }
        assert!("aces".parse::<SliceType>().is_err());
    }

    #[test]
    fn test_slice_type_serde_uses_hyphenated_names() {
        let json = serde_json::to_string(&SliceType::PiesMarketcopy).unwrap();
        assert_eq!(json, "\"pies-marketcopy\"");
    }
}
