use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role is a user's privilege level. Lower values carry more privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Role {
    SuperAdmin,
    Admin,
    CompanyAdmin,
    SyncUser,
}

impl Role {
    pub const fn level(self) -> i32 {
        match self {
            Self::SuperAdmin => 100,
            Self::Admin => 110,
            Self::CompanyAdmin => 120,
            Self::SyncUser => 200,
        }
    }

    pub const fn from_level(level: i32) -> Option<Self> {
        match level {
            100 => Some(Self::SuperAdmin),
            110 => Some(Self::Admin),
            120 => Some(Self::CompanyAdmin),
            200 => Some(Self::SyncUser),
            _ => None,
        }
    }

    /// Returns true if this role is at least as privileged as `required`.
    #[must_use]
    pub const fn satisfies(self, required: Role) -> bool {
        self.level() <= required.level()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Admin => "admin",
            Self::CompanyAdmin => "company_admin",
            Self::SyncUser => "sync_user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "super_admin" => Ok(Self::SuperAdmin),
            "admin" => Ok(Self::Admin),
            "company_admin" => Ok(Self::CompanyAdmin),
            "sync_user" => Ok(Self::SyncUser),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl From<Role> for i32 {
    fn from(role: Role) -> Self {
        role.level()
    }
}

impl TryFrom<i32> for Role {
    type Error = String;

    fn try_from(level: i32) -> Result<Self, Self::Error> {
        Self::from_level(level).ok_or_else(|| format!("unknown role level {level}"))
    }
}
