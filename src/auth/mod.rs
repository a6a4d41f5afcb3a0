mod helpers;
mod middleware;
mod password;
mod scope;
mod token;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Role;

pub use helpers::extract_bearer;
pub use middleware::{AuthError, RequireAuth};
pub use password::Hasher;
pub use scope::{enforce_company, enforce_role, enforce_scope, enforce_server_role};
pub use token::{Claims, TokenIssuer, TokenPair};

/// The caller behind a request, recovered from its bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: Uuid,
    pub company_id: Uuid,
    pub username: String,
    pub email: String,
    pub role: Role,
}
