//! Role, company, and server-role gates, plus the row scope every list query
//! is filtered through.

use uuid::Uuid;

use super::CurrentUser;
use crate::error::{Error, Result};
use crate::store::Scope;
use crate::types::{Role, ServerRole};

/// Fails unless the caller is at least as privileged as `required`.
pub fn enforce_role(user: &CurrentUser, required: Role) -> Result<()> {
    if user.role.satisfies(required) {
        Ok(())
    } else {
        Err(Error::forbidden(format!(
            "role {} required, caller is {}",
            required, user.role
        )))
    }
}

/// Admins may act on any company; company admins only on their own.
pub fn enforce_company(user: &CurrentUser, company_id: Uuid) -> Result<()> {
    if user.role.satisfies(Role::Admin) {
        return Ok(());
    }
    enforce_role(user, Role::CompanyAdmin)?;
    if user.company_id == company_id {
        Ok(())
    } else {
        Err(Error::forbidden("company mismatch"))
    }
}

pub fn enforce_server_role(actual: ServerRole, required: ServerRole) -> Result<()> {
    if actual == required {
        Ok(())
    } else {
        Err(Error::forbidden(format!(
            "this is a {actual} server, operation requires {required}"
        )))
    }
}

/// Returns the row scope for `user`, keyed on `field`.
///
/// Admins get no scope. Company admins are restricted to their company.
/// Sync users cannot list anything.
pub fn enforce_scope(user: &CurrentUser, field: &'static str) -> Result<Option<Scope>> {
    if user.role.satisfies(Role::Admin) {
        return Ok(None);
    }
    enforce_role(user, Role::CompanyAdmin)?;
    Ok(Some(Scope {
        field,
        company_id: user.company_id,
    }))
}
