use super::AuthError;

/// Pulls the token out of an `Authorization: Bearer <token>` header.
/// Returns `Ok(None)` when no header is present.
pub fn extract_bearer(auth_header: Option<&str>) -> Result<Option<&str>, AuthError> {
    match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(Some(token.trim())),
            Some(_) => Err(AuthError::InvalidToken),
            None => Err(AuthError::InvalidScheme),
        },
        None => Ok(None),
    }
}
