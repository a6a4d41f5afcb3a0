//! Bearer tokens.
//!
//! Access tokens are HS256 JWTs carrying the caller's identity, so requests
//! never hit the database to authenticate. Refresh tokens share the claim
//! layout but are signed with a derived key, which keeps them from being
//! accepted as bearer tokens.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CurrentUser;
use crate::error::{Error, Result};
use crate::types::{Role, User};

const ACCESS_TTL_SECS: i64 = 60 * 60;
const REFRESH_TTL_SECS: i64 = 7 * 24 * 60 * 60;
const REFRESH_KEY_SUFFIX: &[u8] = b":refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: Uuid,
    /// username
    pub u: String,
    /// email
    pub e: String,
    /// role level
    pub r: Role,
    /// company id
    pub c: String,
    pub exp: i64,
}

impl Claims {
    fn for_user(user: &User, exp: i64) -> Self {
        Self {
            id: user.id,
            u: user.username.clone(),
            e: user.email.clone(),
            r: user.role,
            c: user.company_id.to_string(),
            exp,
        }
    }

    pub fn current_user(&self) -> Result<CurrentUser> {
        let company_id = Uuid::parse_str(&self.c)
            .map_err(|_| Error::NotAuthorized("token carries a bad company id".to_string()))?;
        Ok(CurrentUser {
            id: self.id,
            company_id,
            username: self.u.clone(),
            email: self.e.clone(),
            role: self.r,
        })
    }
}

/// What `POST /v1/login` and `GET /v1/refresh/{token}` return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub token: String,
    pub expires: DateTime<Utc>,
    pub refresh_token: String,
}

#[derive(Clone)]
pub struct TokenIssuer {
    access: Vec<u8>,
    refresh: Vec<u8>,
}

impl TokenIssuer {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < 32 {
            return Err(Error::Config(
                "jwt secret must be at least 32 characters".to_string(),
            ));
        }
        let access = secret.as_bytes().to_vec();
        let mut refresh = access.clone();
        refresh.extend_from_slice(REFRESH_KEY_SUFFIX);
        Ok(Self { access, refresh })
    }

    pub fn issue(&self, user: &User) -> Result<TokenPair> {
        let now = Utc::now().timestamp();
        let exp = now + ACCESS_TTL_SECS;
        let token = self.sign(&Claims::for_user(user, exp), &self.access)?;
        let refresh_token = self.sign(
            &Claims::for_user(user, now + REFRESH_TTL_SECS),
            &self.refresh,
        )?;
        let expires = Utc
            .timestamp_opt(exp, 0)
            .single()
            .unwrap_or_else(|| Utc::now() + Duration::seconds(ACCESS_TTL_SECS));
        Ok(TokenPair {
            token,
            expires,
            refresh_token,
        })
    }

    pub fn verify_access(&self, token: &str) -> Result<Claims> {
        Self::check(token, &self.access)
    }

    pub fn verify_refresh(&self, token: &str) -> Result<Claims> {
        Self::check(token, &self.refresh)
    }

    fn sign(&self, claims: &Claims, key: &[u8]) -> Result<String> {
        encode(&Header::default(), claims, &EncodingKey::from_secret(key))
            .map_err(|e| Error::NotAuthorized(format!("failed to issue token: {e}")))
    }

    fn check(token: &str, key: &[u8]) -> Result<Claims> {
        decode::<Claims>(token, &DecodingKey::from_secret(key), &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired",
                    ErrorKind::InvalidSignature => "invalid signature",
                    _ => "invalid token",
                };
                Error::NotAuthorized(reason.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            username: "syncer".to_string(),
            email: "syncer@example.com".to_string(),
            password_hash: String::new(),
            role: Role::CompanyAdmin,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_access_token_carries_identity() {
        let issuer = TokenIssuer::new(SECRET).unwrap();
        let user = user();
        let pair = issuer.issue(&user).unwrap();

        let current = issuer.verify_access(&pair.token).unwrap().current_user().unwrap();
        assert_eq!(current.id, user.id);
        assert_eq!(current.company_id, user.company_id);
        assert_eq!(current.role, Role::CompanyAdmin);
        assert!(pair.expires > Utc::now());
    }

    #[test]
    fn test_role_is_serialized_as_level() {
        let issuer = TokenIssuer::new(SECRET).unwrap();
        let claims = issuer.verify_access(&issuer.issue(&user()).unwrap().token).unwrap();
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["r"], 120);
    }

    #[test]
    fn test_refresh_token_is_not_a_bearer_token() {
        let issuer = TokenIssuer::new(SECRET).unwrap();
        let pair = issuer.issue(&user()).unwrap();
        assert!(issuer.verify_access(&pair.refresh_token).is_err());
        assert!(issuer.verify_refresh(&pair.refresh_token).is_ok());
        assert!(issuer.verify_refresh(&pair.token).is_err());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let pair = TokenIssuer::new(SECRET).unwrap().issue(&user()).unwrap();
        let other = TokenIssuer::new("ffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches!(
            other.verify_access(&pair.token),
            Err(Error::NotAuthorized(_))
        ));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenIssuer::new("short").is_err());
    }
}
