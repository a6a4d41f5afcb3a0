use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("missing query params: {0}")]
    MissingQueryParams(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found")]
    NotFound,

    #[error("slice locked: {0}")]
    SliceLocked(String),

    #[error("slice busy: {0}")]
    SliceBusy(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote(e.to_string())
    }
}

impl Error {
    /// Maps a unique-constraint violation to `AlreadyExists`, leaving other
    /// database errors untouched.
    pub fn from_insert(e: rusqlite::Error, what: &str) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Self::AlreadyExists(what.to_string())
            }
            e => Self::Database(e),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
