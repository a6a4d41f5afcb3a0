use std::net::{AddrParseError, SocketAddr};
use std::path::PathBuf;

use crate::credentials::SyncKey;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Raises the remote client timeout so a primary can be stepped through
    /// in a debugger.
    pub debug: bool,
    /// 44-character base64 AES-256 key that seals primaries' sync credentials.
    /// Only a secondary needs one.
    pub sync_key: Option<String>,
    /// HS256 signing secret for access and refresh tokens.
    pub jwt_secret: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sandpiper.db")
    }

    /// Parses the configured sync key, if any. An empty value counts as unset.
    pub fn sync_key(&self) -> Result<Option<SyncKey>> {
        match self.sync_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(encoded) => SyncKey::from_base64(encoded).map(Some),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            debug: false,
            sync_key: None,
            jwt_secret: String::new(),
        }
    }
}
