//! Client side of the sync protocol: how a secondary talks to a primary.

mod http;

use std::io::{Cursor, Read};

use uuid::Uuid;

pub use http::{HttpConnector, HttpRemote};

use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::types::{Grain, Settings, Slice, Subscription};

/// A grain payload being read off a remote: exactly `len` bytes of the
/// encoded text.
pub struct Payload {
    pub len: u64,
    pub body: Box<dyn Read + Send>,
}

impl From<String> for Payload {
    fn from(payload: String) -> Self {
        Self {
            len: payload.len() as u64,
            body: Box::new(Cursor::new(payload.into_bytes())),
        }
    }
}

/// An authenticated session with a primary.
pub trait Remote: Send {
    /// Every subscription the primary holds for our company, slices included.
    fn all_subs(&self) -> Result<Vec<Subscription>>;
    /// The grains of a slice without payloads.
    fn grain_list(&self, slice_id: Uuid) -> Result<Vec<Grain>>;
    fn grain(&self, id: Uuid) -> Result<Grain>;
    /// Opens the payload of a grain for reading. The default fetches the
    /// whole grain.
    fn grain_payload(&self, id: Uuid) -> Result<Payload> {
        self.grain(id)?
            .payload
            .map(Payload::from)
            .ok_or_else(|| Error::Remote(format!("grain {id} arrived without a payload")))
    }
    fn slice_by_id(&self, id: Uuid) -> Result<Slice>;
    fn slice_by_name(&self, name: &str) -> Result<Slice>;
    fn list_slices(&self) -> Result<Vec<Slice>>;
    fn refresh_slice(&self, id: Uuid) -> Result<Slice>;
    fn lock_slice(&self, id: Uuid) -> Result<()>;
    fn unlock_slice(&self, id: Uuid) -> Result<()>;
    fn server_role(&self) -> Result<Settings>;
}

/// Opens [`Remote`] sessions. The engine holds one of these so tests can
/// substitute an in-memory primary.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &str, credentials: &Credentials) -> Result<Box<dyn Remote>>;
}
