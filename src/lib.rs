//! # Sandpiper
//!
//! A federation server that keeps a secondary's slices and grains in step
//! with what its primaries publish, usable both as a standalone binary and as
//! a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! sandpiper = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sandpiper::config::ServerConfig;
//! use sandpiper::server::{AppState, create_router};
//! use sandpiper::store::{SqliteStore, Store};
//!
//! let config = ServerConfig::default();
//! let store = SqliteStore::new(config.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(Arc::new(store), &config).unwrap());
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `sandpiper` binary. Disable with `default-features = false`.

pub mod auth;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod remote;
pub mod server;
pub mod store;
pub mod sync;
pub mod types;
