mod activity;
mod auth;
mod companies;
pub mod dto;
mod grains;
pub mod response;
mod router;
mod slices;
mod sync;

pub use router::{AppState, create_router};
