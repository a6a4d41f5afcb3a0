//! Secondary-side reconciliation against a primary.

mod diff;
mod engine;
mod report;

pub use diff::{GrainDiff, diff_grains};
pub use engine::SyncEngine;
pub use report::{SliceReport, SyncReport};
