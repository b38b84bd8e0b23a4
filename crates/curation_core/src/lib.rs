//! Curation Engine Core Types
//!
//! Pure types shared by the planner and the runtime. Nothing in this
//! crate performs I/O against a warehouse.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coords;
pub mod error;
pub mod id;
pub mod stage;

// Re-exports
pub use coords::{Coordinates, TableRef};
pub use error::{CoreError, CoreResult};
pub use id::{JobId, RuleId, RunId};
pub use stage::DataStage;
