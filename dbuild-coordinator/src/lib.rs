//! Coordinator of the distributed build.
//!
//! [`scheduler`] decides which worker runs which job, [`dispatch`] drives
//! builds and heartbeats through it, and [`core`] exposes both over gRPC.

pub mod artifacts;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod scheduler;

pub use dispatch::{BuildEvent, Coordinator, Heartbeat, Options};
pub use error::CoordinatorError;
