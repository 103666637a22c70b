//! Shared request and result types for scriptbox.
//!
//! These types cross the boundary between the caller, the worker pool and the
//! CLI, so they are plain serde structs with no runtime dependencies.

pub mod envelope;
pub mod request;

pub use envelope::*;
pub use request::*;
