//! # steward-registry
//!
//! Lifecycle state machine for each managed resource and the registry that
//! addresses them by name.
//!
//! Operations on one handle run one at a time in arrival order; a request
//! that arrives while the same kind of operation is already running joins
//! it and gets the same outcome. Status reads never wait on either.

mod handle;
mod registry;
mod status;

pub use handle::{merge_preference, ResourceHandle};
pub use registry::ResourceRegistry;
