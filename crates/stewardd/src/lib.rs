//! Admin HTTP surface of `stewardd`, split out of the binary so it can be
//! exercised in-process.

pub mod api;

pub use api::{app, status_code, ApiState};
