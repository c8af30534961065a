//! # steward-telemetry
//!
//! Background sampling of accelerator and host state, published as an
//! immutable snapshot that readers load without ever waiting on the
//! sampler, plus an advisory inspector for the accelerator software stack.

pub mod collector;
pub mod gpu;
pub mod host;
pub mod inspector;
mod process;
pub mod sampler;

pub use collector::{CollectorConfig, TelemetryCollector, TelemetryReader};
pub use inspector::{DependencyInspector, DependencyProbe};
pub use sampler::{Sampler, SystemSampler};
