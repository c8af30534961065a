//! # Depot: The Storeroom
//!
//! **Durable state shared by every managed resource.**
//!
//! The depot owns everything that has to survive a process restart:
//!
//! - **Credential Store**: the single optional access token used to fetch
//!   gated artifacts, persisted next to the cache and broadcast to
//!   subscribers on change.
//! - **Artifact Cache**: the per-resource directory layout
//!   (`models--org--name`) whose non-empty presence is the only
//!   "downloaded" signal.
//! - **Hub Client**: streaming, resumable downloads from a Hugging Face
//!   style hub with retry on transient failures and byte-level progress.
//! - **Resource Catalog**: the built-in `resources.toml` merged with an
//!   operator override file.
//!
//! ## Usage
//!
//! ```no_run
//! use steward_core::ProgressReporter;
//! use steward_depot::{ArtifactCache, CredentialStore, HubClient, ResourceCatalog};
//!
//! #[async_std::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = ArtifactCache::new("/models")?;
//!     let credentials = CredentialStore::in_dir(cache.root())?;
//!     let catalog = ResourceCatalog::load("/etc/gpu-steward")?;
//!
//!     let spec = catalog.resolve("asr").expect("asr is built in");
//!     let progress = ProgressReporter::new(|event| println!("{:?}", event));
//!     HubClient::new()
//!         .download_repo(spec, &cache.artifact_dir(spec), credentials.get().as_deref(), &progress)
//!         .await?;
//!     Ok(())
//! }
//! ```

/// Directory layout and presence checks for cached artifacts.
pub mod cache;

/// Built-in and operator-provided resource manifests.
pub mod catalog;

/// Durable single-slot access token.
pub mod credentials;

/// Streaming downloads from the artifact hub.
pub mod download;

pub use cache::{has_artifacts, ArtifactCache};
pub use catalog::ResourceCatalog;
pub use credentials::CredentialStore;
pub use download::{HubClient, RemoteFile};
