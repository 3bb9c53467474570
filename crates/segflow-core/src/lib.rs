//! # segflow-core
//!
//! Orchestration core for long-running volumetric segmentation jobs.
//!
//! A submitted scan becomes a [`Task`] in a [`TaskStore`]; a bounded
//! [`WorkerPool`] drives each task through prepare → infer → post-process →
//! finalize, calling an external segmentation executable through the
//! [`Segmenter`] seam and deriving label volumes with the [`analyzer`].
//! Downsampled previews of finished artifacts are produced on demand by the
//! [`PreviewCache`].
//!
//! All collaborators are constructed explicitly and injected into a
//! [`SegmentationService`]; nothing in this crate holds process-wide state.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use segflow_core::{Config, NnUnetRunner, SegmentationService, SqliteTaskStore};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! config.validate()?;
//! let store = Arc::new(SqliteTaskStore::connect(&config.database_url).await?);
//! let runner = Arc::new(NnUnetRunner::from_config(&config)?);
//! let service = SegmentationService::from_config(&config, store, runner);
//!
//! let id = service.submit_upload("case_00001.nii.gz", "/tmp/case_00001.nii.gz".as_ref()).await?;
//! println!("queued {id}");
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod config;
pub mod error;
pub mod layout;
pub mod preview;
pub mod runner;
pub mod runtime;
pub mod service;
pub mod store;
pub mod task;
pub mod volume;

#[cfg(test)]
pub(crate) mod test_support;

pub use analyzer::VolumeStats;
pub use config::{CheckpointMode, Config, ModelConfig};
pub use error::ServiceError;
pub use layout::{ArtifactKind, TaskLayout};
pub use preview::{PreviewCache, ServedArtifact};
pub use runner::{NnUnetRunner, RunnerError, Segmenter};
pub use runtime::pool::WorkerPool;
pub use runtime::Scheduler;
pub use service::SegmentationService;
pub use store::{MemoryTaskStore, SqliteTaskStore, StoreError, TaskStore};
pub use task::{Task, TaskStatus};
