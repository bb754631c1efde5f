//! # Lumen Job System
//!
//! Background job orchestration engine for the Lumen photo library. Long,
//! CPU/IO-heavy operations (face detection, embedding extraction, duplicate
//! hashing, clustering, repository scanning) run off the interactive thread
//! with:
//!
//! - priority-ordered admission into a bounded worker pool;
//! - cooperative pause/resume/cancel (pausing a job frees its worker slot);
//! - periodic backlog lease renewal for external stall detection;
//! - rate-limited progress delivery that never drops the terminal sample;
//! - a durable execution history, finalized exactly once per job.
//!
//! The durable backlog and history stores are external collaborators behind
//! the [`Backlog`] and [`HistoryStore`] traits; in-memory implementations are
//! provided for tests and non-durable embedders. The operations themselves
//! are plugged in as [`WorkUnit`]s through a [`WorkUnitRegistry`].
//!
//! ## Basic usage
//!
//! ```no_run
//! use lumen_job_system::{
//!     JobSystem, JobSystemConfig, MemoryBacklog, MemoryHistoryStore, Priority,
//!     WorkUnitRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let system = JobSystem::new(
//!     JobSystemConfig::default(),
//!     Arc::new(MemoryBacklog::new()),
//!     Arc::new(MemoryHistoryStore::new()),
//!     WorkUnitRegistry::new(),
//! );
//!
//! let mut events = system.subscribe();
//! let id = system
//!     .enqueue("face_detection", "library:main", Priority::High, serde_json::json!({}))
//!     .await
//!     .unwrap();
//! # }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	deprecated
)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod backlog;
mod config;
mod error;
mod event;
mod history;
mod job;
mod progress;
mod registry;
mod system;

pub use backlog::{Backlog, MemoryBacklog, QueuedJob, QueuedStatus};
pub use config::JobSystemConfig;
pub use error::{BacklogError, HistoryError, JobError, JobSystemError};
pub use event::JobSystemEvent;
pub use history::{HistoryEntry, HistoryStore, JobStatus, MemoryHistoryStore};
pub use job::{
	JobContext, JobHandle, JobId, JobMetadata, JobResult, Priority, TrackedId, WorkUnit,
	WorkUnitFactory, WorkUnitRegistry,
};
pub use progress::ProgressSample;
pub use registry::{ActiveJobInfo, JobSystemStats};
pub use system::JobSystem;
