//! The active job registry: the authoritative in-memory table of running and
//! paused jobs, plus the pending-progress buffer. Both live behind the one
//! registry mutex; every lock hold is short and never spans an await point.

use crate::{
	backlog::QueuedJob,
	job::{JobHandle, TrackedId, WorkUnit},
	progress::{self, PendingSample},
};

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

pub(crate) struct ActiveJob {
	pub handle: JobHandle,
	pub kind: String,
	pub scope: String,
	pub title: String,
	pub processed: u64,
	pub total: u64,
	pub started_at: DateTime<Utc>,
	pub started_instant: Instant,
	pub paused: bool,
	pub cancel_requested: bool,
	/// Present for managed jobs; the cooperative control hooks live on it.
	pub unit: Option<Arc<dyn WorkUnit>>,
	/// Present for tracked jobs; supplied by the external owner.
	pub cancel_hook: Option<Box<dyn Fn() + Send + Sync>>,
	pub last_history_update: Option<Instant>,
}

impl ActiveJob {
	pub(crate) fn managed(handle: JobHandle, queued: &QueuedJob, unit: Arc<dyn WorkUnit>) -> Self {
		Self {
			handle,
			kind: queued.kind.clone(),
			scope: queued.scope.clone(),
			title: queued.kind.clone(),
			processed: 0,
			total: 0,
			started_at: Utc::now(),
			started_instant: Instant::now(),
			paused: false,
			cancel_requested: false,
			unit: Some(unit),
			cancel_hook: None,
			last_history_update: None,
		}
	}

	pub(crate) fn tracked(
		handle: JobHandle,
		kind: &str,
		scope: &str,
		title: &str,
		total_hint: u64,
		cancel_hook: Box<dyn Fn() + Send + Sync>,
	) -> Self {
		Self {
			handle,
			kind: kind.to_string(),
			scope: scope.to_string(),
			title: title.to_string(),
			processed: 0,
			total: total_hint,
			started_at: Utc::now(),
			started_instant: Instant::now(),
			paused: false,
			cancel_requested: false,
			unit: None,
			cancel_hook: Some(cancel_hook),
			last_history_update: None,
		}
	}

	pub(crate) fn fraction(&self) -> f64 {
		progress::fraction(self.processed, self.total)
	}

	pub(crate) fn info(&self) -> ActiveJobInfo {
		ActiveJobInfo {
			handle: self.handle,
			kind: self.kind.clone(),
			scope: self.scope.clone(),
			title: self.title.clone(),
			processed: self.processed,
			total: self.total,
			started_at: self.started_at,
			paused: self.paused,
			cancel_requested: self.cancel_requested,
		}
	}
}

/// Snapshot of one active job for the query API.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJobInfo {
	pub handle: JobHandle,
	pub kind: String,
	pub scope: String,
	pub title: String,
	pub processed: u64,
	pub total: u64,
	pub started_at: DateTime<Utc>,
	pub paused: bool,
	pub cancel_requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSystemStats {
	pub active: usize,
	pub running: usize,
	pub paused: usize,
	pub queued: usize,
	pub max_workers: usize,
	pub admission_paused: bool,
}

pub(crate) struct RegistryState {
	pub active: HashMap<JobHandle, ActiveJob>,
	pub pending_progress: HashMap<JobHandle, PendingSample>,
	pub admission_paused: bool,
	pub next_tracked_id: TrackedId,
	/// Set when a job reaches a terminal state, cleared when the idle
	/// announcement goes out. Keeps idle-time admission triggers from
	/// announcing the completion of jobs that never ran.
	pub finished_since_idle: bool,
}

impl RegistryState {
	pub(crate) fn new() -> Self {
		Self {
			active: HashMap::new(),
			pending_progress: HashMap::new(),
			admission_paused: false,
			next_tracked_id: 0,
			finished_since_idle: false,
		}
	}

	/// Managed jobs currently occupying a worker slot. Paused jobs give their
	/// slot back by definition, which is what lets a lower-priority queued job
	/// start while a higher-priority one sits paused.
	pub(crate) fn managed_running(&self) -> usize {
		self.active
			.values()
			.filter(|job| job.handle.is_managed() && !job.paused)
			.count()
	}

	pub(crate) fn paused_count(&self) -> usize {
		self.active.values().filter(|job| job.paused).count()
	}
}
