//! The persisted backlog contract: the durable priority queue the engine
//! claims managed jobs from. The real store lives outside the engine; the
//! in-memory implementation here backs tests and embedders that do not need
//! durability yet.

use crate::{
	error::BacklogError,
	job::{JobId, Priority},
};

use std::{cmp::Reverse, collections::BTreeMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QueuedStatus {
	Queued,
	Claimed,
	Completed,
	Failed,
	Canceled,
}

impl QueuedStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Canceled)
	}
}

/// A job row as the backlog sees it. Immutable once created except for the
/// status transitions the backlog itself performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
	pub id: JobId,
	pub kind: String,
	pub payload: serde_json::Value,
	pub priority: Priority,
	pub scope: String,
	pub status: QueuedStatus,
	pub created_at: DateTime<Utc>,
}

/// Durable queue operations the engine relies on.
///
/// `get_jobs(Queued, ..)` must return candidates ordered by priority, then
/// FIFO within a tier. `claim` is the admission race arbiter: exactly one
/// claimant gets `true` for a given id. `heartbeat` renews the claim lease so
/// an external crash-recovery system can spot stalled claims; requeue logic
/// lives on that side, not here.
#[async_trait]
pub trait Backlog: Send + Sync {
	async fn enqueue(
		&self,
		kind: &str,
		payload: serde_json::Value,
		priority: Priority,
		scope: &str,
	) -> Result<JobId, BacklogError>;

	async fn get_jobs(
		&self,
		status: QueuedStatus,
		limit: usize,
	) -> Result<Vec<QueuedJob>, BacklogError>;

	async fn claim(&self, id: JobId, owner: Uuid) -> Result<bool, BacklogError>;

	async fn heartbeat(&self, id: JobId, fraction: f64) -> Result<(), BacklogError>;

	async fn complete_job(
		&self,
		id: JobId,
		success: bool,
		error: Option<String>,
	) -> Result<(), BacklogError>;

	/// Marks the job canceled. Returns the row only if it was still queued and
	/// unclaimed (the cancel-before-start case); a claimed row is settled as
	/// canceled but comes back as `None`, since its teardown already went
	/// through the active registry. Terminal rows are left untouched.
	async fn cancel_job(&self, id: JobId) -> Result<Option<QueuedJob>, BacklogError>;

	/// Reprioritizes a still-queued job. Returns `false` if it is no longer
	/// queued.
	async fn set_priority(&self, id: JobId, priority: Priority) -> Result<bool, BacklogError>;
}

#[derive(Debug)]
struct StoredJob {
	job: QueuedJob,
	owner: Option<Uuid>,
	last_heartbeat: Option<(DateTime<Utc>, f64)>,
	error: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
	next_id: JobId,
	jobs: BTreeMap<JobId, StoredJob>,
}

/// In-memory [`Backlog`] with the same ordering and claim semantics as the
/// durable store.
#[derive(Debug, Default)]
pub struct MemoryBacklog {
	inner: Mutex<Inner>,
}

impl MemoryBacklog {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Last lease renewal for a claimed job, if any. Mostly useful in tests.
	#[must_use]
	pub fn last_heartbeat(&self, id: JobId) -> Option<(DateTime<Utc>, f64)> {
		self.inner
			.lock()
			.jobs
			.get(&id)
			.and_then(|stored| stored.last_heartbeat)
	}
}

#[async_trait]
impl Backlog for MemoryBacklog {
	async fn enqueue(
		&self,
		kind: &str,
		payload: serde_json::Value,
		priority: Priority,
		scope: &str,
	) -> Result<JobId, BacklogError> {
		let mut inner = self.inner.lock();
		inner.next_id += 1;
		let id = inner.next_id;
		inner.jobs.insert(
			id,
			StoredJob {
				job: QueuedJob {
					id,
					kind: kind.to_string(),
					payload,
					priority,
					scope: scope.to_string(),
					status: QueuedStatus::Queued,
					created_at: Utc::now(),
				},
				owner: None,
				last_heartbeat: None,
				error: None,
			},
		);

		Ok(id)
	}

	async fn get_jobs(
		&self,
		status: QueuedStatus,
		limit: usize,
	) -> Result<Vec<QueuedJob>, BacklogError> {
		let inner = self.inner.lock();
		let mut jobs = inner
			.jobs
			.values()
			.filter(|stored| stored.job.status == status)
			.map(|stored| stored.job.clone())
			.collect::<Vec<_>>();

		// Higher priority first, FIFO within a tier (ids are monotonic).
		jobs.sort_by_key(|job| (Reverse(job.priority), job.id));
		jobs.truncate(limit);

		Ok(jobs)
	}

	async fn claim(&self, id: JobId, owner: Uuid) -> Result<bool, BacklogError> {
		let mut inner = self.inner.lock();
		let Some(stored) = inner.jobs.get_mut(&id) else {
			return Ok(false);
		};

		if stored.job.status != QueuedStatus::Queued {
			return Ok(false);
		}

		stored.job.status = QueuedStatus::Claimed;
		stored.owner = Some(owner);

		Ok(true)
	}

	async fn heartbeat(&self, id: JobId, fraction: f64) -> Result<(), BacklogError> {
		let mut inner = self.inner.lock();
		match inner.jobs.get_mut(&id) {
			Some(stored) if stored.job.status == QueuedStatus::Claimed => {
				stored.last_heartbeat = Some((Utc::now(), fraction));
				Ok(())
			}
			Some(stored) => Err(BacklogError::Other(format!(
				"heartbeat for job {id} in status {}",
				stored.job.status
			))),
			None => Err(BacklogError::Other(format!(
				"heartbeat for unknown job {id}"
			))),
		}
	}

	async fn complete_job(
		&self,
		id: JobId,
		success: bool,
		error: Option<String>,
	) -> Result<(), BacklogError> {
		let mut inner = self.inner.lock();
		let Some(stored) = inner.jobs.get_mut(&id) else {
			return Err(BacklogError::Other(format!("complete for unknown job {id}")));
		};

		// Terminal states are final; a row canceled in the claim window must
		// not be resurrected by the worker's settle.
		if stored.job.status.is_terminal() {
			return Ok(());
		}

		stored.job.status = if success {
			QueuedStatus::Completed
		} else {
			QueuedStatus::Failed
		};
		stored.error = error;

		Ok(())
	}

	async fn cancel_job(&self, id: JobId) -> Result<Option<QueuedJob>, BacklogError> {
		let mut inner = self.inner.lock();
		let Some(stored) = inner.jobs.get_mut(&id) else {
			return Ok(None);
		};

		match stored.job.status {
			QueuedStatus::Queued => {
				stored.job.status = QueuedStatus::Canceled;
				Ok(Some(stored.job.clone()))
			}
			QueuedStatus::Claimed => {
				stored.job.status = QueuedStatus::Canceled;
				Ok(None)
			}
			_ => Ok(None),
		}
	}

	async fn set_priority(&self, id: JobId, priority: Priority) -> Result<bool, BacklogError> {
		let mut inner = self.inner.lock();
		let Some(stored) = inner.jobs.get_mut(&id) else {
			return Ok(false);
		};

		if stored.job.status != QueuedStatus::Queued {
			return Ok(false);
		}

		stored.job.priority = priority;

		Ok(true)
	}
}
