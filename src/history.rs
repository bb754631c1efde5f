//! Execution history: one durable record per job, finalized exactly once.
//! The store itself is external; [`HistoryRecorder`] is the thin wrapper the
//! engine talks to, which throttles progress writes and swallows store I/O
//! errors so a flaky disk never aborts the job it is recording.

use crate::{
	error::HistoryError,
	job::{JobHandle, JobMetadata},
};

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The engine's job state machine:
/// `Queued → Running ⇄ Paused → {Completed | Failed | Canceled}`.
/// Tracked jobs skip `Queued`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
	Queued,
	Running,
	Paused,
	Completed,
	Failed,
	Canceled,
}

impl JobStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Canceled)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub handle: JobHandle,
	pub kind: String,
	pub title: String,
	pub created_at: DateTime<Utc>,
	pub started_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
	pub status: JobStatus,
	pub fraction: f64,
	pub metadata: JobMetadata,
	pub error: Option<String>,
}

impl HistoryEntry {
	#[must_use]
	pub fn started(handle: JobHandle, kind: impl Into<String>, title: impl Into<String>) -> Self {
		let now = Utc::now();
		Self {
			handle,
			kind: kind.into(),
			title: title.into(),
			created_at: now,
			started_at: Some(now),
			finished_at: None,
			status: JobStatus::Running,
			fraction: 0.0,
			metadata: None,
			error: None,
		}
	}

	#[must_use]
	pub fn queued(handle: JobHandle, kind: impl Into<String>, title: impl Into<String>) -> Self {
		Self {
			started_at: None,
			status: JobStatus::Queued,
			..Self::started(handle, kind, title)
		}
	}
}

/// Durable history store contract.
///
/// `finish` must be idempotent against an already-terminal record: the first
/// finalization wins and later ones are ignored.
#[async_trait]
pub trait HistoryStore: Send + Sync {
	async fn upsert_start(&self, entry: HistoryEntry) -> Result<(), HistoryError>;

	async fn update_progress(&self, handle: JobHandle, fraction: f64) -> Result<(), HistoryError>;

	async fn finish(
		&self,
		handle: JobHandle,
		status: JobStatus,
		metadata: JobMetadata,
		error: Option<String>,
	) -> Result<(), HistoryError>;

	/// Most recent records first.
	async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError>;

	async fn clear_all(&self) -> Result<(), HistoryError>;
}

/// Thin wrapper over the store used on the dispatch path. Recording failures
/// are logged and swallowed; only the query surface propagates them.
#[derive(Clone)]
pub(crate) struct HistoryRecorder {
	store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
	pub(crate) fn new(store: Arc<dyn HistoryStore>) -> Self {
		Self { store }
	}

	pub(crate) async fn upsert_start(&self, entry: HistoryEntry) {
		let handle = entry.handle;
		if let Err(e) = self.store.upsert_start(entry).await {
			warn!(%handle, ?e, "Failed to record job start in history;");
		}
	}

	pub(crate) async fn update_progress(&self, handle: JobHandle, fraction: f64) {
		if let Err(e) = self.store.update_progress(handle, fraction).await {
			warn!(%handle, ?e, "Failed to record job progress in history;");
		}
	}

	pub(crate) async fn finish(
		&self,
		handle: JobHandle,
		status: JobStatus,
		metadata: JobMetadata,
		error: Option<String>,
	) {
		if let Err(e) = self.store.finish(handle, status, metadata, error).await {
			warn!(%handle, %status, ?e, "Failed to finalize job in history;");
		}
	}

	pub(crate) async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
		self.store.list_recent(limit).await
	}

	pub(crate) async fn clear_all(&self) -> Result<(), HistoryError> {
		self.store.clear_all().await
	}
}

/// In-memory [`HistoryStore`] with the same finalize-once semantics as the
/// durable one.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
	entries: Mutex<HashMap<JobHandle, HistoryEntry>>,
}

impl MemoryHistoryStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
	async fn upsert_start(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
		let mut entries = self.entries.lock();
		match entries.get_mut(&entry.handle) {
			Some(existing) if !existing.status.is_terminal() => {
				existing.started_at = entry.started_at;
				existing.status = entry.status;
			}
			Some(_) => {}
			None => {
				entries.insert(entry.handle, entry);
			}
		}

		Ok(())
	}

	async fn update_progress(&self, handle: JobHandle, fraction: f64) -> Result<(), HistoryError> {
		if let Some(entry) = self.entries.lock().get_mut(&handle) {
			if !entry.status.is_terminal() {
				entry.fraction = fraction;
			}
		}

		Ok(())
	}

	async fn finish(
		&self,
		handle: JobHandle,
		status: JobStatus,
		metadata: JobMetadata,
		error: Option<String>,
	) -> Result<(), HistoryError> {
		let mut entries = self.entries.lock();
		let entry = entries.entry(handle).or_insert_with(|| HistoryEntry {
			handle,
			kind: String::new(),
			title: String::new(),
			created_at: Utc::now(),
			started_at: None,
			finished_at: None,
			status: JobStatus::Queued,
			fraction: 0.0,
			metadata: None,
			error: None,
		});

		// First finalization wins.
		if entry.status.is_terminal() {
			return Ok(());
		}

		entry.status = status;
		entry.finished_at = Some(Utc::now());
		entry.metadata = metadata;
		entry.error = error;
		if status == JobStatus::Completed {
			entry.fraction = 1.0;
		}

		Ok(())
	}

	async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
		let mut entries = self
			.entries
			.lock()
			.values()
			.cloned()
			.collect::<Vec<_>>();
		entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		entries.truncate(limit);

		Ok(entries)
	}

	async fn clear_all(&self) -> Result<(), HistoryError> {
		self.entries.lock().clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use serde_json::json;

	#[tokio::test]
	async fn finish_is_finalize_once() {
		let store = MemoryHistoryStore::new();
		let handle = JobHandle::Managed(1);

		store
			.upsert_start(HistoryEntry::started(handle, "faces", "Detect faces"))
			.await
			.unwrap();
		store
			.finish(handle, JobStatus::Canceled, None, None)
			.await
			.unwrap();
		store
			.finish(
				handle,
				JobStatus::Completed,
				Some(json!({"faces": 3})),
				None,
			)
			.await
			.unwrap();

		let entries = store.list_recent(10).await.unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].status, JobStatus::Canceled);
		assert!(entries[0].metadata.is_none());
	}

	#[tokio::test]
	async fn progress_updates_stop_after_finalization() {
		let store = MemoryHistoryStore::new();
		let handle = JobHandle::Tracked(1);

		store
			.upsert_start(HistoryEntry::started(handle, "import", "Import"))
			.await
			.unwrap();
		store.update_progress(handle, 0.5).await.unwrap();
		store
			.finish(handle, JobStatus::Completed, None, None)
			.await
			.unwrap();
		store.update_progress(handle, 0.7).await.unwrap();

		let entries = store.list_recent(1).await.unwrap();
		assert_eq!(entries[0].fraction, 1.0);
	}
}
