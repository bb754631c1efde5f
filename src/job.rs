use crate::{error::JobError, system::JobSystem};

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifier assigned by the persisted backlog when a managed job is enqueued.
pub type JobId = i64;

/// Identifier assigned by the engine when an externally owned job registers itself.
pub type TrackedId = u64;

/// A job known to the engine.
///
/// `Managed` jobs have their whole lifecycle owned by the engine, backed by the
/// persisted backlog (queue → claim → execute). `Tracked` jobs execute somewhere
/// else entirely; the engine only observes and reports on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobHandle {
	Managed(JobId),
	Tracked(TrackedId),
}

impl JobHandle {
	#[must_use]
	pub const fn is_managed(&self) -> bool {
		matches!(self, Self::Managed(_))
	}
}

impl fmt::Display for JobHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Managed(id) => write!(f, "managed:{id}"),
			Self::Tracked(id) => write!(f, "tracked:{id}"),
		}
	}
}

/// Admission priority of a queued job.
///
/// Priority only decides which queued job gets claimed next when a worker slot
/// frees up. It never preempts a job that is already running.
#[derive(
	Debug,
	Default,
	Clone,
	Copy,
	PartialEq,
	Eq,
	PartialOrd,
	Ord,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
	Low,
	#[default]
	Normal,
	High,
	Critical,
}

/// Arbitrary JSON payload a work unit can hand back on completion,
/// surfaced in the terminal event and the history record.
pub type JobMetadata = Option<serde_json::Value>;

pub type JobResult = Result<JobMetadata, JobError>;

/// The pluggable operation the engine dispatches and observes but does not
/// implement (face detection, embedding extraction, duplicate hashing, ...).
///
/// `run` does the actual work, reporting through the [`JobContext`] it
/// receives. The control hooks are cooperative and best-effort: a unit that
/// ignores them still runs to completion, it just takes longer to go away.
/// Units keep their control state in interior atomics so the engine can poke
/// them while `run` is in flight.
#[async_trait]
pub trait WorkUnit: Send + Sync {
	async fn run(&self, ctx: JobContext) -> JobResult;

	fn pause(&self) {}

	fn resume(&self) {}

	fn cancel(&self) {}
}

/// Builds an executable unit for one job kind from its queued payload.
pub trait WorkUnitFactory: Send + Sync {
	fn build(&self, payload: &serde_json::Value) -> Result<Arc<dyn WorkUnit>, JobError>;
}

impl<F> WorkUnitFactory for F
where
	F: Fn(&serde_json::Value) -> Result<Arc<dyn WorkUnit>, JobError> + Send + Sync,
{
	fn build(&self, payload: &serde_json::Value) -> Result<Arc<dyn WorkUnit>, JobError> {
		(self)(payload)
	}
}

/// Kind → factory table consulted at admission time.
#[derive(Default)]
pub struct WorkUnitRegistry {
	factories: HashMap<String, Arc<dyn WorkUnitFactory>>,
}

impl WorkUnitRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn register(
		mut self,
		kind: impl Into<String>,
		factory: impl WorkUnitFactory + 'static,
	) -> Self {
		self.factories.insert(kind.into(), Arc::new(factory));
		self
	}

	#[must_use]
	pub fn contains(&self, kind: &str) -> bool {
		self.factories.contains_key(kind)
	}

	pub(crate) fn build(
		&self,
		kind: &str,
		payload: &serde_json::Value,
	) -> Result<Arc<dyn WorkUnit>, JobError> {
		self.factories
			.get(kind)
			.ok_or_else(|| JobError::UnknownKind(kind.to_string()))?
			.build(payload)
	}
}

impl fmt::Debug for WorkUnitRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkUnitRegistry")
			.field("kinds", &self.factories.keys().collect::<Vec<_>>())
			.finish()
	}
}

/// Handed to a work unit for the duration of its `run`, bridging its raw
/// reports back into the engine's aggregation and event delivery.
#[derive(Clone)]
pub struct JobContext {
	handle: JobHandle,
	system: Arc<JobSystem>,
}

impl JobContext {
	pub(crate) fn new(handle: JobHandle, system: Arc<JobSystem>) -> Self {
		Self { handle, system }
	}

	#[must_use]
	pub const fn handle(&self) -> JobHandle {
		self.handle
	}

	/// Report raw progress. May be called at arbitrary rate from any thread;
	/// delivery to observers is debounced by the engine's flush tick.
	pub fn progress(&self, processed: u64, total: u64, message: impl Into<String>) {
		self.system.report_progress(self.handle, processed, total, message);
	}

	pub fn log(&self, message: impl Into<String>) {
		self.system.report_log(self.handle, message);
	}

	/// Surface a batch of partial results for progressive rendering before the
	/// job completes. Delivered immediately, not debounced.
	pub fn partial_results(
		&self,
		new_items: u64,
		total_items: u64,
		preview: Vec<serde_json::Value>,
	) {
		self.system
			.report_partial(self.handle, new_items, total_items, preview);
	}
}

impl fmt::Debug for JobContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("JobContext")
			.field("handle", &self.handle)
			.finish()
	}
}
