//! The engine itself: admission dispatching, the active-registry state
//! machine, worker lifecycle, progress flushing and lease renewal. One
//! internal runner task owns the dispatch path; callers only ever take the
//! short-lived registry mutex.

use crate::{
	backlog::{Backlog, QueuedJob, QueuedStatus},
	config::JobSystemConfig,
	error::{JobError, JobSystemError},
	event::{EventBus, JobSystemEvent},
	history::{HistoryEntry, HistoryRecorder, HistoryStore, JobStatus},
	job::{
		JobContext, JobHandle, JobId, JobMetadata, JobResult, Priority, WorkUnitRegistry,
	},
	progress::{self, PendingSample},
	registry::{ActiveJob, ActiveJobInfo, JobSystemStats, RegistryState},
};

use std::{mem, pin::pin, sync::Arc};

use async_channel as chan;
use futures::StreamExt;
use futures_concurrency::stream::Merge;
use parking_lot::Mutex;
use tokio::{
	spawn,
	sync::{broadcast, oneshot},
	time::{interval, Instant, MissedTickBehavior},
};
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

enum SystemMessage {
	TryAdmit,
	Shutdown(oneshot::Sender<()>),
}

/// The job orchestration engine. One instance per process, constructed at
/// startup and passed explicitly to call sites.
pub struct JobSystem {
	config: JobSystemConfig,
	backlog: Arc<dyn Backlog>,
	history: HistoryRecorder,
	units: WorkUnitRegistry,
	events: EventBus,
	state: Mutex<RegistryState>,
	msgs_tx: chan::Sender<SystemMessage>,
	/// Claim token identifying this dispatcher instance to the backlog.
	owner: Uuid,
}

impl JobSystem {
	/// Initializes the engine and spawns its internal runner loop. Must be
	/// called from within a tokio runtime.
	pub fn new(
		config: JobSystemConfig,
		backlog: Arc<dyn Backlog>,
		history: Arc<dyn HistoryStore>,
		units: WorkUnitRegistry,
	) -> Arc<Self> {
		let (msgs_tx, msgs_rx) = chan::unbounded();

		let this = Arc::new(Self {
			events: EventBus::new(config.event_capacity),
			config,
			backlog,
			history: HistoryRecorder::new(history),
			units,
			state: Mutex::new(RegistryState::new()),
			msgs_tx,
			owner: Uuid::new_v4(),
		});

		spawn(Arc::clone(&this).run(msgs_rx));

		debug!(owner = %this.owner, "Job system initialized;");

		this
	}

	/// Subscribe to the single ordered event channel.
	pub fn subscribe(&self) -> broadcast::Receiver<JobSystemEvent> {
		self.events.subscribe()
	}

	// ---- Admission / control API ----

	/// Enqueues a managed job into the persisted backlog and triggers an
	/// admission pass. Never blocks on claim I/O or work execution.
	#[instrument(skip(self, payload), fields(%priority), err)]
	pub async fn enqueue(
		&self,
		kind: &str,
		scope: &str,
		priority: Priority,
		payload: serde_json::Value,
	) -> Result<JobId, JobSystemError> {
		let id = self.backlog.enqueue(kind, payload, priority, scope).await?;

		debug!(job_id = id, "Enqueued job;");
		self.notify_admission();

		Ok(id)
	}

	/// Registers an externally executed job for observation. It is `Running`
	/// immediately and holds no worker slot.
	#[instrument(skip(self, cancel_hook))]
	pub async fn register_tracked(
		&self,
		kind: &str,
		scope: &str,
		total_hint: u64,
		description: &str,
		cancel_hook: impl Fn() + Send + Sync + 'static,
	) -> JobHandle {
		let (handle, count) = {
			let mut state = self.state.lock();
			state.next_tracked_id += 1;
			let handle = JobHandle::Tracked(state.next_tracked_id);
			state.active.insert(
				handle,
				ActiveJob::tracked(
					handle,
					kind,
					scope,
					description,
					total_hint,
					Box::new(cancel_hook),
				),
			);
			(handle, state.active.len())
		};

		self.history
			.upsert_start(HistoryEntry::started(handle, kind, description))
			.await;

		self.events.emit(JobSystemEvent::Started {
			handle,
			kind: kind.to_string(),
		});
		self.events.emit(JobSystemEvent::ActiveJobsChanged { count });

		info!(%handle, "Tracking externally executed job;");

		handle
	}

	/// Cooperatively pauses a running managed job. Its worker slot frees up,
	/// so a queued job may start while this one waits.
	#[instrument(skip(self), fields(%handle), err)]
	pub fn pause(&self, handle: JobHandle) -> Result<(), JobSystemError> {
		let unit = {
			let mut state = self.state.lock();
			let job = state
				.active
				.get_mut(&handle)
				.ok_or(JobSystemError::NotFound(handle))?;

			if !handle.is_managed() {
				return Err(JobSystemError::TrackedUnsupported(handle));
			}
			if job.paused {
				return Ok(());
			}

			job.paused = true;
			job.unit.clone()
		};

		if let Some(unit) = unit {
			unit.pause();
		}

		debug!("Pausing job;");
		self.events.emit(JobSystemEvent::Paused { handle });
		self.notify_admission();

		Ok(())
	}

	/// Resumes a paused managed job. Unconditional: the concurrency bound is
	/// enforced at admission only, so resuming while every slot is busy can
	/// transiently push the number of running jobs past `max_workers`.
	#[instrument(skip(self), fields(%handle), err)]
	pub fn resume(&self, handle: JobHandle) -> Result<(), JobSystemError> {
		let unit = {
			let mut state = self.state.lock();
			let job = state
				.active
				.get_mut(&handle)
				.ok_or(JobSystemError::NotFound(handle))?;

			if !handle.is_managed() {
				return Err(JobSystemError::TrackedUnsupported(handle));
			}
			if !job.paused {
				return Ok(());
			}

			job.paused = false;
			job.unit.clone()
		};

		if let Some(unit) = unit {
			unit.resume();
		}

		debug!("Resuming job;");
		self.events.emit(JobSystemEvent::Resumed { handle });
		self.notify_admission();

		Ok(())
	}

	/// Cancels a job in any pre-terminal state.
	///
	/// Queued and unclaimed: marked canceled in the backlog, never starts.
	/// Running or paused: cooperative cancel hook fires and the record is torn
	/// down immediately; if the unit finishes anyway, its terminal transition
	/// loses the remove-if-present race and emits nothing.
	#[instrument(skip(self), fields(%handle), err)]
	pub async fn cancel(&self, handle: JobHandle) -> Result<(), JobSystemError> {
		if let Some((job, pending, remaining)) = self.take_active(handle, true) {
			debug!("Canceling active job;");
			if let Some(unit) = &job.unit {
				unit.cancel();
			}
			if let Some(hook) = &job.cancel_hook {
				hook();
			}

			self.finalize(job, pending, remaining, JobStatus::Canceled, None, None)
				.await;

			return Ok(());
		}

		if let JobHandle::Managed(id) = handle {
			if let Some(queued) = self.backlog.cancel_job(id).await? {
				debug!("Canceled still-queued job;");
				self.history
					.upsert_start(HistoryEntry::queued(handle, &queued.kind, &queued.kind))
					.await;
				self.history
					.finish(handle, JobStatus::Canceled, None, None)
					.await;
				self.events.emit(JobSystemEvent::Canceled { handle });

				return Ok(());
			}

			// The runner may have claimed it while we were looking at the
			// backlog; one re-check closes the window.
			if let Some((job, pending, remaining)) = self.take_active(handle, true) {
				if let Some(unit) = &job.unit {
					unit.cancel();
				}

				self.finalize(job, pending, remaining, JobStatus::Canceled, None, None)
					.await;

				return Ok(());
			}
		}

		Err(JobSystemError::NotFound(handle))
	}

	/// Suppresses all new starts without disturbing already-running jobs.
	pub fn pause_all(&self) {
		self.state.lock().admission_paused = true;
		info!("Admission paused; no new jobs will start;");
	}

	pub fn resume_all(&self) {
		self.state.lock().admission_paused = false;
		info!("Admission resumed;");
		self.notify_admission();
	}

	/// Cancels every queued and active job, optionally restricted to a scope.
	/// Returns how many jobs were canceled.
	#[instrument(skip(self), err)]
	pub async fn cancel_all(&self, scope: Option<&str>) -> Result<usize, JobSystemError> {
		let mut canceled = 0;

		// Queued first, so none of them get claimed mid-teardown.
		for queued in self.backlog.get_jobs(QueuedStatus::Queued, usize::MAX).await? {
			if scope.is_some_and(|scope| queued.scope != scope) {
				continue;
			}

			let handle = JobHandle::Managed(queued.id);
			if self.backlog.cancel_job(queued.id).await?.is_some() {
				self.history
					.upsert_start(HistoryEntry::queued(handle, &queued.kind, &queued.kind))
					.await;
				self.history
					.finish(handle, JobStatus::Canceled, None, None)
					.await;
				self.events.emit(JobSystemEvent::Canceled { handle });
				canceled += 1;
			}
		}

		let handles = {
			let state = self.state.lock();
			state
				.active
				.values()
				.filter(|job| scope.map_or(true, |scope| job.scope == scope))
				.map(|job| job.handle)
				.collect::<Vec<_>>()
		};

		for handle in handles {
			if self.cancel(handle).await.is_ok() {
				canceled += 1;
			}
		}

		Ok(canceled)
	}

	/// Raises (or lowers) the admission priority of a still-queued job.
	#[instrument(skip(self), fields(%priority), err)]
	pub async fn boost_priority(
		&self,
		id: JobId,
		priority: Priority,
	) -> Result<(), JobSystemError> {
		if self.backlog.set_priority(id, priority).await? {
			self.notify_admission();
			Ok(())
		} else {
			Err(JobSystemError::NotFound(JobHandle::Managed(id)))
		}
	}

	/// Stops admission, cooperatively cancels everything in flight and waits
	/// for the runner to acknowledge.
	pub async fn shutdown(&self) {
		let (tx, rx) = oneshot::channel();
		if self.msgs_tx.send(SystemMessage::Shutdown(tx)).await.is_err() {
			warn!("Job system runner already gone on shutdown;");
			return;
		}

		rx.await.ok();
	}

	// ---- Reporting API (work units and external owners) ----

	/// Records the latest raw progress sample for a job. Only the most recent
	/// sample per job survives until the next flush tick; reports against a
	/// finished job are dropped.
	pub fn report_progress(
		&self,
		handle: JobHandle,
		processed: u64,
		total: u64,
		message: impl Into<String>,
	) {
		let mut state = self.state.lock();
		let Some(job) = state.active.get_mut(&handle) else {
			trace!(%handle, "Dropping progress report for inactive job;");
			return;
		};

		job.processed = processed;
		job.total = total;
		state.pending_progress.insert(
			handle,
			PendingSample {
				processed,
				total,
				message: message.into(),
			},
		);
	}

	pub fn report_log(&self, handle: JobHandle, message: impl Into<String>) {
		if !self.state.lock().active.contains_key(&handle) {
			trace!(%handle, "Dropping log report for inactive job;");
			return;
		}

		let message = message.into();
		debug!(%handle, %message, "Job log;");
		self.events.emit(JobSystemEvent::Log { handle, message });
	}

	/// Delivers a batch of partial results immediately (not debounced).
	pub fn report_partial(
		&self,
		handle: JobHandle,
		new_items: u64,
		total_items: u64,
		preview: Vec<serde_json::Value>,
	) {
		let Some(kind) = self
			.state
			.lock()
			.active
			.get(&handle)
			.map(|job| job.kind.clone())
		else {
			trace!(%handle, "Dropping partial results for inactive job;");
			return;
		};

		self.events.emit(JobSystemEvent::PartialResults {
			handle,
			kind,
			new_items,
			total_items,
			preview,
		});
	}

	/// Terminal transition for a tracked job, reported by its external owner.
	#[instrument(skip(self, outcome), fields(%handle), err)]
	pub async fn complete_tracked(
		&self,
		handle: JobHandle,
		outcome: JobResult,
	) -> Result<(), JobSystemError> {
		if handle.is_managed() {
			return Err(JobSystemError::NotTracked(handle));
		}

		let (job, pending, remaining) = self
			.take_active(handle, false)
			.ok_or(JobSystemError::NotFound(handle))?;

		let (status, metadata, error) = settle(outcome);
		self.finalize(job, pending, remaining, status, metadata, error)
			.await;

		Ok(())
	}

	// ---- Query API ----

	pub fn get_active_jobs(&self) -> Vec<ActiveJobInfo> {
		let mut jobs = self
			.state
			.lock()
			.active
			.values()
			.map(ActiveJob::info)
			.collect::<Vec<_>>();
		jobs.sort_by_key(|info| info.started_at);

		jobs
	}

	pub async fn get_queued_jobs(&self, limit: usize) -> Result<Vec<QueuedJob>, JobSystemError> {
		Ok(self.backlog.get_jobs(QueuedStatus::Queued, limit).await?)
	}

	pub async fn get_stats(&self) -> Result<JobSystemStats, JobSystemError> {
		let queued = self
			.backlog
			.get_jobs(QueuedStatus::Queued, usize::MAX)
			.await?
			.len();

		let state = self.state.lock();

		Ok(JobSystemStats {
			active: state.active.len(),
			running: state.managed_running(),
			paused: state.paused_count(),
			queued,
			max_workers: self.config.max_workers,
			admission_paused: state.admission_paused,
		})
	}

	pub async fn get_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, JobSystemError> {
		Ok(self.history.list_recent(limit).await?)
	}

	pub async fn clear_history(&self) -> Result<(), JobSystemError> {
		Ok(self.history.clear_all().await?)
	}

	// ---- Internals ----

	fn notify_admission(&self) {
		// Only fails after shutdown, when there is nothing left to admit.
		self.msgs_tx.try_send(SystemMessage::TryAdmit).ok();
	}

	/// Atomic remove-if-present on the registry. Whoever gets the record back
	/// owns the terminal transition; everyone else observes `None` and must
	/// emit nothing.
	fn take_active(
		&self,
		handle: JobHandle,
		cancel_requested: bool,
	) -> Option<(ActiveJob, Option<PendingSample>, usize)> {
		let mut state = self.state.lock();
		let mut job = state.active.remove(&handle)?;
		job.cancel_requested |= cancel_requested;
		let pending = state.pending_progress.remove(&handle);

		Some((job, pending, state.active.len()))
	}

	/// Shared teardown for every terminal transition: flush the last buffered
	/// sample, settle the backlog row, finalize history, emit the terminal
	/// event and hand the freed slot back to the dispatcher.
	async fn finalize(
		&self,
		job: ActiveJob,
		pending: Option<PendingSample>,
		remaining: usize,
		status: JobStatus,
		metadata: JobMetadata,
		error: Option<String>,
	) {
		let handle = job.handle;

		if let Some(pending) = pending {
			self.events.emit(JobSystemEvent::Progress(progress::sample(
				handle,
				&pending,
				job.started_instant.elapsed(),
			)));
		}

		if let JobHandle::Managed(id) = handle {
			let settled = if status == JobStatus::Canceled {
				self.backlog.cancel_job(id).await.map(|_| ())
			} else {
				self.backlog
					.complete_job(id, status == JobStatus::Completed, error.clone())
					.await
			};

			if let Err(e) = settled {
				error!(%handle, ?e, "Failed to settle finished job in backlog;");
			}
		}

		self.history
			.finish(handle, status, metadata.clone(), error.clone())
			.await;

		match status {
			JobStatus::Completed => {
				info!(%handle, "Job completed;");
				self.events
					.emit(JobSystemEvent::Completed { handle, metadata });
			}
			JobStatus::Failed => {
				self.events.emit(JobSystemEvent::Failed {
					handle,
					error: error.unwrap_or_default(),
				});
			}
			JobStatus::Canceled => {
				self.events.emit(JobSystemEvent::Canceled { handle });
			}
			_ => unreachable!("finalize is only called with terminal statuses"),
		}

		self.events
			.emit(JobSystemEvent::ActiveJobsChanged { count: remaining });
		self.state.lock().finished_since_idle = true;
		self.notify_admission();
	}

	/// Terminal transition of a managed worker. The cancel path may have
	/// already torn the job down; losing that race is the expected way to
	/// guarantee exactly-once terminal delivery.
	async fn finish_managed(&self, handle: JobHandle, result: JobResult) {
		let Some((job, pending, remaining)) = self.take_active(handle, false) else {
			trace!(%handle, "Job already finalized; skipping duplicate terminal transition;");
			return;
		};

		let (status, metadata, error) = settle(result);
		if status == JobStatus::Failed {
			error!(%handle, error = %error.as_deref().unwrap_or_default(), "Job failed;");
		}

		self.finalize(job, pending, remaining, status, metadata, error)
			.await;
	}

	/// The single dispatch path. Messages, the progress flush tick and the
	/// heartbeat tick are merged into one stream so there is exactly one
	/// logical admission decision at a time.
	async fn run(self: Arc<Self>, msgs_rx: chan::Receiver<SystemMessage>) {
		enum StreamMessage {
			Message(SystemMessage),
			FlushTick,
			HeartbeatTick,
		}

		let mut flush_interval = interval(self.config.flush_interval);
		flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut heartbeat_interval = interval(self.config.heartbeat_interval);
		heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

		let mut msg_stream = pin!((
			msgs_rx.map(StreamMessage::Message),
			IntervalStream::new(flush_interval).map(|_| StreamMessage::FlushTick),
			IntervalStream::new(heartbeat_interval).map(|_| StreamMessage::HeartbeatTick),
		)
			.merge());

		while let Some(msg) = msg_stream.next().await {
			match msg {
				StreamMessage::Message(SystemMessage::TryAdmit) => self.try_admit().await,
				StreamMessage::Message(SystemMessage::Shutdown(ack)) => {
					self.shutdown_active().await;
					ack.send(()).ok();

					return;
				}
				StreamMessage::FlushTick => self.flush_progress().await,
				StreamMessage::HeartbeatTick => self.renew_leases().await,
			}
		}
	}

	/// One admission pass: claim and start queued jobs, highest priority
	/// first, while free slots remain.
	async fn try_admit(self: &Arc<Self>) {
		loop {
			let free = {
				let state = self.state.lock();
				if state.admission_paused {
					return;
				}
				self.config.max_workers.saturating_sub(state.managed_running())
			};
			if free == 0 {
				return;
			}

			let candidates = match self
				.backlog
				.get_jobs(QueuedStatus::Queued, self.config.claim_batch.max(free))
				.await
			{
				Ok(candidates) => candidates,
				Err(e) => {
					error!(?e, "Failed to fetch queued jobs; retrying on next trigger;");
					return;
				}
			};

			if candidates.is_empty() {
				let announce = {
					let mut state = self.state.lock();
					let idle = state.active.is_empty() && state.finished_since_idle;
					if idle {
						state.finished_since_idle = false;
					}
					idle
				};
				if announce {
					self.events.emit(JobSystemEvent::AllJobsCompleted);
				}
				return;
			}

			// A lost claim does not consume a slot; keep trying the next
			// candidate until the free slots are used up.
			let mut admitted = 0;
			let mut slots = free;
			for queued in candidates {
				if slots == 0 {
					break;
				}
				if self.admit(queued).await {
					admitted += 1;
					slots -= 1;
				}
			}

			if admitted == 0 {
				return;
			}
		}
	}

	/// Claims one candidate and spawns its worker. Claim races and admission
	/// failures are non-fatal; the pass simply moves on.
	async fn admit(self: &Arc<Self>, queued: QueuedJob) -> bool {
		let handle = JobHandle::Managed(queued.id);

		match self.backlog.claim(queued.id, self.owner).await {
			Ok(true) => {}
			Ok(false) => {
				debug!(%handle, "Lost claim race; trying next candidate;");
				return false;
			}
			Err(e) => {
				error!(%handle, ?e, "Failed to claim job;");
				return false;
			}
		}

		let unit = match self.units.build(&queued.kind, &queued.payload) {
			Ok(unit) => unit,
			Err(e) => {
				warn!(%handle, kind = %queued.kind, ?e, "Admission failed; marking job failed;");

				if let Err(e) = self
					.backlog
					.complete_job(queued.id, false, Some(e.to_string()))
					.await
				{
					error!(%handle, ?e, "Failed to mark unadmittable job failed in backlog;");
				}

				self.history
					.upsert_start(HistoryEntry::queued(handle, &queued.kind, &queued.kind))
					.await;
				self.history
					.finish(handle, JobStatus::Failed, None, Some(e.to_string()))
					.await;
				self.events.emit(JobSystemEvent::Failed {
					handle,
					error: e.to_string(),
				});

				// The failed candidate left the queue, so another pass may
				// find an admissible one.
				self.state.lock().finished_since_idle = true;
				self.notify_admission();

				return false;
			}
		};

		let count = {
			let mut state = self.state.lock();
			state
				.active
				.insert(handle, ActiveJob::managed(handle, &queued, Arc::clone(&unit)));
			state.active.len()
		};

		self.history
			.upsert_start(HistoryEntry::started(handle, &queued.kind, &queued.kind))
			.await;
		self.events.emit(JobSystemEvent::Started {
			handle,
			kind: queued.kind.clone(),
		});
		self.events.emit(JobSystemEvent::ActiveJobsChanged { count });

		info!(%handle, kind = %queued.kind, "Running job;");

		let system = Arc::clone(self);
		spawn(async move {
			let result = unit
				.run(JobContext::new(handle, Arc::clone(&system)))
				.await;
			system.finish_managed(handle, result).await;
		});

		true
	}

	/// Delivers the buffered progress samples accumulated since the last
	/// tick, bounding the event rate to one per active job per tick.
	async fn flush_progress(&self) {
		let (samples, history_updates) = {
			let mut state = self.state.lock();
			let pending = mem::take(&mut state.pending_progress);
			let mut samples = Vec::with_capacity(pending.len());
			let mut history_updates = Vec::new();

			for (handle, sample) in pending {
				// The job may have finished between report and flush; its
				// final sample was already flushed during teardown.
				let Some(job) = state.active.get_mut(&handle) else {
					continue;
				};

				let fraction = progress::fraction(sample.processed, sample.total);
				let throttle_elapsed = job.last_history_update.map_or(true, |last| {
					last.elapsed() >= self.config.history_progress_interval
				});
				if throttle_elapsed || fraction >= 1.0 {
					job.last_history_update = Some(Instant::now());
					history_updates.push((handle, fraction));
				}

				samples.push(progress::sample(
					handle,
					&sample,
					job.started_instant.elapsed(),
				));
			}

			(samples, history_updates)
		};

		for sample in samples {
			self.events.emit(JobSystemEvent::Progress(sample));
		}

		for (handle, fraction) in history_updates {
			self.history.update_progress(handle, fraction).await;
		}
	}

	/// Renews backlog leases for running managed jobs so external stall
	/// detection can tell a live claim from a dead one. Tracked jobs have no
	/// lease to renew.
	async fn renew_leases(&self) {
		let leases = {
			let state = self.state.lock();
			state
				.active
				.values()
				.filter(|job| !job.paused)
				.filter_map(|job| match job.handle {
					JobHandle::Managed(id) => Some((id, job.fraction())),
					JobHandle::Tracked(_) => None,
				})
				.collect::<Vec<_>>()
		};

		for (id, fraction) in leases {
			if let Err(e) = self.backlog.heartbeat(id, fraction).await {
				warn!(job_id = id, ?e, "Failed to renew backlog lease; retrying next tick;");
			}
		}
	}

	async fn shutdown_active(&self) {
		info!("Shutting down job system;");

		let handles = {
			let mut state = self.state.lock();
			state.admission_paused = true;
			state.active.keys().copied().collect::<Vec<_>>()
		};

		for handle in handles {
			if let Err(e) = self.cancel(handle).await {
				warn!(%handle, ?e, "Failed to cancel job during shutdown;");
			}
		}
	}
}

fn settle(result: JobResult) -> (JobStatus, JobMetadata, Option<String>) {
	match result {
		Ok(metadata) => (JobStatus::Completed, metadata, None),
		Err(JobError::Canceled) => (JobStatus::Canceled, None, None),
		Err(e) => (JobStatus::Failed, None, Some(e.to_string())),
	}
}
