use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the engine.
///
/// The defaults are the values the desktop app ships with; tests tighten the
/// tick intervals to keep themselves fast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct JobSystemConfig {
	/// Concurrency bound of the execution pool. Counts managed jobs that are
	/// `Running` and not paused; paused jobs give their slot back.
	pub max_workers: usize,
	/// Fixed interval at which buffered progress samples are delivered to
	/// observers.
	pub flush_interval: Duration,
	/// Interval at which backlog leases of active managed jobs are renewed.
	pub heartbeat_interval: Duration,
	/// Per-job throttle for progress writes to the history store. A 100%
	/// sample is always written through immediately.
	pub history_progress_interval: Duration,
	/// Capacity of the observer broadcast channel.
	pub event_capacity: usize,
	/// How many queued candidates to fetch per admission pass.
	pub claim_batch: usize,
}

impl Default for JobSystemConfig {
	fn default() -> Self {
		Self {
			max_workers: 4,
			flush_interval: Duration::from_millis(250),
			heartbeat_interval: Duration::from_secs(30),
			history_progress_interval: Duration::from_secs(1),
			event_capacity: 256,
			claim_batch: 16,
		}
	}
}
