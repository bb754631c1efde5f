//! Derivation of observer-facing progress samples from raw reports. The raw
//! call volume is unbounded; only the latest sample per job survives until the
//! next flush tick.

use crate::job::JobHandle;

use std::time::Duration;

use serde::Serialize;

/// Latest raw report for a job, waiting for the next flush tick.
#[derive(Debug, Clone)]
pub(crate) struct PendingSample {
	pub processed: u64,
	pub total: u64,
	pub message: String,
}

/// What observers receive on each flush.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSample {
	pub handle: JobHandle,
	pub processed: u64,
	pub total: u64,
	/// Items per second since the job started. Plain renewal estimate, no
	/// smoothing.
	pub rate: f64,
	pub eta_seconds: Option<f64>,
	pub message: String,
}

pub(crate) fn sample(handle: JobHandle, pending: &PendingSample, elapsed: Duration) -> ProgressSample {
	let elapsed_secs = elapsed.as_secs_f64();
	let rate = if elapsed_secs > 0.0 {
		pending.processed as f64 / elapsed_secs
	} else {
		0.0
	};
	let eta_seconds = (rate > 0.0)
		.then(|| pending.total.saturating_sub(pending.processed) as f64 / rate);

	ProgressSample {
		handle,
		processed: pending.processed,
		total: pending.total,
		rate,
		eta_seconds,
		message: pending.message.clone(),
	}
}

pub(crate) fn fraction(processed: u64, total: u64) -> f64 {
	if total == 0 {
		0.0
	} else {
		(processed as f64 / total as f64).clamp(0.0, 1.0)
	}
}
