//! Lifecycle and progress events, delivered to any number of observers over a
//! single serialized channel so every subscriber sees the same order.

use crate::{
	job::{JobHandle, JobMetadata},
	progress::ProgressSample,
};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSystemEvent {
	Started {
		handle: JobHandle,
		kind: String,
	},
	/// Debounced: at most one per active job per flush tick.
	Progress(ProgressSample),
	PartialResults {
		handle: JobHandle,
		kind: String,
		new_items: u64,
		total_items: u64,
		preview: Vec<serde_json::Value>,
	},
	Completed {
		handle: JobHandle,
		metadata: JobMetadata,
	},
	Failed {
		handle: JobHandle,
		error: String,
	},
	Canceled {
		handle: JobHandle,
	},
	Paused {
		handle: JobHandle,
	},
	Resumed {
		handle: JobHandle,
	},
	Log {
		handle: JobHandle,
		message: String,
	},
	ActiveJobsChanged {
		count: usize,
	},
	AllJobsCompleted,
}

/// Fan-out bus with a single ordered delivery path.
///
/// Emissions from any thread funnel through one unbounded channel into a pump
/// task which republishes on a broadcast channel; subscribers therefore all
/// observe the same event order. Slow subscribers lag and drop from their own
/// tail without affecting anyone else.
#[derive(Debug)]
pub(crate) struct EventBus {
	emit_tx: mpsc::UnboundedSender<JobSystemEvent>,
	broadcast_tx: broadcast::Sender<JobSystemEvent>,
}

impl EventBus {
	/// Must be called from within a tokio runtime, as it spawns the pump task.
	pub(crate) fn new(capacity: usize) -> Self {
		let (emit_tx, mut emit_rx) = mpsc::unbounded_channel();
		let (broadcast_tx, _) = broadcast::channel(capacity);

		let fan_out = broadcast_tx.clone();
		tokio::spawn(async move {
			while let Some(event) = emit_rx.recv().await {
				// A send error just means nobody is listening right now.
				fan_out.send(event).ok();
			}
		});

		Self {
			emit_tx,
			broadcast_tx,
		}
	}

	pub(crate) fn emit(&self, event: JobSystemEvent) {
		trace!(?event, "Emitting job system event;");
		// Only fails once the pump is gone, i.e. the runtime is shutting down.
		self.emit_tx.send(event).ok();
	}

	pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobSystemEvent> {
		self.broadcast_tx.subscribe()
	}
}
