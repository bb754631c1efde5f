use crate::job::JobHandle;

use std::io;

use thiserror::Error;

/// Failure of a single work unit (or of admitting one).
#[derive(Debug, Error)]
pub enum JobError {
	/// Returned by a unit that noticed its cancel hook and bailed out.
	#[error("job canceled")]
	Canceled,
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("payload serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("no work-unit factory registered for kind '{0}'")]
	UnknownKind(String),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// Errors surfaced by the persisted backlog behind its narrow interface.
#[derive(Debug, Error)]
pub enum BacklogError {
	#[error("backlog I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("backlog serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("backlog error: {0}")]
	Other(String),
}

/// Errors surfaced by the durable history store.
#[derive(Debug, Error)]
pub enum HistoryError {
	#[error("history I/O error: {0}")]
	Io(#[from] io::Error),
	#[error("history serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
	#[error("history error: {0}")]
	Other(String),
}

/// Errors returned by the engine's control and query surface.
#[derive(Debug, Error)]
pub enum JobSystemError {
	#[error("job not found: <handle='{0}'>")]
	NotFound(JobHandle),
	#[error("operation is not supported for tracked job: <handle='{0}'>")]
	TrackedUnsupported(JobHandle),
	#[error("tried to complete a managed job through the tracked reporting API: <handle='{0}'>")]
	NotTracked(JobHandle),
	#[error("no work-unit factory registered for kind '{0}'")]
	UnknownKind(String),
	#[error("backlog error: {0}")]
	Backlog(#[from] BacklogError),
	#[error("history error: {0}")]
	History(#[from] HistoryError),
}
