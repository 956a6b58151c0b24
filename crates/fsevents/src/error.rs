use thiserror::Error;

use super::handle::{StreamHandle, ThreadHandle};

#[derive(Debug, Error)]
pub enum Error {
	#[error("stream is already scheduled <stream='{0}'>")]
	AlreadyScheduled(StreamHandle),
	#[error("stream is not scheduled <stream='{0}'>")]
	NotScheduled(StreamHandle),
	#[error("run loop can't run while holding the execution lock <thread='{0}'>")]
	NestedRunLoop(ThreadHandle),
	#[error(transparent)]
	NativeResource(#[from] NativeResourceError),
	#[error("failed to start event stream <stream='{stream}'>: {source}")]
	StartFailed {
		stream: StreamHandle,
		#[source]
		source: notify::Error,
	},
	#[error("event stream callback failed <stream='{stream}'>: {source}")]
	CallbackInvocation {
		stream: StreamHandle,
		#[source]
		source: CallbackError,
	},
}

/// Failures building the native path set of an event stream.
#[derive(Debug, Error)]
pub enum NativeResourceError {
	#[error("an event stream needs at least one path to watch")]
	EmptyPathSet,
	#[error("received an empty path")]
	EmptyPath,
	#[error("path can't be converted to a native string: <path='{0:?}'>")]
	InvalidPath(String),
}

/// Failure of a stream callback, as seen by the delivery bridge.
#[derive(Debug, Error)]
pub enum CallbackError {
	/// The callback ran and reported this error.
	#[error("callback raised an error: {0}")]
	Raised(#[source] Box<dyn std::error::Error + Send + Sync>),
	/// The callback could not complete and left no error of its own.
	#[error("unable to call callback function")]
	Unable,
}

impl CallbackError {
	pub fn raised(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
		Self::Raised(e.into())
	}
}
