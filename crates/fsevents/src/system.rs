use std::{fmt, sync::Arc};

use tracing::{debug, instrument, trace};

use super::{
	bridge::{Callback, StreamInfo},
	config::Config,
	context::{CapturedContext, ExecutionLock},
	error::Error,
	flags::{CreateFlags, EVENT_ID_SINCE_NOW},
	handle::{StreamHandle, ThreadHandle},
	registry::{AlreadyRegistered, Registry},
	run_loop::{LoopRef, LoopSource, RunLoop},
	stream::{EventStream, PathSet},
};

/// Flags every scheduled stream is created with.
const STREAM_FLAGS: CreateFlags = CreateFlags::NO_DEFER;

/// A scheduled stream: the native stream and its delivery metadata.
pub(crate) struct StreamRef {
	native: EventStream,
	info: Arc<StreamInfo>,
}

pub(crate) struct Registries {
	pub(crate) loops: Registry<ThreadHandle, LoopRef>,
	pub(crate) streams: Registry<StreamHandle, StreamRef>,
}

/// Loop and stream registries, with the four operations mediating between callers, run
/// loops and callbacks.
///
/// Cloning is cheap and every clone shares the same registries.
#[derive(Clone)]
pub struct FsEvents {
	execution: Arc<ExecutionLock<Registries>>,
	config: Config,
}

impl fmt::Debug for FsEvents {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.execution.acquire().with(|state| {
			f.debug_struct("FsEvents")
				.field("config", &self.config)
				.field("loops", &state.loops)
				.field("streams", &state.streams)
				.finish()
		})
	}
}

impl Default for FsEvents {
	fn default() -> Self {
		Self::new()
	}
}

impl FsEvents {
	#[must_use]
	pub fn new() -> Self {
		Self::with_config(Config::default())
	}

	#[must_use]
	pub fn with_config(config: Config) -> Self {
		Self {
			execution: Arc::new(ExecutionLock::new(Registries {
				loops: Registry::new(),
				streams: Registry::new(),
			})),
			config,
		}
	}

	#[must_use]
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Runs the calling thread's run loop on behalf of `thread`, blocking until it is stopped.
	///
	/// Returns the error of a stream callback that failed during the run, if any.
	///
	/// Fails with [`Error::NestedRunLoop`] when the calling thread already holds the execution
	/// lock, as inside a stream callback: the lock could not be released for the run and no
	/// delivery would ever take place.
	#[instrument(skip_all, fields(thread = %thread), err)]
	pub fn run_loop(&self, thread: &ThreadHandle) -> Result<(), Error> {
		let mut execution = self.execution.acquire();

		if execution.is_nested() {
			return Err(Error::NestedRunLoop(thread.clone()));
		}

		let run_loop = execution.with(|state| {
			Arc::clone(
				state
					.loops
					.get_or_insert_with(thread.clone(), RunLoop::current),
			)
		});

		debug!(loop_id = run_loop.id(), "Running loop");

		execution.unlocked(|| run_loop.run());

		execution.with(|state| state.loops.unregister(thread));

		run_loop.take_error().map_or(Ok(()), Err)
	}

	/// Asks the loop running for `thread` to stop. Doesn't wait for it, and does nothing when
	/// no loop runs for `thread`.
	#[allow(clippy::unnecessary_wraps)]
	#[instrument(skip_all, fields(thread = %thread))]
	pub fn stop(&self, thread: &ThreadHandle) -> Result<(), Error> {
		let execution = self.execution.acquire();

		match execution.with(|state| state.loops.lookup(thread).cloned()) {
			Some(run_loop) => {
				debug!(loop_id = run_loop.id(), "Stopping run loop");
				run_loop.stop();
			}
			None => trace!("No run loop registered"),
		}

		Ok(())
	}

	/// Starts watching `paths` recursively, delivering their changes to `callback` on the loop
	/// registered for `thread`, or on the calling thread's loop if none is.
	#[instrument(skip_all, fields(thread = %thread, stream = %stream), err)]
	pub fn schedule<S: AsRef<str>>(
		&self,
		thread: &ThreadHandle,
		stream: &StreamHandle,
		callback: impl Callback,
		paths: impl IntoIterator<Item = S>,
	) -> Result<(), Error> {
		let execution = self.execution.acquire();

		if execution.with(|state| state.streams.contains(stream)) {
			return Err(Error::AlreadyScheduled(stream.clone()));
		}

		let paths = PathSet::new(paths)?;

		let run_loop = execution
			.with(|state| state.loops.lookup(thread).cloned())
			.unwrap_or_else(RunLoop::current);

		let info = Arc::new(StreamInfo::new(
			stream.clone(),
			Box::new(callback),
			Arc::clone(&run_loop),
			CapturedContext::capture(),
			Arc::downgrade(&self.execution),
		));

		let source: Arc<dyn LoopSource> = info.clone();
		let mut native = EventStream::create(
			source,
			paths,
			EVENT_ID_SINCE_NOW,
			self.config.latency,
			STREAM_FLAGS,
		);

		native.schedule_with_run_loop(&run_loop);

		if let Err(e) = native.start() {
			native.invalidate();
			return Err(Error::StartFailed {
				stream: stream.clone(),
				source: e,
			});
		}

		execution
			.with(|state| {
				state
					.streams
					.register(stream.clone(), StreamRef { native, info })
			})
			.map_err(|AlreadyRegistered(rejected)| {
				rejected.info.deactivate();
				Error::AlreadyScheduled(stream.clone())
			})?;

		debug!(loop_id = run_loop.id(), "Stream scheduled");

		Ok(())
	}

	/// Stops watching for `stream`. Its callback is never called again once this returns.
	#[instrument(skip_all, fields(stream = %stream), err)]
	pub fn unschedule(&self, stream: &StreamHandle) -> Result<(), Error> {
		let execution = self.execution.acquire();

		let StreamRef { mut native, info } = execution
			.with(|state| state.streams.unregister(stream))
			.ok_or_else(|| Error::NotScheduled(stream.clone()))?;

		info.deactivate();

		native.stop();
		native.invalidate();
		drop(native);

		debug!(loop_id = info.loop_id(), "Stream unscheduled");

		Ok(())
	}

	/// Whether a run loop is currently running on behalf of `thread`.
	#[must_use]
	pub fn is_running(&self, thread: &ThreadHandle) -> bool {
		self.execution
			.acquire()
			.with(|state| state.loops.lookup(thread).is_some_and(|run_loop| run_loop.is_running()))
	}

	#[must_use]
	pub fn is_scheduled(&self, stream: &StreamHandle) -> bool {
		self.execution
			.acquire()
			.with(|state| state.streams.contains(stream))
	}

	/// Handles of every stream currently scheduled, in no particular order.
	#[must_use]
	pub fn scheduled_streams(&self) -> Vec<StreamHandle> {
		self.execution
			.acquire()
			.with(|state| state.streams.keys().cloned().collect())
	}
}
