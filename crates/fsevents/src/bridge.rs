//! Delivery of coalesced batches from a run loop into stream callbacks.

use std::{
	panic::{self, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Weak,
	},
};

use tracing::{error, instrument, trace};

use super::{
	context::{CapturedContext, ExecutionLock},
	error::{CallbackError, Error},
	handle::StreamHandle,
	run_loop::{Change, LoopRef, LoopSource},
	system::Registries,
};

/// Receives the batches of an event stream: the changed paths and, at the same positions,
/// their [`EventFlags`](crate::EventFlags) bits.
///
/// Returning an error, or panicking, stops the run loop the stream is scheduled on and makes
/// the blocked [`FsEvents::run_loop`](crate::FsEvents::run_loop) call return that error.
pub trait Callback: Send + Sync + 'static {
	fn call(&self, paths: Vec<String>, flags: Vec<u64>) -> Result<(), CallbackError>;
}

impl<F> Callback for F
where
	F: Fn(Vec<String>, Vec<u64>) -> Result<(), CallbackError> + Send + Sync + 'static,
{
	fn call(&self, paths: Vec<String>, flags: Vec<u64>) -> Result<(), CallbackError> {
		self(paths, flags)
	}
}

/// What a scheduled stream needs at delivery time.
pub(crate) struct StreamInfo {
	stream: StreamHandle,
	callback: Box<dyn Callback>,
	run_loop: LoopRef,
	context: CapturedContext,
	execution: Weak<ExecutionLock<Registries>>,
	active: AtomicBool,
}

impl StreamInfo {
	pub(crate) fn new(
		stream: StreamHandle,
		callback: Box<dyn Callback>,
		run_loop: LoopRef,
		context: CapturedContext,
		execution: Weak<ExecutionLock<Registries>>,
	) -> Self {
		Self {
			stream,
			callback,
			run_loop,
			context,
			execution,
			active: AtomicBool::new(true),
		}
	}

	/// No batch is delivered after this returns, as deliveries check it under the execution
	/// lock the caller is holding.
	pub(crate) fn deactivate(&self) {
		self.active.store(false, Ordering::Release);
	}

	pub(crate) fn loop_id(&self) -> u64 {
		self.run_loop.id()
	}
}

impl LoopSource for StreamInfo {
	fn perform(&self, changes: Vec<Change>) {
		deliver(self, changes);
	}
}

#[instrument(skip_all, fields(stream = %info.stream, changes = changes.len()))]
fn deliver(info: &StreamInfo, changes: Vec<Change>) {
	let Some(execution) = info.execution.upgrade() else {
		trace!("Execution context is gone, dropping batch");
		return;
	};

	let _context = info.context.enter(&execution, &info.stream);

	if !info.active.load(Ordering::Acquire) {
		trace!("Stream was unscheduled, dropping batch");
		return;
	}

	let (paths, flags) = marshal(changes);

	if let Err(e) = invoke(info.callback.as_ref(), paths, flags) {
		error!(?e, "Stream callback failed, stopping its run loop;");
		info.run_loop.stop_with_error(Error::CallbackInvocation {
			stream: info.stream.clone(),
			source: e,
		});
	}
}

fn marshal(changes: Vec<Change>) -> (Vec<String>, Vec<u64>) {
	changes
		.into_iter()
		.map(|Change { path, flags }| (path, u64::from(flags.bits())))
		.unzip()
}

fn invoke(callback: &dyn Callback, paths: Vec<String>, flags: Vec<u64>) -> Result<(), CallbackError> {
	panic::catch_unwind(AssertUnwindSafe(|| callback.call(paths, flags)))
		.unwrap_or(Err(CallbackError::Unable))
}
