//! Exclusive execution context shared by callers, run loops and callbacks.
//!
//! Every registry access and every callback invocation happens while holding the
//! [`ExecutionLock`]. It is reentrant so a callback can schedule or unschedule streams from
//! inside a delivery, and it must be released around the blocking wait of a run loop,
//! otherwise no delivery could ever take place.

use std::{
	cell::{Cell, RefCell},
	thread::{self, ThreadId},
};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{span::EnteredSpan, trace_span, Span};

use super::handle::StreamHandle;

struct Locked<T> {
	state: RefCell<T>,
	/// How many guards the owning thread holds.
	depth: Cell<usize>,
}

pub(crate) struct ExecutionLock<T> {
	inner: ReentrantMutex<Locked<T>>,
}

impl<T> ExecutionLock<T> {
	pub(crate) fn new(state: T) -> Self {
		Self {
			inner: ReentrantMutex::new(Locked {
				state: RefCell::new(state),
				depth: Cell::new(0),
			}),
		}
	}

	pub(crate) fn acquire(&self) -> ExecutionGuard<'_, T> {
		let locked = self.inner.lock();
		locked.depth.set(locked.depth.get() + 1);

		ExecutionGuard { locked }
	}
}

pub(crate) struct ExecutionGuard<'lock, T> {
	locked: ReentrantMutexGuard<'lock, Locked<T>>,
}

impl<T> ExecutionGuard<'_, T> {
	/// Runs `f` with exclusive access to the guarded state.
	///
	/// `f` must not reenter the execution lock, the state is borrowed for its whole run.
	pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
		f(&mut self.locked.state.borrow_mut())
	}

	/// Whether this thread already held the lock when acquiring this guard.
	pub(crate) fn is_nested(&self) -> bool {
		self.locked.depth.get() > 1
	}

	/// Releases the lock while `f` runs, reacquiring it before returning.
	///
	/// Only this guard's level is released: when [nested](Self::is_nested), the lock stays
	/// held by the outer guards and other threads keep waiting.
	pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
		self.locked.depth.set(self.locked.depth.get().saturating_sub(1));
		let result = ReentrantMutexGuard::unlocked(&mut self.locked, f);
		self.locked.depth.set(self.locked.depth.get() + 1);

		result
	}
}

impl<T> Drop for ExecutionGuard<'_, T> {
	fn drop(&mut self) {
		self.locked.depth.set(self.locked.depth.get().saturating_sub(1));
	}
}

/// Context current at the time a stream was scheduled, restored for each of its deliveries.
#[derive(Debug, Clone)]
pub(crate) struct CapturedContext {
	span: Span,
	thread: ThreadId,
	thread_name: Option<String>,
}

impl CapturedContext {
	pub(crate) fn capture() -> Self {
		let current = thread::current();

		Self {
			span: Span::current(),
			thread: current.id(),
			thread_name: current.name().map(ToOwned::to_owned),
		}
	}

	/// Acquires the execution lock and enters the captured context on the calling thread.
	pub(crate) fn enter<'lock, T>(
		&self,
		lock: &'lock ExecutionLock<T>,
		stream: &StreamHandle,
	) -> ContextGuard<'lock, T> {
		let execution = lock.acquire();

		let span = trace_span!(
			parent: &self.span,
			"stream_delivery",
			%stream,
			origin_thread = ?self.thread,
			origin_thread_name = self.thread_name.as_deref(),
		)
		.entered();

		ContextGuard {
			_span: span,
			_execution: execution,
		}
	}
}

/// Fields drop in order: the previous context is restored before the lock is released.
pub(crate) struct ContextGuard<'lock, T> {
	_span: EnteredSpan,
	_execution: ExecutionGuard<'lock, T>,
}
