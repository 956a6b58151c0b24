//! Per thread run loops.
//!
//! A [`RunLoop`] is a blocking, message driven loop. Event streams attach to it as sources,
//! their engine threads post [`LoopMessage::Changes`], and the loop thread coalesces those
//! changes for the source's latency before performing them as one batch.

use std::{
	collections::{hash_map::Entry, HashMap},
	fmt,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use crossbeam_channel::{self as chan, RecvTimeoutError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use super::{error::Error, flags::EventFlags};

pub(crate) type LoopRef = Arc<RunLoop>;
pub(crate) type SourceId = u64;

/// Messages a loop buffers while it isn't running, or can't keep up with its engines.
pub(crate) const MESSAGES_CAPACITY: usize = 1024;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
	static CURRENT: LoopRef = RunLoop::new();
}

/// A single change on a watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Change {
	pub path: String,
	pub flags: EventFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Coalescing {
	pub latency: Duration,
	pub no_defer: bool,
}

/// Something a run loop performs batches for, on the loop's thread.
pub(crate) trait LoopSource: Send + Sync + 'static {
	fn perform(&self, changes: Vec<Change>);
}

#[derive(Debug)]
pub(crate) enum LoopMessage {
	Changes {
		source: SourceId,
		changes: Vec<Change>,
	},
	Wakeup,
}

struct AttachedSource {
	source: Arc<dyn LoopSource>,
	coalescing: Coalescing,
	last_flush: Option<Instant>,
}

struct PendingBatch {
	changes: Vec<Change>,
	deadline: Instant,
}

pub(crate) struct RunLoop {
	id: u64,
	msgs_tx: chan::Sender<LoopMessage>,
	msgs_rx: chan::Receiver<LoopMessage>,
	sources: Mutex<HashMap<SourceId, AttachedSource>>,
	stop_requested: AtomicBool,
	running: AtomicBool,
	pending_error: Mutex<Option<Error>>,
}

impl fmt::Debug for RunLoop {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RunLoop")
			.field("id", &self.id)
			.field("running", &self.running.load(Ordering::Relaxed))
			.field("sources", &self.sources.lock().len())
			.finish_non_exhaustive()
	}
}

impl RunLoop {
	pub(crate) fn new() -> LoopRef {
		let (msgs_tx, msgs_rx) = chan::bounded(MESSAGES_CAPACITY);

		Arc::new(Self {
			id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
			msgs_tx,
			msgs_rx,
			sources: Mutex::new(HashMap::new()),
			stop_requested: AtomicBool::new(false),
			running: AtomicBool::new(false),
			pending_error: Mutex::new(None),
		})
	}

	/// The run loop of the calling thread, created on first use.
	pub(crate) fn current() -> LoopRef {
		CURRENT.with(Arc::clone)
	}

	pub(crate) fn id(&self) -> u64 {
		self.id
	}

	pub(crate) fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	pub(crate) fn messages_sender(&self) -> chan::Sender<LoopMessage> {
		self.msgs_tx.clone()
	}

	pub(crate) fn add_source(
		&self,
		id: SourceId,
		source: Arc<dyn LoopSource>,
		coalescing: Coalescing,
	) {
		self.sources.lock().insert(
			id,
			AttachedSource {
				source,
				coalescing,
				last_flush: None,
			},
		);
	}

	pub(crate) fn remove_source(&self, id: SourceId) -> bool {
		self.sources.lock().remove(&id).is_some()
	}

	/// Asks the loop to return from [`RunLoop::run`], without waiting for it to do so.
	pub(crate) fn stop(&self) {
		self.stop_requested.store(true, Ordering::Release);
		match self.msgs_tx.try_send(LoopMessage::Wakeup) {
			// A full queue wakes the loop up just as well
			Ok(()) | Err(TrySendError::Full(_)) => {}
			Err(TrySendError::Disconnected(_)) => {
				warn!(loop_id = self.id, "Failed to wake up run loop to stop it;");
			}
		}
	}

	/// Records `error` for whoever is blocked in [`RunLoop::run`] and stops the loop.
	/// The first recorded error wins.
	pub(crate) fn stop_with_error(&self, error: Error) {
		{
			let mut pending_error = self.pending_error.lock();
			if pending_error.is_none() {
				*pending_error = Some(error);
			} else {
				debug!(?error, "Run loop already has a pending error, dropping this one;");
			}
		}

		self.stop();
	}

	pub(crate) fn take_error(&self) -> Option<Error> {
		self.pending_error.lock().take()
	}

	fn coalescing_of(&self, id: SourceId) -> Option<(Coalescing, Option<Instant>)> {
		self.sources
			.lock()
			.get(&id)
			.map(|attached| (attached.coalescing, attached.last_flush))
	}

	/// The source to perform a due batch on, recording the flush on it.
	fn flush(&self, id: SourceId) -> Option<Arc<dyn LoopSource>> {
		self.sources.lock().get_mut(&id).map(|attached| {
			attached.last_flush = Some(Instant::now());
			Arc::clone(&attached.source)
		})
	}

	fn enqueue(
		&self,
		pending: &mut HashMap<SourceId, PendingBatch>,
		source: SourceId,
		changes: Vec<Change>,
	) {
		match pending.entry(source) {
			Entry::Occupied(mut entry) => entry.get_mut().changes.extend(changes),
			Entry::Vacant(entry) => {
				if let Some((coalescing, last_flush)) = self.coalescing_of(source) {
					entry.insert(PendingBatch {
						changes,
						deadline: first_deadline(Instant::now(), coalescing, last_flush),
					});
				} else {
					trace!(source, "Dropping changes of a detached source");
				}
			}
		}
	}

	/// Blocks the calling thread processing messages until the loop is stopped.
	#[instrument(name = "run_loop", skip(self), fields(loop_id = self.id))]
	pub(crate) fn run(&self) {
		self.running.store(true, Ordering::Release);
		debug!("Run loop started");

		let mut pending = HashMap::<SourceId, PendingBatch>::new();

		'run: loop {
			if self.stop_requested.swap(false, Ordering::AcqRel) {
				break;
			}

			let next_deadline = pending.values().map(|batch| batch.deadline).min();

			let received = match next_deadline {
				Some(deadline) => match self.msgs_rx.recv_deadline(deadline) {
					Ok(msg) => Some(msg),
					Err(RecvTimeoutError::Timeout) => None,
					// We hold a sender ourselves, so this can't happen
					Err(RecvTimeoutError::Disconnected) => break,
				},
				None => match self.msgs_rx.recv() {
					Ok(msg) => Some(msg),
					Err(_) => break,
				},
			};

			// Whatever the engines already queued belongs to the same burst
			for msg in received
				.into_iter()
				.chain(self.msgs_rx.try_iter().take(MESSAGES_CAPACITY))
			{
				if let LoopMessage::Changes { source, changes } = msg {
					self.enqueue(&mut pending, source, changes);
				}
			}

			let now = Instant::now();
			let due = pending
				.iter()
				.filter(|(_, batch)| batch.deadline <= now)
				.map(|(id, _)| *id)
				.collect::<Vec<_>>();

			for source_id in due {
				let Some(batch) = pending.remove(&source_id) else {
					continue;
				};

				let Some(source) = self.flush(source_id) else {
					trace!(source = source_id, "Source detached before its batch was due");
					continue;
				};

				source.perform(coalesce(batch.changes));

				if self.stop_requested.load(Ordering::Acquire) {
					continue 'run;
				}
			}
		}

		self.running.store(false, Ordering::Release);
		debug!("Run loop stopped");
	}
}

/// When the first change of an idle source must be flushed.
///
/// No-defer sources idle for longer than the latency only wait half of it, enough for the
/// engine to report the rest of the burst a single write produces (create, then modify).
fn first_deadline(now: Instant, coalescing: Coalescing, last_flush: Option<Instant>) -> Instant {
	let Coalescing { latency, no_defer } = coalescing;

	if !no_defer {
		return now + latency;
	}

	match last_flush {
		Some(flushed_at) if now.duration_since(flushed_at) < latency => flushed_at + latency,
		_ => now + latency / 2,
	}
}

/// Merges changes on the same path, OR-ing their flags and keeping first seen order.
fn coalesce(changes: Vec<Change>) -> Vec<Change> {
	let mut positions = HashMap::<String, usize>::with_capacity(changes.len());
	let mut merged = Vec::<Change>::with_capacity(changes.len());

	for change in changes {
		match positions.entry(change.path.clone()) {
			Entry::Occupied(entry) => merged[*entry.get()].flags |= change.flags,
			Entry::Vacant(entry) => {
				entry.insert(merged.len());
				merged.push(change);
			}
		}
	}

	merged
}
