//! Event streams: a set of watched paths feeding one run loop source.

use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use crossbeam_channel::{self as chan, TrySendError};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, instrument, trace, warn};

use super::{
	error::NativeResourceError,
	flags::{CreateFlags, EventFlags, EventId},
	run_loop::{Change, Coalescing, LoopMessage, LoopRef, LoopSource, SourceId},
};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(0);

/// Validated, non empty set of paths to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathSet(Vec<PathBuf>);

impl PathSet {
	pub(crate) fn new<S: AsRef<str>>(
		paths: impl IntoIterator<Item = S>,
	) -> Result<Self, NativeResourceError> {
		let paths = paths
			.into_iter()
			.map(|path| {
				let path = path.as_ref();
				if path.is_empty() {
					Err(NativeResourceError::EmptyPath)
				} else if path.contains('\0') {
					Err(NativeResourceError::InvalidPath(path.to_owned()))
				} else {
					Ok(PathBuf::from(path))
				}
			})
			.collect::<Result<Vec<_>, _>>()?;

		if paths.is_empty() {
			return Err(NativeResourceError::EmptyPathSet);
		}

		Ok(Self(paths))
	}

	pub(crate) fn iter(&self) -> impl Iterator<Item = &Path> {
		self.0.iter().map(PathBuf::as_path)
	}
}

/// A native change stream.
///
/// Lifecycle: created, scheduled on a run loop, started, then stopped, invalidated and
/// released (dropped). Dropping a stream that wasn't stopped or invalidated does both.
pub(crate) struct EventStream {
	id: SourceId,
	paths: PathSet,
	since_when: EventId,
	latency: Duration,
	flags: CreateFlags,
	source: Arc<dyn LoopSource>,
	run_loop: Option<LoopRef>,
	watcher: Option<RecommendedWatcher>,
}

impl EventStream {
	pub(crate) fn create(
		source: Arc<dyn LoopSource>,
		paths: PathSet,
		since_when: EventId,
		latency: Duration,
		flags: CreateFlags,
	) -> Self {
		Self {
			id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
			paths,
			since_when,
			latency,
			flags,
			source,
			run_loop: None,
			watcher: None,
		}
	}

	pub(crate) fn schedule_with_run_loop(&mut self, run_loop: &LoopRef) {
		run_loop.add_source(
			self.id,
			Arc::clone(&self.source),
			Coalescing {
				latency: self.latency,
				no_defer: self.flags.contains(CreateFlags::NO_DEFER),
			},
		);

		if let Some(previous) = self.run_loop.replace(Arc::clone(run_loop)) {
			previous.remove_source(self.id);
		}
	}

	#[instrument(
		skip(self),
		fields(
			source = self.id,
			since_when = self.since_when,
			latency = ?self.latency,
			flags = ?self.flags,
		),
		err,
	)]
	pub(crate) fn start(&mut self) -> Result<(), notify::Error> {
		let Some(run_loop) = &self.run_loop else {
			return Err(notify::Error::generic(
				"event stream must be scheduled on a run loop before starting",
			));
		};

		let mut poster = ChangePoster::new(
			self.id,
			run_loop.messages_sender(),
			&self.paths,
			self.flags.contains(CreateFlags::WATCH_ROOT),
		);

		let mut watcher = RecommendedWatcher::new(
			move |result: notify::Result<Event>| match result {
				Ok(event) => poster.post(event),
				Err(e) => error!(?e, source = poster.source, "File system watcher error;"),
			},
			NotifyConfig::default(),
		)?;

		for path in self.paths.iter() {
			watcher.watch(path, RecursiveMode::Recursive)?;
		}

		self.watcher = Some(watcher);
		trace!("Event stream started");

		Ok(())
	}

	pub(crate) fn stop(&mut self) {
		if let Some(mut watcher) = self.watcher.take() {
			for path in self.paths.iter() {
				if let Err(e) = watcher.unwatch(path) {
					warn!(?e, path = %path.display(), "Failed to unwatch path;");
				}
			}
			trace!(source = self.id, "Event stream stopped");
		}
	}

	pub(crate) fn invalidate(&mut self) {
		if let Some(run_loop) = self.run_loop.take() {
			run_loop.remove_source(self.id);
			trace!(source = self.id, loop_id = run_loop.id(), "Event stream invalidated");
		}
	}
}

impl Drop for EventStream {
	fn drop(&mut self) {
		self.stop();
		self.invalidate();
	}
}

/// Forwards engine events to a run loop without ever blocking the engine thread.
///
/// When the loop's queue is full the changes are dropped, and the next batch that gets
/// through starts with every root flagged [`EventFlags::USER_DROPPED`], telling the callback
/// to rescan.
struct ChangePoster {
	source: SourceId,
	msgs_tx: chan::Sender<LoopMessage>,
	roots: Vec<PathBuf>,
	watch_roots: bool,
	dropped: bool,
}

impl ChangePoster {
	fn new(
		source: SourceId,
		msgs_tx: chan::Sender<LoopMessage>,
		paths: &PathSet,
		watch_roots: bool,
	) -> Self {
		Self {
			source,
			msgs_tx,
			roots: paths.iter().map(Path::to_path_buf).collect(),
			watch_roots,
			dropped: false,
		}
	}

	fn post(&mut self, event: Event) {
		let watch_roots = self.watch_roots.then_some(self.roots.as_slice());
		let mut changes = changes_from_event(event, watch_roots);
		if changes.is_empty() {
			return;
		}

		if self.dropped {
			changes.splice(
				0..0,
				self.roots.iter().map(|root| Change {
					path: root.to_string_lossy().into_owned(),
					flags: EventFlags::USER_DROPPED | EventFlags::MUST_SCAN_SUB_DIRS,
				}),
			);
		}

		match self.msgs_tx.try_send(LoopMessage::Changes {
			source: self.source,
			changes,
		}) {
			Ok(()) => self.dropped = false,
			Err(TrySendError::Full(_)) => {
				if !self.dropped {
					warn!(
						source = self.source,
						"Run loop queue is full, dropping file system changes;"
					);
				}
				self.dropped = true;
			}
			Err(TrySendError::Disconnected(_)) => {
				error!(
					source = self.source,
					"Unable to send file system changes to run loop;"
				);
			}
		}
	}
}

fn changes_from_event(event: Event, watch_roots: Option<&[PathBuf]>) -> Vec<Change> {
	let Some(mut flags) = EventFlags::from_kind(&event.kind) else {
		return vec![];
	};

	if event.need_rescan() {
		flags |= EventFlags::MUST_SCAN_SUB_DIRS;
	}

	let root_changed = flags.intersects(EventFlags::ITEM_REMOVED | EventFlags::ITEM_RENAMED);

	event
		.paths
		.into_iter()
		.map(|path| {
			let mut flags = flags;
			if root_changed && watch_roots.is_some_and(|roots| roots.contains(&path)) {
				flags |= EventFlags::ROOT_CHANGED;
			}

			Change {
				path: path.to_string_lossy().into_owned(),
				flags,
			}
		})
		.collect()
}
