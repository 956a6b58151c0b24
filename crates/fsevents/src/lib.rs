//!
//! # FSEvents
//!
//! Run loop based file system event streams.
//!
//! Callers schedule streams, sets of directory trees watched with one [`Callback`], onto run
//! loops identified by a [`ThreadHandle`]. Each run loop occupies the thread that calls
//! [`FsEvents::run_loop`] until someone calls [`FsEvents::stop`] for it, and every change
//! batch of the streams scheduled on it is delivered on that thread, coalesced for the
//! configured latency (10ms by default).
//!
//! All registry access and every callback invocation happen under one exclusive, reentrant
//! execution lock, released while a run loop waits for changes. A callback can therefore
//! schedule and unschedule streams itself. When a callback fails, its run loop stops and the
//! `run_loop` call blocked on it returns the failure.
//!
//! ## Basic example
//!
//! ```no_run
//! use sd_fsevents::{CallbackError, FsEvents, StreamHandle, ThreadHandle};
//!
//! use std::thread;
//!
//! let fs_events = FsEvents::new();
//! let worker = ThreadHandle::from("watcher");
//!
//! let runner = thread::spawn({
//!     let fs_events = fs_events.clone();
//!     let worker = worker.clone();
//!     move || fs_events.run_loop(&worker)
//! });
//!
//! while !fs_events.is_running(&worker) {
//!     thread::yield_now();
//! }
//!
//! fs_events
//!     .schedule(
//!         &worker,
//!         &StreamHandle::from("downloads"),
//!         |paths: Vec<String>, flags: Vec<u64>| -> Result<(), CallbackError> {
//!             for (path, flags) in paths.iter().zip(flags) {
//!                 println!("{path}: {flags:#x}");
//!             }
//!             Ok(())
//!         },
//!         ["/tmp/downloads"],
//!     )
//!     .unwrap();
//!
//! // ...
//!
//! fs_events.unschedule(&StreamHandle::from("downloads")).unwrap();
//! fs_events.stop(&worker).unwrap();
//! runner.join().unwrap().unwrap();
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use once_cell::sync::Lazy;

mod bridge;
mod config;
mod context;
mod error;
mod flags;
mod handle;
mod registry;
mod run_loop;
mod stream;
mod system;

pub use bridge::Callback;
pub use config::{Config, DEFAULT_LATENCY};
pub use error::{CallbackError, Error, NativeResourceError};
pub use flags::{CreateFlags, EventFlags, EventId, EVENT_ID_SINCE_NOW, POLLIN, POLLOUT};
pub use handle::{StreamHandle, ThreadHandle};
pub use system::FsEvents;

static GLOBAL: Lazy<FsEvents> = Lazy::new(FsEvents::new);

/// The process wide registries used by the free functions of this crate.
#[must_use]
pub fn global() -> &'static FsEvents {
	&GLOBAL
}

/// [`FsEvents::run_loop`] on the [`global`] registries.
pub fn run_loop(thread: &ThreadHandle) -> Result<(), Error> {
	GLOBAL.run_loop(thread)
}

/// [`FsEvents::stop`] on the [`global`] registries.
pub fn stop(thread: &ThreadHandle) -> Result<(), Error> {
	GLOBAL.stop(thread)
}

/// [`FsEvents::schedule`] on the [`global`] registries.
pub fn schedule<S: AsRef<str>>(
	thread: &ThreadHandle,
	stream: &StreamHandle,
	callback: impl Callback,
	paths: impl IntoIterator<Item = S>,
) -> Result<(), Error> {
	GLOBAL.schedule(thread, stream, callback, paths)
}

/// [`FsEvents::unschedule`] on the [`global`] registries.
pub fn unschedule(stream: &StreamHandle) -> Result<(), Error> {
	GLOBAL.unschedule(stream)
}
