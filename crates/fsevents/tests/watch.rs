use sd_fsevents::{
	Callback, CallbackError, Error, EventFlags, FsEvents, NativeResourceError, StreamHandle,
	ThreadHandle,
};

use std::{
	collections::HashSet,
	fs,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc,
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use crossbeam_channel as chan;
use tempfile::TempDir;
use tracing_test::traced_test;

const TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE: Duration = Duration::from_millis(200);

type Batch = (Vec<String>, Vec<u64>);

fn watched_dir() -> (TempDir, PathBuf) {
	let dir = tempfile::tempdir().unwrap();
	// Engines report resolved paths, e.g. /private/var instead of /var on macOS
	let root = dir.path().canonicalize().unwrap();
	(dir, root)
}

fn as_str(path: &Path) -> &str {
	path.to_str().unwrap()
}

fn recorder() -> (impl Callback, chan::Receiver<Batch>) {
	let (batches_tx, batches_rx) = chan::unbounded();

	(
		move |paths: Vec<String>, flags: Vec<u64>| -> Result<(), CallbackError> {
			batches_tx
				.send((paths, flags))
				.map_err(CallbackError::raised)
		},
		batches_rx,
	)
}

fn spawn_loop(fs_events: &FsEvents, name: &str) -> (ThreadHandle, JoinHandle<Result<(), Error>>) {
	let handle = ThreadHandle::from(name);

	let runner = thread::Builder::new()
		.name(name.to_string())
		.spawn({
			let fs_events = fs_events.clone();
			let handle = handle.clone();
			move || fs_events.run_loop(&handle)
		})
		.unwrap();

	wait_until_running(fs_events, &handle);

	(handle, runner)
}

fn wait_until_running(fs_events: &FsEvents, handle: &ThreadHandle) {
	let started_at = Instant::now();
	while !fs_events.is_running(handle) {
		assert!(started_at.elapsed() < TIMEOUT, "run loop didn't start");
		thread::sleep(Duration::from_millis(1));
	}
}

fn delivers(batch: &Batch, path: &Path) -> bool {
	batch.0.iter().any(|delivered| Path::new(delivered) == path)
}

fn join(runner: JoinHandle<Result<(), Error>>) -> Result<(), Error> {
	let started_at = Instant::now();
	while !runner.is_finished() {
		assert!(started_at.elapsed() < TIMEOUT, "run loop didn't stop");
		thread::sleep(Duration::from_millis(1));
	}

	runner.join().unwrap()
}

fn wait_for(batches: &chan::Receiver<Batch>, path: &Path) -> Batch {
	let started_at = Instant::now();
	loop {
		let remaining = TIMEOUT.saturating_sub(started_at.elapsed());
		let batch = batches
			.recv_timeout(remaining)
			.unwrap_or_else(|e| panic!("no batch for {}: {e}", path.display()));

		if delivers(&batch, path) {
			return batch;
		}
	}
}

fn flag(bits: EventFlags) -> u64 {
	u64::from(bits.bits())
}

#[test]
#[traced_test]
fn schedule_twice_fails_until_unscheduled() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let thread = ThreadHandle::from("scheduler");
	let stream = StreamHandle::from("twice");

	let (callback, _batches) = recorder();
	fs_events
		.schedule(&thread, &stream, callback, [as_str(&root)])
		.unwrap();

	let (other_callback, _other_batches) = recorder();
	assert!(matches!(
		fs_events.schedule(&thread, &stream, other_callback, [as_str(&root)]),
		Err(Error::AlreadyScheduled(rejected)) if rejected == stream
	));
	assert!(logs_contain("stream is already scheduled"));
	assert_eq!(fs_events.scheduled_streams(), [stream.clone()]);

	fs_events.unschedule(&stream).unwrap();
	assert!(matches!(
		fs_events.unschedule(&stream),
		Err(Error::NotScheduled(missing)) if missing == stream
	));
	assert!(!fs_events.is_scheduled(&stream));

	// The handle is free again
	let (callback, _batches) = recorder();
	fs_events
		.schedule(&thread, &stream, callback, [as_str(&root)])
		.unwrap();
	fs_events.unschedule(&stream).unwrap();
}

#[test]
fn stopping_an_unknown_thread_is_a_no_op() {
	let fs_events = FsEvents::new();
	let nobody = ThreadHandle::from("nobody");

	fs_events.stop(&nobody).unwrap();
	assert!(!fs_events.is_running(&nobody));
}

#[test]
fn invalid_path_sets_are_rejected() {
	let fs_events = FsEvents::new();
	let thread = ThreadHandle::from("scheduler");
	let stream = StreamHandle::from("invalid");

	let (callback, _batches) = recorder();
	assert!(matches!(
		fs_events.schedule(&thread, &stream, callback, Vec::<String>::new()),
		Err(Error::NativeResource(NativeResourceError::EmptyPathSet))
	));

	let (callback, _batches) = recorder();
	assert!(matches!(
		fs_events.schedule(&thread, &stream, callback, [""]),
		Err(Error::NativeResource(NativeResourceError::EmptyPath))
	));

	assert!(!fs_events.is_scheduled(&stream));
}

#[test]
fn failing_to_start_registers_nothing() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let stream = StreamHandle::from("missing");

	let (callback, _batches) = recorder();
	let result = fs_events.schedule(
		&ThreadHandle::from("scheduler"),
		&stream,
		callback,
		[as_str(&root.join("does-not-exist"))],
	);

	assert!(matches!(result, Err(Error::StartFailed { stream: failed, .. }) if failed == stream));
	assert!(!fs_events.is_scheduled(&stream));
	assert!(matches!(
		fs_events.unschedule(&stream),
		Err(Error::NotScheduled(_))
	));
}

#[test]
#[traced_test]
fn created_files_are_delivered_and_stop_ends_the_loop() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "created-files-loop");
	let stream = StreamHandle::from("created-files");

	let (callback, batches) = recorder();
	fs_events
		.schedule(&thread, &stream, callback, [as_str(&root)])
		.unwrap();

	let file = root.join("created.txt");
	fs::write(&file, b"hello").unwrap();

	let (paths, flags) = wait_for(&batches, &file);
	assert_eq!(paths.len(), flags.len());

	let position = paths
		.iter()
		.position(|delivered| Path::new(delivered) == file)
		.unwrap();
	assert_ne!(flags[position] & flag(EventFlags::ITEM_CREATED), 0);

	// Creating and writing the file is a single burst for the engine
	thread::sleep(SETTLE);
	assert_eq!(
		batches
			.try_iter()
			.filter(|batch| delivers(batch, &file))
			.count(),
		0,
		"file delivered more than once"
	);

	fs_events.stop(&thread).unwrap();
	join(runner).unwrap();
	assert!(!fs_events.is_running(&thread));

	fs_events.unschedule(&stream).unwrap();
}

#[test]
fn unscheduling_before_any_event_never_calls_back() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "round-trip-loop");
	let stream = StreamHandle::from("round-trip");

	let (callback, batches) = recorder();
	fs_events
		.schedule(&thread, &stream, callback, [as_str(&root)])
		.unwrap();
	fs_events.unschedule(&stream).unwrap();

	fs::write(root.join("unseen.txt"), b"nobody is watching").unwrap();
	thread::sleep(SETTLE);

	assert!(batches.try_recv().is_err());

	fs_events.stop(&thread).unwrap();
	join(runner).unwrap();
}

#[test]
fn failing_callback_stops_its_loop_with_the_error() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "failing-loop");
	let stream = StreamHandle::from("failing");

	let calls = Arc::new(AtomicUsize::new(0));
	fs_events
		.schedule(
			&thread,
			&stream,
			{
				let calls = Arc::clone(&calls);
				move |_: Vec<String>, _: Vec<u64>| -> Result<(), CallbackError> {
					calls.fetch_add(1, Ordering::SeqCst);
					Err(CallbackError::raised("refusing changes"))
				}
			},
			[as_str(&root)],
		)
		.unwrap();

	// Several changes inside one latency window, the first failure ends the run
	for name in ["first.txt", "second.txt", "third.txt", "fourth.txt"] {
		fs::write(root.join(name), name).unwrap();
	}

	assert!(matches!(
		join(runner),
		Err(Error::CallbackInvocation {
			stream: failed,
			source: CallbackError::Raised(_),
		}) if failed == stream
	));
	assert!(!fs_events.is_running(&thread));
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// The loop is gone, so later changes go nowhere
	fs::write(root.join("fifth.txt"), b"fifth").unwrap();
	thread::sleep(SETTLE);
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	// Failing doesn't unschedule the stream
	assert!(fs_events.is_scheduled(&stream));
	fs_events.unschedule(&stream).unwrap();
}

#[test]
fn panicking_callback_is_reported_as_unable_to_call() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "panicking-loop");
	let stream = StreamHandle::from("panicking");

	fs_events
		.schedule(
			&thread,
			&stream,
			|_: Vec<String>, _: Vec<u64>| -> Result<(), CallbackError> {
				panic!("callback blew up")
			},
			[as_str(&root)],
		)
		.unwrap();

	fs::write(root.join("boom.txt"), b"boom").unwrap();

	assert!(matches!(
		join(runner),
		Err(Error::CallbackInvocation {
			source: CallbackError::Unable,
			..
		})
	));

	fs_events.unschedule(&stream).unwrap();
}

#[test]
fn loops_on_different_threads_are_independent() {
	let fs_events = FsEvents::new();
	let (_dir_a, root_a) = watched_dir();
	let (_dir_b, root_b) = watched_dir();
	let (thread_a, runner_a) = spawn_loop(&fs_events, "independent-loop-a");
	let (thread_b, runner_b) = spawn_loop(&fs_events, "independent-loop-b");
	let (stream_a, stream_b) = (StreamHandle::from("a"), StreamHandle::from("b"));

	let (delivered_on_tx, delivered_on_rx) = chan::unbounded();
	let (batches_a_tx, batches_a) = chan::unbounded();
	fs_events
		.schedule(
			&thread_a,
			&stream_a,
			move |paths: Vec<String>, flags: Vec<u64>| -> Result<(), CallbackError> {
				delivered_on_tx
					.send(thread::current().name().map(ToOwned::to_owned))
					.map_err(CallbackError::raised)?;
				batches_a_tx
					.send((paths, flags))
					.map_err(CallbackError::raised)
			},
			[as_str(&root_a)],
		)
		.unwrap();

	let (callback_b, batches_b) = recorder();
	fs_events
		.schedule(&thread_b, &stream_b, callback_b, [as_str(&root_b)])
		.unwrap();

	let file_a = root_a.join("only-a.txt");
	fs::write(&file_a, b"a").unwrap();
	wait_for(&batches_a, &file_a);
	assert_eq!(
		delivered_on_rx.recv_timeout(TIMEOUT).unwrap().as_deref(),
		Some("independent-loop-a")
	);

	let file_b = root_b.join("only-b.txt");
	fs::write(&file_b, b"b").unwrap();
	wait_for(&batches_b, &file_b);

	thread::sleep(SETTLE);
	assert!(batches_a
		.try_iter()
		.all(|(paths, _)| paths.iter().all(|path| Path::new(path).starts_with(&root_a))));
	assert!(batches_b
		.try_iter()
		.all(|(paths, _)| paths.iter().all(|path| Path::new(path).starts_with(&root_b))));

	// Stopping one loop leaves the other running
	fs_events.stop(&thread_a).unwrap();
	join(runner_a).unwrap();
	assert!(fs_events.is_running(&thread_b));

	fs_events.stop(&thread_b).unwrap();
	join(runner_b).unwrap();

	fs_events.unschedule(&stream_a).unwrap();
	fs_events.unschedule(&stream_b).unwrap();
}

#[test]
fn callbacks_can_unschedule_their_own_stream() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "reentrant-loop");
	let stream = StreamHandle::from("reentrant");

	let (unscheduled_tx, unscheduled_rx) = chan::unbounded();
	fs_events
		.schedule(
			&thread,
			&stream,
			{
				let fs_events = fs_events.clone();
				let stream = stream.clone();
				move |_: Vec<String>, _: Vec<u64>| -> Result<(), CallbackError> {
					let unscheduled = fs_events.unschedule(&stream).is_ok();
					unscheduled_tx
						.send(unscheduled)
						.map_err(CallbackError::raised)
				}
			},
			[as_str(&root)],
		)
		.unwrap();

	fs::write(root.join("trigger.txt"), b"trigger").unwrap();

	assert!(unscheduled_rx.recv_timeout(TIMEOUT).unwrap());
	assert!(!fs_events.is_scheduled(&stream));

	fs_events.stop(&thread).unwrap();
	join(runner).unwrap();
}

#[test]
fn global_registries_back_the_free_functions() {
	let (_dir, root) = watched_dir();
	let thread = ThreadHandle::current();
	let stream = StreamHandle::from("global-free-functions");

	let (callback, _batches) = recorder();
	sd_fsevents::schedule(&thread, &stream, callback, [as_str(&root)]).unwrap();
	assert!(sd_fsevents::global().is_scheduled(&stream));

	sd_fsevents::stop(&thread).unwrap();
	sd_fsevents::unschedule(&stream).unwrap();
	assert!(matches!(
		sd_fsevents::unschedule(&stream),
		Err(Error::NotScheduled(_))
	));
}

#[test]
fn changes_beyond_the_queue_of_an_idle_loop_are_dropped_and_flagged() {
	const BACKLOG: usize = 2000;

	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let thread = ThreadHandle::from("restarted-loop");
	let stream = StreamHandle::from("restarted");

	let (first_run_tx, first_run_rx) = chan::bounded(1);
	let (restart_tx, restart_rx) = chan::bounded::<()>(1);
	let runner = thread::Builder::new()
		.name("restarted-loop".to_string())
		.spawn({
			let fs_events = fs_events.clone();
			let thread = thread.clone();
			move || {
				first_run_tx.send(fs_events.run_loop(&thread)).unwrap();
				restart_rx.recv().unwrap();
				fs_events.run_loop(&thread)
			}
		})
		.unwrap();
	wait_until_running(&fs_events, &thread);

	let refused = Arc::new(AtomicBool::new(false));
	let (batches_tx, batches) = chan::unbounded();
	fs_events
		.schedule(
			&thread,
			&stream,
			{
				let refused = Arc::clone(&refused);
				move |paths: Vec<String>, flags: Vec<u64>| -> Result<(), CallbackError> {
					if !refused.swap(true, Ordering::SeqCst) {
						return Err(CallbackError::raised("first batch refused"));
					}
					batches_tx
						.send((paths, flags))
						.map_err(CallbackError::raised)
				}
			},
			[as_str(&root)],
		)
		.unwrap();

	fs::write(root.join("refused.txt"), b"refused").unwrap();
	assert!(matches!(
		first_run_rx.recv_timeout(TIMEOUT).unwrap(),
		Err(Error::CallbackInvocation { .. })
	));

	for i in 0..BACKLOG {
		fs::write(root.join(format!("backlog-{i}.txt")), b"backlog").unwrap();
	}
	// Nothing drains the queue while the engine reports all of it
	thread::sleep(Duration::from_millis(500));

	restart_tx.send(()).unwrap();
	wait_until_running(&fs_events, &thread);

	let after = root.join("after.txt");
	fs::write(&after, b"after").unwrap();

	let mut replayed = HashSet::new();
	let mut rescan_requested = false;
	loop {
		let batch = batches.recv_timeout(TIMEOUT).unwrap();

		for (path, flags) in batch.0.iter().zip(&batch.1) {
			if Path::new(path) == root && flags & flag(EventFlags::USER_DROPPED) != 0 {
				assert_ne!(flags & flag(EventFlags::MUST_SCAN_SUB_DIRS), 0);
				rescan_requested = true;
			}
			if path.contains("backlog-") {
				replayed.insert(path.clone());
			}
		}

		if delivers(&batch, &after) {
			break;
		}
	}

	assert!(rescan_requested, "dropped changes weren't reported");
	assert!(
		replayed.len() < BACKLOG,
		"{} stale changes replayed",
		replayed.len()
	);

	fs_events.stop(&thread).unwrap();
	join(runner).unwrap();
	fs_events.unschedule(&stream).unwrap();
}

#[test]
fn run_loop_is_refused_inside_a_callback() {
	let fs_events = FsEvents::new();
	let (_dir, root) = watched_dir();
	let (thread, runner) = spawn_loop(&fs_events, "outer-loop");
	let stream = StreamHandle::from("nested");
	let inner = ThreadHandle::from("inner-loop");

	let (nested_tx, nested_rx) = chan::unbounded();
	fs_events
		.schedule(
			&thread,
			&stream,
			{
				let fs_events = fs_events.clone();
				let inner = inner.clone();
				move |_: Vec<String>, _: Vec<u64>| -> Result<(), CallbackError> {
					let nested = fs_events.run_loop(&inner);
					nested_tx
						.send(matches!(nested, Err(Error::NestedRunLoop(refused)) if refused == inner))
						.map_err(CallbackError::raised)
				}
			},
			[as_str(&root)],
		)
		.unwrap();

	fs::write(root.join("nested.txt"), b"nested").unwrap();

	assert!(nested_rx.recv_timeout(TIMEOUT).unwrap());
	assert!(fs_events.is_running(&thread));
	assert!(!fs_events.is_running(&inner));

	fs_events.unschedule(&stream).unwrap();
	fs_events.stop(&thread).unwrap();
	join(runner).unwrap();
}
