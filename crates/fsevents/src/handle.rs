use std::{fmt, sync::Arc, thread};

macro_rules! opaque_handle {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
		pub struct $name(Arc<str>);

		impl $name {
			pub fn new(key: impl Into<Arc<str>>) -> Self {
				Self(key.into())
			}

			#[must_use]
			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $name {
			fn from(key: &str) -> Self {
				Self::new(key)
			}
		}

		impl From<String> for $name {
			fn from(key: String) -> Self {
				Self::new(key)
			}
		}

		impl From<u64> for $name {
			fn from(key: u64) -> Self {
				Self::new(key.to_string())
			}
		}
	};
}

opaque_handle!(
	/// Caller chosen identity of a worker that runs a run loop.
	///
	/// Only used as a key in the loop registry, the crate never creates or destroys the worker
	/// it stands for.
	ThreadHandle
);

opaque_handle!(
	/// Caller chosen identity of a watch request.
	///
	/// Unique among the currently scheduled streams only, it can be reused once its stream
	/// was unscheduled.
	StreamHandle
);

impl ThreadHandle {
	/// A handle derived from the calling OS thread id.
	#[must_use]
	pub fn current() -> Self {
		Self::new(format!("{:?}", thread::current().id()))
	}
}
