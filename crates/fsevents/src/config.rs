use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coalescing window used when no configuration says otherwise.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

/// Settings shared by every stream scheduled through one [`FsEvents`](crate::FsEvents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// How long the engine waits to batch nearby changes before delivering them.
	/// Serialized as milliseconds.
	#[serde(rename = "latency_ms", with = "millis")]
	pub latency: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			latency: DEFAULT_LATENCY,
		}
	}
}

impl Config {
	#[must_use]
	pub fn with_latency(mut self, latency: Duration) -> Self {
		self.latency = latency;
		self
	}
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	#[allow(clippy::trivially_copy_pass_by_ref)] // serde's `with` signature
	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}
