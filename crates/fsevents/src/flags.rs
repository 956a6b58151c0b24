//! Flag vocabulary of event streams.
//!
//! Bit values follow the FSEvents constants so callers used to that API can match on the
//! raw `u64` flags handed to their callbacks.

use bitflags::bitflags;
use notify::{
	event::{CreateKind, MetadataKind, ModifyKind, RemoveKind},
	EventKind,
};

/// Read-ready condition of the file descriptor callback vocabulary, passed through as is.
pub const POLLIN: i64 = 1;
/// Write-ready condition of the file descriptor callback vocabulary, passed through as is.
pub const POLLOUT: i64 = 2;

/// Identifier of a point in the event history.
pub type EventId = u64;

/// Start a stream with the changes happening from now on, ignoring history.
pub const EVENT_ID_SINCE_NOW: EventId = u64::MAX;

bitflags! {
	/// Per path flags of a delivered change.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct EventFlags: u32 {
		const MUST_SCAN_SUB_DIRS = 0x0000_0001;
		const USER_DROPPED = 0x0000_0002;
		const KERNEL_DROPPED = 0x0000_0004;
		const EVENT_IDS_WRAPPED = 0x0000_0008;
		const HISTORY_DONE = 0x0000_0010;
		const ROOT_CHANGED = 0x0000_0020;
		const MOUNT = 0x0000_0040;
		const UNMOUNT = 0x0000_0080;
		const ITEM_CREATED = 0x0000_0100;
		const ITEM_REMOVED = 0x0000_0200;
		const ITEM_INODE_META_MOD = 0x0000_0400;
		const ITEM_RENAMED = 0x0000_0800;
		const ITEM_MODIFIED = 0x0000_1000;
		const ITEM_FINDER_INFO_MOD = 0x0000_2000;
		const ITEM_CHANGE_OWNER = 0x0000_4000;
		const ITEM_XATTR_MOD = 0x0000_8000;
		const ITEM_IS_FILE = 0x0001_0000;
		const ITEM_IS_DIR = 0x0002_0000;
		const ITEM_IS_SYMLINK = 0x0004_0000;
	}
}

bitflags! {
	/// Creation flags of an event stream.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
	pub struct CreateFlags: u32 {
		/// Deliver the first change after an idle period right away instead of waiting for
		/// the latency to elapse.
		const NO_DEFER = 0x0000_0002;
		/// Report removal or renaming of a watched root with [`EventFlags::ROOT_CHANGED`].
		const WATCH_ROOT = 0x0000_0004;
	}
}

impl EventFlags {
	/// Flags describing a change of this kind, `None` for kinds streams don't report.
	#[must_use]
	pub fn from_kind(kind: &EventKind) -> Option<Self> {
		let flags = match kind {
			// Streams report changes, not reads
			EventKind::Access(_) => return None,

			EventKind::Create(CreateKind::File) => Self::ITEM_CREATED | Self::ITEM_IS_FILE,
			EventKind::Create(CreateKind::Folder) => Self::ITEM_CREATED | Self::ITEM_IS_DIR,
			EventKind::Create(_) => Self::ITEM_CREATED,

			EventKind::Remove(RemoveKind::File) => Self::ITEM_REMOVED | Self::ITEM_IS_FILE,
			EventKind::Remove(RemoveKind::Folder) => Self::ITEM_REMOVED | Self::ITEM_IS_DIR,
			EventKind::Remove(_) => Self::ITEM_REMOVED,

			EventKind::Modify(ModifyKind::Name(_)) => Self::ITEM_RENAMED,
			EventKind::Modify(ModifyKind::Metadata(MetadataKind::Ownership)) => {
				Self::ITEM_CHANGE_OWNER
			}
			EventKind::Modify(ModifyKind::Metadata(MetadataKind::Extended)) => Self::ITEM_XATTR_MOD,
			EventKind::Modify(ModifyKind::Metadata(_)) => Self::ITEM_INODE_META_MOD,
			EventKind::Modify(_) => Self::ITEM_MODIFIED,

			EventKind::Any | EventKind::Other => Self::empty(),
		};

		Some(flags)
	}
}
