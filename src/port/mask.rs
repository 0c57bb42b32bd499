//! Event masks for port associations.
//!
//! An event port multiplexes two sources with distinct event vocabularies.
//! File objects (`PORT_SOURCE_FILE`) report `FILE_*` events and descriptors
//! (`PORT_SOURCE_FD`) report `poll(2)` events. Both travel through the
//! same `int` field, so [`EventMask`] carries raw bits and the source kind
//! decides how they read.
//!
//! # Platform Mapping
//!
//! | Flag | illumos | Source |
//! |------|---------|--------|
//! | FILE_ACCESS | `FILE_ACCESS` | file |
//! | FILE_MODIFIED | `FILE_MODIFIED` | file |
//! | FILE_ATTRIB | `FILE_ATTRIB` | file |
//! | FILE_TRUNC | `FILE_TRUNC` | file |
//! | FILE_DELETE | `FILE_DELETE` | file (exception) |
//! | FILE_RENAME_TO | `FILE_RENAME_TO` | file (exception) |
//! | FILE_RENAME_FROM | `FILE_RENAME_FROM` | file (exception) |
//! | UNMOUNTED | `UNMOUNTED` | file (exception) |
//! | MOUNTEDOVER | `MOUNTEDOVER` | file (exception) |
//! | POLLIN | `POLLIN` | fd |
//! | POLLOUT | `POLLOUT` | fd |
//! | POLLERR/POLLHUP/POLLNVAL | same | fd (always reported) |
//!
//! # Example
//!
//! ```
//! use eventport::EventMask;
//!
//! let mask = EventMask::FILE_MODIFIED | EventMask::FILE_ATTRIB;
//! assert!(mask.contains(EventMask::FILE_MODIFIED));
//! assert!(!mask.is_file_exception());
//! ```

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign};

/// Set of event bits requested at association or reported on delivery.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EventMask(u32);

impl EventMask {
    /// No events.
    pub const NONE: Self = Self(0);

    /// File was read.
    pub const FILE_ACCESS: Self = Self(0x0000_0001);
    /// File contents changed.
    pub const FILE_MODIFIED: Self = Self(0x0000_0002);
    /// File attributes changed.
    pub const FILE_ATTRIB: Self = Self(0x0000_0004);
    /// File was deleted.
    pub const FILE_DELETE: Self = Self(0x0000_0010);
    /// File was the target of a rename.
    pub const FILE_RENAME_TO: Self = Self(0x0000_0020);
    /// File was renamed away.
    pub const FILE_RENAME_FROM: Self = Self(0x0000_0040);
    /// File was truncated.
    pub const FILE_TRUNC: Self = Self(0x0010_0000);
    /// Do not follow a trailing symlink when associating.
    pub const FILE_NOFOLLOW: Self = Self(0x1000_0000);
    /// The containing filesystem was unmounted.
    pub const UNMOUNTED: Self = Self(0x2000_0000);
    /// Something was mounted over the file.
    pub const MOUNTEDOVER: Self = Self(0x4000_0000);
    /// Events delivered for a file regardless of the requested mask.
    pub const FILE_EXCEPTION: Self = Self(
        Self::UNMOUNTED.0
            | Self::FILE_DELETE.0
            | Self::FILE_RENAME_TO.0
            | Self::FILE_RENAME_FROM.0
            | Self::MOUNTEDOVER.0,
    );

    /// Data may be read without blocking.
    pub const POLLIN: Self = Self(0x0001);
    /// High priority data may be read.
    pub const POLLPRI: Self = Self(0x0002);
    /// Data may be written without blocking.
    pub const POLLOUT: Self = Self(0x0004);
    /// Error condition (always reported).
    pub const POLLERR: Self = Self(0x0008);
    /// Hang up (always reported).
    pub const POLLHUP: Self = Self(0x0010);
    /// Invalid descriptor (always reported).
    pub const POLLNVAL: Self = Self(0x0020);
    /// Normal data may be read.
    pub const POLLRDNORM: Self = Self(0x0040);
    /// Priority band data may be read.
    pub const POLLRDBAND: Self = Self(0x0080);
    /// Normal data may be written.
    pub const POLLWRNORM: Self = Self::POLLOUT;
    /// Priority band data may be written.
    pub const POLLWRBAND: Self = Self(0x0100);
    /// Descriptor events delivered regardless of the requested mask.
    pub const POLL_EXCEPTION: Self = Self(Self::POLLERR.0 | Self::POLLHUP.0 | Self::POLLNVAL.0);

    /// Create a mask from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Check if the mask contains all flags in other.
    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if the mask shares any flag with other.
    #[must_use]
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Check if the mask is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the union of two masks.
    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the mask without the flags in other.
    #[must_use]
    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True if a file event reports the object is gone (delete, rename, unmount).
    #[must_use]
    pub const fn is_file_exception(&self) -> bool {
        self.intersects(Self::FILE_EXCEPTION)
    }

    /// True if a descriptor event reports an error, hangup or invalid fd.
    #[must_use]
    pub const fn is_poll_exception(&self) -> bool {
        self.intersects(Self::POLL_EXCEPTION)
    }
}

impl std::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventMask({:#x})", self.0)
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl BitAndAssign for EventMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}
