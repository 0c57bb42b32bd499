//! The kernel primitives an [`EventPort`](super::EventPort) is built on.
//!
//! A backend owns one kernel port for its lifetime: creating the backend
//! creates the port, dropping it closes the port. The primitives are
//! deliberately thin. They know nothing about tokens; the only user data
//! they carry is the [`CookieId`] the port hands them.
//!
//! # Timeouts
//!
//! `None` blocks indefinitely, `Some(Duration::ZERO)` polls. A retrieval
//! that times out with nothing to return fails with `ETIME`, matching the
//! illumos convention; [`is_timeout`] recognises it.

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cookie::CookieId;
use super::mask::EventMask;

/// Identity of a watched object.
///
/// Paths and descriptors are separate identity domains: a path and a
/// descriptor never name the same watch even if they refer to the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchedObject {
    /// A filesystem path (`PORT_SOURCE_FILE`).
    Path(PathBuf),
    /// A file descriptor (`PORT_SOURCE_FD`).
    Fd(RawFd),
}

impl WatchedObject {
    /// Returns the source class of this object.
    #[must_use]
    pub const fn source(&self) -> SourceKind {
        match self {
            Self::Path(_) => SourceKind::File,
            Self::Fd(_) => SourceKind::Fd,
        }
    }

    /// Returns the path, for path objects.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Fd(_) => None,
        }
    }

    /// Returns the descriptor, for fd objects.
    #[must_use]
    pub const fn as_fd(&self) -> Option<RawFd> {
        match self {
            Self::Fd(fd) => Some(*fd),
            Self::Path(_) => None,
        }
    }
}

impl fmt::Display for WatchedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "path {}", path.display()),
            Self::Fd(fd) => write!(f, "fd {fd}"),
        }
    }
}

/// Source class tag reported with every kernel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// `PORT_SOURCE_FILE`
    File,
    /// `PORT_SOURCE_FD`
    Fd,
    /// `PORT_SOURCE_USER`, used only to interrupt a blocked retrieval.
    User,
}

/// A `timespec`-shaped timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Timespec {
    /// Whole seconds since the epoch.
    pub sec: i64,
    /// Nanoseconds within the second.
    pub nsec: i64,
}

/// File timestamps the kernel compares against when watching a path.
///
/// A file-change event fires if the file's times differ from these at
/// association, so passing the times observed when the caller last looked
/// at the file closes the window between looking and watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileStamp {
    /// Last access time.
    pub atime: Timespec,
    /// Last modification time.
    pub mtime: Timespec,
    /// Last status change time.
    pub ctime: Timespec,
}

impl FileStamp {
    /// Builds a stamp from file metadata.
    #[must_use]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            atime: Timespec {
                sec: meta.atime(),
                nsec: meta.atime_nsec(),
            },
            mtime: Timespec {
                sec: meta.mtime(),
                nsec: meta.mtime_nsec(),
            },
            ctime: Timespec {
                sec: meta.ctime(),
                nsec: meta.ctime_nsec(),
            },
        }
    }

    /// Stats `path` and builds a stamp from the result.
    ///
    /// # Errors
    ///
    /// Returns the error from `stat(2)`.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        std::fs::metadata(path).map(|meta| Self::from_metadata(&meta))
    }
}

/// An event as returned by the kernel, before cookie resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    /// A watched object fired. The kernel has already dropped its association.
    Object {
        /// The object identity reported by the kernel.
        object: WatchedObject,
        /// The events that fired.
        events: EventMask,
        /// The cookie id supplied at association.
        cookie: CookieId,
    },
    /// A wake-up posted by [`Kernel::wake`].
    Wake,
}

impl RawEvent {
    /// Returns the source class of the event.
    #[must_use]
    pub const fn source(&self) -> SourceKind {
        match self {
            Self::Object { object, .. } => object.source(),
            Self::Wake => SourceKind::User,
        }
    }
}

/// The consumed kernel primitives.
///
/// Implementations must be safe to call from several threads at once; the
/// port holds its own state lock around associate and dissociate but never
/// around retrieval.
pub trait Kernel: Send + Sync + Sized {
    /// Creates a new kernel port (`port_create`).
    ///
    /// # Errors
    ///
    /// Returns the OS error, e.g. when out of descriptors.
    fn create() -> io::Result<Self>;

    /// Associates an object with the port (`port_associate`).
    ///
    /// `stamp` applies to path objects only; backends that need one stat the
    /// path when it is `None`.
    ///
    /// # Errors
    ///
    /// Returns the OS error, e.g. `ENOENT` for a missing path or `EBADF`
    /// for a closed descriptor.
    fn associate(
        &self,
        object: &WatchedObject,
        stamp: Option<&FileStamp>,
        events: EventMask,
        cookie: CookieId,
    ) -> io::Result<()>;

    /// Dissociates an object (`port_dissociate`).
    ///
    /// # Errors
    ///
    /// Returns `ENOENT` if the object is not associated, which includes the
    /// case where it already fired.
    fn dissociate(&self, object: &WatchedObject) -> io::Result<()>;

    /// Blocks for the next event (`port_get`).
    ///
    /// # Errors
    ///
    /// Returns `ETIME` on timeout.
    fn get_event(&self, timeout: Option<Duration>) -> io::Result<RawEvent>;

    /// Retrieves between `min` and `max` events (`port_getn`), appending to
    /// `events`.
    ///
    /// If the timeout expires after at least one event arrived, the events
    /// that did arrive are returned successfully.
    ///
    /// # Errors
    ///
    /// Returns `ETIME` if the timeout expired with no events.
    fn get_events(
        &self,
        events: &mut Vec<RawEvent>,
        max: usize,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()>;

    /// Number of events queued and not yet retrieved.
    ///
    /// # Errors
    ///
    /// Returns the OS error from the query.
    fn pending(&self) -> io::Result<usize>;

    /// Posts a [`RawEvent::Wake`] to interrupt a blocked retrieval.
    ///
    /// # Errors
    ///
    /// Returns the OS error, e.g. when the port queue is full.
    fn wake(&self) -> io::Result<()>;
}

/// Returns true if the error is a retrieval timeout.
#[must_use]
pub fn is_timeout(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETIME) || err.kind() == io::ErrorKind::TimedOut
}

/// Returns true if the error reports a missing association.
#[must_use]
pub fn is_not_found(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOENT)
}
