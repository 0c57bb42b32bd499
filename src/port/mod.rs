//! Event port: a safe, stateful wrapper over a kernel event port.
//!
//! An event port aggregates notifications from paths and descriptors into one
//! queue. The kernel primitives are fire-once: an association is silently
//! removed the moment its event fires. [`EventPort`] keeps a watch registry
//! and a cookie jar consistent across that race so callers can associate,
//! dissociate and retrieve without leaking tokens or resolving an event to the
//! wrong one.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          EventPort                             │
//! │  ┌──────────────┐   ┌─────────────────────────────────────┐   │
//! │  │    Kernel    │   │        Mutex<PortState>             │   │
//! │  │ (port handle)│   │  WatchRegistry     CookieJar<T>     │   │
//! │  │              │   │  path → id         id → token       │   │
//! │  │              │   │  fd   → id         active/pending   │   │
//! │  └──────────────┘   └─────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Thread Safety
//!
//! `EventPort` is `Send + Sync` when its token type is `Send`. Association,
//! dissociation and the bookkeeping half of retrieval are serialized by one
//! state lock. The blocking kernel wait runs without the lock, so one thread
//! can sit in [`EventPort::get_one`] while others associate.
//!
//! # Example
//!
//! ```
//! use eventport::{EventMask, EventPort, LabKernel};
//! use std::time::Duration;
//!
//! let port: EventPort<LabKernel, &str> = EventPort::open()?;
//! port.associate_fd(4, EventMask::POLLIN, "stdin-ish")?;
//!
//! port.kernel().fire_fd(4, EventMask::POLLIN);
//! let event = port.get_one(Some(Duration::ZERO))?;
//! assert_eq!(event.token, "stdin-ish");
//! assert_eq!(event.fd(), Some(4));
//! # Ok::<(), eventport::Error>(())
//! ```

pub mod cookie;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub mod illumos;
pub mod kernel;
pub mod lab;
pub mod mask;
pub mod registry;
mod state;

pub use cookie::{CookieId, CookieJar, CookieState, PendingCause};
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub use illumos::SystemKernel;
pub use kernel::{FileStamp, Kernel, RawEvent, SourceKind, Timespec, WatchedObject};
pub use lab::LabKernel;
pub use mask::EventMask;
pub use registry::WatchRegistry;
pub use state::PortSnapshot;

use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PortConfig;
use crate::error::{Error, KernelOp, Result};
use kernel::is_timeout;
use state::PortState;

/// An event port backed by the host kernel.
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
pub type SystemPort<T> = EventPort<SystemKernel, T>;

/// A retrieved event, resolved to the token it was associated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent<T> {
    /// The object that fired.
    pub object: WatchedObject,
    /// The events that fired.
    pub events: EventMask,
    /// The token supplied at association.
    pub token: T,
    /// The timestamps supplied at association, for path objects.
    pub stamp: Option<FileStamp>,
}

impl<T> PortEvent<T> {
    /// Returns the source class of the event.
    #[must_use]
    pub const fn source(&self) -> SourceKind {
        self.object.source()
    }

    /// Returns the path, for path events.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.object.as_path()
    }

    /// Returns the descriptor, for fd events.
    #[must_use]
    pub const fn fd(&self) -> Option<RawFd> {
        self.object.as_fd()
    }
}

/// Safe wrapper around a kernel event port.
///
/// `T` is the caller's token type. Tokens are moved into the port on
/// association and handed back, once, with the resolved event.
///
/// The kernel port is released when the `EventPort` is dropped. [`close`]
/// may be called earlier, from any thread, to discard all bookkeeping and
/// interrupt a blocked retrieval; the handle itself stays allocated until
/// the drop so a concurrent waiter never sees a recycled descriptor.
///
/// [`close`]: EventPort::close
#[derive(Debug)]
pub struct EventPort<K: Kernel, T> {
    kernel: K,
    state: Mutex<PortState<T>>,
    config: PortConfig,
}

impl<K: Kernel, T> EventPort<K, T> {
    /// Creates a new kernel port with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `KernelRejected` if the kernel cannot create a port.
    pub fn open() -> Result<Self> {
        Self::open_with_config(PortConfig::default())
    }

    /// Creates a new kernel port with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid configuration and
    /// `KernelRejected` if the kernel cannot create a port.
    pub fn open_with_config(config: PortConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let kernel = K::create().map_err(|err| Error::kernel(KernelOp::Create, err))?;
        Ok(Self::from_parts(kernel, config))
    }

    /// Wraps an existing kernel port.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an invalid configuration.
    pub fn with_kernel(kernel: K, config: PortConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        Ok(Self::from_parts(kernel, config))
    }

    fn from_parts(kernel: K, config: PortConfig) -> Self {
        info!(max_events = config.max_events, "event port opened");
        Self {
            kernel,
            state: Mutex::new(PortState::new()),
            config,
        }
    }

    /// Returns the kernel backend.
    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Closes the port.
    ///
    /// All outstanding registry and jar entries are discarded and every later
    /// operation fails with [`Error::Closed`]. Retrievals blocked in other
    /// threads are woken one after another: each waiter that observes the
    /// close passes the wake on before failing with [`Error::Closed`].
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// `KernelRejected` if the wake could not be posted. The port is closed
    /// regardless, but blocked retrievals may not have been interrupted.
    pub fn close(&self) -> Result<()> {
        let discarded = {
            let mut state = self.state.lock();
            if state.is_closed() {
                return Ok(());
            }
            state.close()
        };
        info!(discarded, "event port closed");
        self.kernel.wake().map_err(|err| {
            warn!(error = %err, "failed to wake blocked retrieval on close");
            Error::kernel(KernelOp::Wake, err)
        })
    }

    /// Returns true once [`close`](EventPort::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    /// Watches `path` for `events`, returning `token` with the event.
    ///
    /// # Errors
    ///
    /// - `AlreadyAssociated` if the path is already watched.
    /// - `KernelRejected` if the kernel refuses, e.g. the path does not exist.
    pub fn associate_path(&self, path: impl AsRef<Path>, events: EventMask, token: T) -> Result<()> {
        let object = WatchedObject::Path(path.as_ref().to_path_buf());
        self.state
            .lock()
            .associate(&self.kernel, object, None, events, token)
    }

    /// Watches `path`, comparing against timestamps the caller observed.
    ///
    /// # Errors
    ///
    /// Same as [`associate_path`](EventPort::associate_path).
    pub fn associate_path_with_stamp(
        &self,
        path: impl AsRef<Path>,
        stamp: FileStamp,
        events: EventMask,
        token: T,
    ) -> Result<()> {
        let object = WatchedObject::Path(path.as_ref().to_path_buf());
        self.state
            .lock()
            .associate(&self.kernel, object, Some(stamp), events, token)
    }

    /// Watches descriptor `fd` for poll `events`.
    ///
    /// # Errors
    ///
    /// - `AlreadyAssociated` if the descriptor is already watched.
    /// - `KernelRejected` if the kernel refuses, e.g. a closed descriptor.
    pub fn associate_fd(&self, fd: RawFd, events: EventMask, token: T) -> Result<()> {
        self.state
            .lock()
            .associate(&self.kernel, WatchedObject::Fd(fd), None, events, token)
    }

    /// Stops watching `path`.
    ///
    /// # Errors
    ///
    /// `NotAssociated` if the path is not watched, including when its event
    /// already fired and awaits retrieval. Callers should treat that as
    /// nothing to do.
    pub fn dissociate_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let object = WatchedObject::Path(path.as_ref().to_path_buf());
        self.state.lock().dissociate(&self.kernel, &object)
    }

    /// Stops watching descriptor `fd`.
    ///
    /// # Errors
    ///
    /// Same as [`dissociate_path`](EventPort::dissociate_path).
    pub fn dissociate_fd(&self, fd: RawFd) -> Result<()> {
        self.state
            .lock()
            .dissociate(&self.kernel, &WatchedObject::Fd(fd))
    }

    /// Returns true if `path` has a live association.
    ///
    /// An object whose event fired but was not yet detected by a dissociate
    /// or retrieval still reads as watched.
    #[must_use]
    pub fn is_watched_path(&self, path: impl AsRef<Path>) -> bool {
        let object = WatchedObject::Path(PathBuf::from(path.as_ref()));
        self.state.lock().is_watched(&object)
    }

    /// Returns true if `fd` has a live association.
    #[must_use]
    pub fn is_watched_fd(&self, fd: RawFd) -> bool {
        self.state.lock().is_watched(&WatchedObject::Fd(fd))
    }

    /// Retrieves one event, waiting at most `timeout`.
    ///
    /// `None` blocks until an event arrives or the port is closed;
    /// `Some(Duration::ZERO)` polls.
    ///
    /// # Errors
    ///
    /// - `TimedOut` if nothing arrived; no state changes.
    /// - `Closed` if the port is or becomes closed.
    /// - `InternalInconsistency` if the event's cookie is unknown.
    pub fn get_one(&self, timeout: Option<Duration>) -> Result<PortEvent<T>> {
        self.state.lock().ensure_open()?;
        let deadline = Deadline::new(timeout);
        loop {
            let raw = self
                .kernel
                .get_event(deadline.remaining())
                .map_err(|err| self.retrieval_error(err))?;
            match raw {
                RawEvent::Object {
                    object,
                    events,
                    cookie,
                } => return self.state.lock().resolve(&object, events, cookie),
                RawEvent::Wake => {
                    if self.state.lock().is_closed() {
                        return Err(self.relay_close());
                    }
                    debug!("spurious wake on open port");
                }
            }
        }
    }

    /// Retrieves one event using the configured default timeout.
    ///
    /// # Errors
    ///
    /// Same as [`get_one`](EventPort::get_one).
    pub fn get_next(&self) -> Result<PortEvent<T>> {
        self.get_one(self.config.default_timeout)
    }

    /// Retrieves up to `max` events, waiting until at least `min` arrived.
    ///
    /// If the timeout expires after at least one event arrived, the events
    /// that did arrive are returned.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` unless `0 < min <= max`.
    /// - `TimedOut` if nothing arrived.
    /// - `Closed` if the port is or becomes closed.
    /// - `InternalInconsistency` if any event's cookie is unknown; events
    ///   resolved before it in the batch are lost with the error.
    pub fn get_many(
        &self,
        max: usize,
        min: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<PortEvent<T>>> {
        if min == 0 || min > max {
            return Err(Error::InvalidArgument(format!(
                "get_many requires 0 < min <= max, got min {min} max {max}"
            )));
        }
        self.state.lock().ensure_open()?;

        let mut raw = Vec::with_capacity(max);
        self.kernel
            .get_events(&mut raw, max, min, timeout)
            .map_err(|err| self.retrieval_error(err))?;

        let mut state = self.state.lock();
        if state.is_closed() {
            drop(state);
            if raw.contains(&RawEvent::Wake) {
                return Err(self.relay_close());
            }
            return Err(Error::Closed);
        }
        let mut resolved = Vec::with_capacity(raw.len());
        for event in raw {
            match event {
                RawEvent::Object {
                    object,
                    events,
                    cookie,
                } => resolved.push(state.resolve(&object, events, cookie)?),
                RawEvent::Wake => debug!("spurious wake on open port"),
            }
        }
        if resolved.is_empty() {
            return Err(Error::TimedOut);
        }
        Ok(resolved)
    }

    /// Retrieves every queued event without blocking.
    ///
    /// When the queue is found empty and `reclaim_on_drain` is set, entries
    /// left pending by successful dissociations are reclaimed.
    ///
    /// # Errors
    ///
    /// - `Closed` if the port is or becomes closed.
    /// - `InternalInconsistency` if any event's cookie is unknown.
    pub fn drain(&self) -> Result<Vec<PortEvent<T>>> {
        let mut drained = Vec::new();
        loop {
            match self.get_many(self.config.max_events, 1, Some(Duration::ZERO)) {
                Ok(batch) => drained.extend(batch),
                Err(Error::TimedOut) => break,
                Err(err) => return Err(err),
            }
        }
        if self.config.reclaim_on_drain {
            self.flush()?;
        }
        debug!(count = drained.len(), "drained event port");
        Ok(drained)
    }

    /// Reclaims entries left pending by successful dissociations.
    ///
    /// Nothing is reclaimed while the kernel still has events queued, since
    /// one of them might belong to such an entry. Returns the number of
    /// entries dropped.
    ///
    /// # Errors
    ///
    /// - `Closed` if the port is closed.
    /// - `KernelRejected` if the queue length cannot be queried.
    pub fn flush(&self) -> Result<usize> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let queued = self
            .kernel
            .pending()
            .map_err(|err| Error::kernel(KernelOp::Get, err))?;
        if queued > 0 {
            debug!(queued, "events still queued, skipping reclaim");
            return Ok(0);
        }
        Ok(state.reclaim())
    }

    /// Number of events queued in the kernel and not yet retrieved.
    ///
    /// # Errors
    ///
    /// - `Closed` if the port is closed.
    /// - `KernelRejected` if the query fails.
    pub fn pending(&self) -> Result<usize> {
        self.state.lock().ensure_open()?;
        self.kernel
            .pending()
            .map_err(|err| Error::kernel(KernelOp::Get, err))
    }

    /// Returns diagnostic counts of the registry and jar.
    #[must_use]
    pub fn snapshot(&self) -> PortSnapshot {
        self.state.lock().snapshot()
    }

    /// Passes the close wake on to the next blocked retrieval.
    fn relay_close(&self) -> Error {
        match self.kernel.wake() {
            Ok(()) => Error::Closed,
            Err(err) => {
                warn!(error = %err, "failed to relay close wake");
                Error::kernel(KernelOp::Wake, err)
            }
        }
    }

    fn retrieval_error(&self, err: std::io::Error) -> Error {
        if self.state.lock().is_closed() {
            Error::Closed
        } else if is_timeout(&err) {
            Error::TimedOut
        } else {
            Error::kernel(KernelOp::Get, err)
        }
    }
}

impl<K: Kernel, T> Drop for EventPort<K, T> {
    fn drop(&mut self) {
        let outstanding = self.state.get_mut().snapshot().cookies;
        if outstanding > 0 {
            debug!(outstanding, "dropping event port with outstanding cookies");
        }
    }
}

/// Remaining-time tracker for retrieval loops.
#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>, Option<Duration>);

impl Deadline {
    fn new(timeout: Option<Duration>) -> Self {
        Self(timeout.and_then(|t| Instant::now().checked_add(t)), timeout)
    }

    fn remaining(self) -> Option<Duration> {
        match self {
            Self(Some(at), _) => Some(at.saturating_duration_since(Instant::now())),
            Self(None, timeout) => timeout,
        }
    }
}
