//! Deterministic lab kernel.
//!
//! [`LabKernel`] is an in-process event port with the same fire-once
//! semantics as the real thing: firing an associated object drops its
//! association and queues one event carrying the cookie id it was
//! associated with. Tests drive it directly to reproduce the races the port
//! has to reconcile (an event queued but not yet drained while the caller
//! dissociates or re-associates).
//!
//! Handles are cheap clones sharing one port, so a test can keep a handle
//! after moving another into an [`EventPort`](super::EventPort).

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::cookie::CookieId;
use super::kernel::{FileStamp, Kernel, RawEvent, WatchedObject};
use super::mask::EventMask;

/// In-process event port.
#[derive(Debug, Clone, Default)]
pub struct LabKernel {
    inner: Arc<LabInner>,
}

#[derive(Debug, Default)]
struct LabInner {
    state: Mutex<LabState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct LabState {
    associations: HashMap<WatchedObject, LabAssociation>,
    queue: VecDeque<RawEvent>,
    missing_paths: HashSet<PathBuf>,
    closed_fds: HashSet<RawFd>,
    wake_failure: Option<i32>,
    fired: u64,
}

#[derive(Debug, Clone, Copy)]
struct LabAssociation {
    events: EventMask,
    cookie: CookieId,
    stamp: Option<FileStamp>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl LabKernel {
    /// Creates an empty lab port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires `events` on `object`.
    ///
    /// The event is queued only if the object is associated and `events`
    /// intersects its mask or the always-reported exception bits. Firing
    /// drops the association. Returns true if an event was queued.
    pub fn fire(&self, object: &WatchedObject, events: EventMask) -> bool {
        let mut state = self.inner.state.lock();
        let fired = state.fire(object, events);
        if fired {
            self.inner.ready.notify_all();
        }
        fired
    }

    /// Fires `events` on a watched path.
    pub fn fire_path(&self, path: impl AsRef<Path>, events: EventMask) -> bool {
        self.fire(&WatchedObject::Path(path.as_ref().to_path_buf()), events)
    }

    /// Fires `events` on a watched descriptor.
    pub fn fire_fd(&self, fd: RawFd, events: EventMask) -> bool {
        self.fire(&WatchedObject::Fd(fd), events)
    }

    /// Simulates deleting `path`: further associations fail with `ENOENT`
    /// and a live association fires `FILE_DELETE`.
    pub fn remove_path(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref().to_path_buf();
        let mut state = self.inner.state.lock();
        state.missing_paths.insert(path.clone());
        let fired = state.fire(&WatchedObject::Path(path), EventMask::FILE_DELETE);
        if fired {
            self.inner.ready.notify_all();
        }
        fired
    }

    /// Simulates (re)creating `path`.
    pub fn create_path(&self, path: impl AsRef<Path>) {
        self.inner
            .state
            .lock()
            .missing_paths
            .remove(path.as_ref());
    }

    /// Simulates closing `fd`: its association is dropped silently and
    /// further associations fail with `EBADF`.
    pub fn close_fd(&self, fd: RawFd) {
        let mut state = self.inner.state.lock();
        state.closed_fds.insert(fd);
        state.associations.remove(&WatchedObject::Fd(fd));
    }

    /// Simulates reopening `fd`.
    pub fn open_fd(&self, fd: RawFd) {
        self.inner.state.lock().closed_fds.remove(&fd);
    }

    /// Makes the next `wake` fail with `code`, as a full queue would.
    pub fn fail_next_wake(&self, code: i32) {
        self.inner.state.lock().wake_failure = Some(code);
    }

    /// Returns true if the kernel is watching `object`.
    #[must_use]
    pub fn is_associated(&self, object: &WatchedObject) -> bool {
        self.inner.state.lock().associations.contains_key(object)
    }

    /// Returns the mask `object` was associated with.
    #[must_use]
    pub fn association_mask(&self, object: &WatchedObject) -> Option<EventMask> {
        self.inner
            .state
            .lock()
            .associations
            .get(object)
            .map(|assoc| assoc.events)
    }

    /// Returns the stamp a path was associated with.
    #[must_use]
    pub fn association_stamp(&self, object: &WatchedObject) -> Option<FileStamp> {
        self.inner
            .state
            .lock()
            .associations
            .get(object)
            .and_then(|assoc| assoc.stamp)
    }

    /// Number of live kernel associations.
    #[must_use]
    pub fn association_count(&self) -> usize {
        self.inner.state.lock().associations.len()
    }

    /// Total number of events fired since creation.
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.inner.state.lock().fired
    }
}

impl LabState {
    fn fire(&mut self, object: &WatchedObject, events: EventMask) -> bool {
        let Some(assoc) = self.associations.get(object).copied() else {
            return false;
        };
        let exceptions = match object {
            WatchedObject::Path(_) => EventMask::FILE_EXCEPTION,
            WatchedObject::Fd(_) => EventMask::POLL_EXCEPTION,
        };
        let delivered = events & (assoc.events | exceptions);
        if delivered.is_empty() {
            return false;
        }
        self.associations.remove(object);
        self.fired += 1;
        trace!(%object, cookie = %assoc.cookie, ?delivered, "lab kernel fired");
        self.queue.push_back(RawEvent::Object {
            object: object.clone(),
            events: delivered,
            cookie: assoc.cookie,
        });
        true
    }

    fn take(&mut self, events: &mut Vec<RawEvent>, max: usize) {
        let count = max.min(self.queue.len());
        events.extend(self.queue.drain(..count));
    }
}

impl Kernel for LabKernel {
    fn create() -> io::Result<Self> {
        Ok(Self::new())
    }

    fn associate(
        &self,
        object: &WatchedObject,
        stamp: Option<&FileStamp>,
        events: EventMask,
        cookie: CookieId,
    ) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        match object {
            WatchedObject::Path(path) if state.missing_paths.contains(path) => {
                return Err(errno(libc::ENOENT));
            }
            WatchedObject::Fd(fd) if *fd < 0 || state.closed_fds.contains(fd) => {
                return Err(errno(libc::EBADF));
            }
            _ => {}
        }
        // Re-associating a live object replaces its mask and cookie.
        state.associations.insert(
            object.clone(),
            LabAssociation {
                events,
                cookie,
                stamp: stamp.copied(),
            },
        );
        Ok(())
    }

    fn dissociate(&self, object: &WatchedObject) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        if let WatchedObject::Fd(fd) = object {
            if *fd < 0 || state.closed_fds.contains(fd) {
                return Err(errno(libc::EBADF));
            }
        }
        state
            .associations
            .remove(object)
            .map(|_| ())
            .ok_or_else(|| errno(libc::ENOENT))
    }

    fn get_event(&self, timeout: Option<Duration>) -> io::Result<RawEvent> {
        let mut events = Vec::with_capacity(1);
        self.get_events(&mut events, 1, 1, timeout)?;
        events.pop().ok_or_else(|| errno(libc::ETIME))
    }

    fn get_events(
        &self,
        events: &mut Vec<RawEvent>,
        max: usize,
        min: usize,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        if max == 0 {
            return Err(errno(libc::EINVAL));
        }
        let min = min.min(max);
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.inner.state.lock();

        while state.queue.len() < min {
            match (timeout, deadline) {
                (None, _) | (Some(_), None) => self.inner.ready.wait(&mut state),
                (Some(_), Some(deadline)) => {
                    if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        if state.queue.is_empty() && min > 0 {
            return Err(errno(libc::ETIME));
        }
        state.take(events, max);
        Ok(())
    }

    fn pending(&self) -> io::Result<usize> {
        Ok(self.inner.state.lock().queue.len())
    }

    fn wake(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        if let Some(code) = state.wake_failure.take() {
            return Err(errno(code));
        }
        state.queue.push_back(RawEvent::Wake);
        self.inner.ready.notify_all();
        Ok(())
    }
}
