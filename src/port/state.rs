//! Reconciliation of the watch registry and the cookie jar.
//!
//! The kernel drops an association the moment it fires and tells nobody
//! until the event is drained. [`PortState`] mirrors that transition lazily:
//!
//! ```text
//!   Unwatched ──associate──▶ Active ──dissociate ok──▶ Pending(Dissociated) ──flush──▶ gone
//!                              │
//!                              ├──dissociate ENOENT──▶ Pending(Fired) ──retrieve──▶ gone
//!                              │
//!                              └──retrieve (fired while still registered)─────────▶ gone
//! ```
//!
//! An object may hold one Active entry and any number of Pending entries at
//! the same time. Every transition keeps
//! `jar.len() == registry.len() + jar.pending()`.

use tracing::{debug, error};

use super::cookie::{CookieId, CookieJar, PendingCause};
use super::kernel::{is_not_found, FileStamp, Kernel, WatchedObject};
use super::mask::EventMask;
use super::PortEvent;
use crate::error::{Error, KernelOp, Result};

/// Diagnostic counts of a port's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortSnapshot {
    /// Watched descriptors.
    pub fds: usize,
    /// Watched paths.
    pub paths: usize,
    /// Entries in the cookie jar.
    pub cookies: usize,
    /// Active cookie entries.
    pub active: usize,
    /// Pending cookie entries.
    pub pending: usize,
}

impl PortSnapshot {
    /// Returns true if nothing is watched or awaiting retrieval.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cookies == 0 && self.fds == 0 && self.paths == 0
    }
}

/// Registry and jar, guarded together by the port's state lock.
#[derive(Debug)]
pub(crate) struct PortState<T> {
    registry: super::registry::WatchRegistry,
    jar: CookieJar<T>,
    closed: bool,
}

impl<T> PortState<T> {
    pub(crate) fn new() -> Self {
        Self {
            registry: super::registry::WatchRegistry::new(),
            jar: CookieJar::new(),
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_watched(&self, object: &WatchedObject) -> bool {
        !self.closed && self.registry.contains(object)
    }

    /// Associates `object`, creating no state if the kernel refuses.
    pub(crate) fn associate<K: Kernel>(
        &mut self,
        kernel: &K,
        object: WatchedObject,
        stamp: Option<FileStamp>,
        events: EventMask,
        token: T,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.registry.contains(&object) {
            return Err(Error::AlreadyAssociated { object });
        }

        let id = self.jar.insert(object.clone(), stamp, token);
        if let Err(err) = kernel.associate(&object, stamp.as_ref(), events, id) {
            self.jar.remove(id);
            debug!(%object, error = %err, "kernel rejected association");
            return Err(Error::kernel(KernelOp::Associate, err));
        }
        debug!(%object, cookie = %id, ?events, "associated");
        self.registry.insert(object, id);
        self.debug_check();
        Ok(())
    }

    /// Dissociates `object`.
    ///
    /// `NotAssociated` is returned both when the object was never registered
    /// and when the kernel reports it already fired; in the latter case the
    /// entry becomes pending until its event is drained.
    pub(crate) fn dissociate<K: Kernel>(&mut self, kernel: &K, object: &WatchedObject) -> Result<()> {
        self.ensure_open()?;
        let Some(id) = self.registry.get(object) else {
            return Err(Error::NotAssociated {
                object: object.clone(),
            });
        };

        let result = match kernel.dissociate(object) {
            Ok(()) => {
                self.registry.remove(object);
                self.jar.mark_pending(id, PendingCause::Dissociated);
                debug!(%object, cookie = %id, "dissociated");
                Ok(())
            }
            Err(err) if is_not_found(&err) => {
                self.registry.remove(object);
                self.jar.mark_pending(id, PendingCause::Fired);
                debug!(%object, cookie = %id, "already fired, awaiting retrieval");
                Err(Error::NotAssociated {
                    object: object.clone(),
                })
            }
            Err(err) => Err(Error::kernel(KernelOp::Dissociate, err)),
        };
        self.debug_check();
        result
    }

    /// Resolves a fired event against the jar and consumes its entry.
    ///
    /// Pending entries are searched before active ones so an event from a
    /// superseded association resolves to the token it was armed with.
    pub(crate) fn resolve(
        &mut self,
        reported: &WatchedObject,
        events: EventMask,
        id: CookieId,
    ) -> Result<PortEvent<T>> {
        self.ensure_open()?;
        let cookie = match self.jar.take_pending(id) {
            Some(cookie) => cookie,
            None => {
                let Some(cookie) = self.jar.take_active(id) else {
                    let (active, pending) = (self.jar.active(), self.jar.pending());
                    error!(
                        object = %reported,
                        cookie = %id,
                        active,
                        pending,
                        "retrieved event for unknown cookie"
                    );
                    return Err(Error::InternalInconsistency {
                        cookie: id,
                        active,
                        pending,
                    });
                };
                self.registry.remove_if(&cookie.object, id);
                cookie
            }
        };
        debug!(object = %cookie.object, cookie = %id, ?events, "resolved event");
        self.debug_check();
        Ok(PortEvent {
            object: cookie.object,
            events,
            token: cookie.token,
            stamp: cookie.stamp,
        })
    }

    /// Drops entries whose association was explicitly dissociated.
    pub(crate) fn reclaim(&mut self) -> usize {
        let reclaimed = self.jar.reclaim(PendingCause::Dissociated);
        if reclaimed > 0 {
            debug!(reclaimed, "reclaimed dissociated cookies");
        }
        reclaimed
    }

    /// Marks the port closed and discards all outstanding entries.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let discarded = self.jar.len();
        self.registry.clear();
        self.jar.clear();
        discarded
    }

    pub(crate) fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            fds: self.registry.fds(),
            paths: self.registry.paths(),
            cookies: self.jar.len(),
            active: self.jar.active(),
            pending: self.jar.pending(),
        }
    }

    fn debug_check(&self) {
        debug_assert_eq!(self.jar.active(), self.registry.len());
        debug_assert_eq!(self.jar.len(), self.registry.len() + self.jar.pending());
    }
}
