//! Cookie jar: process-owned storage for user tokens.
//!
//! The kernel echoes back an opaque pointer-sized value with every fired
//! event. Instead of handing it the address of caller memory, the port hands
//! it a [`CookieId`] and keeps the caller's token here until the event is
//! retrieved.
//!
//! # Design
//!
//! The jar is a slab with a free list for O(1) insert and removal. Each id
//! carries a generation counter so that an id freed and reissued for a new
//! association can never resolve a stale event that carries the old id.
//!
//! Every entry is either *active* (the kernel is watching its object) or
//! *pending* (the association ended but the event may still be drained).
//! The jar keeps both counts so `len() == active() + pending()` is checked
//! on every transition.

use std::fmt;

use super::kernel::FileStamp;
use super::WatchedObject;

/// Identifier handed to the kernel in place of the user token.
///
/// Ids encode:
/// - Index: which slot in the jar
/// - Generation: catches reuse of a freed slot (ABA prevention)
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct CookieId {
    index: u32,
    generation: u32,
}

impl CookieId {
    const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index.
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Returns the slot generation.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Packs the id into the kernel's user-data word.
    ///
    /// The generation is stored in the upper 32 bits and the index in the
    /// lower 32 bits.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks an id from the kernel's user-data word.
    #[must_use]
    pub const fn from_u64(val: u64) -> Self {
        Self {
            index: val as u32,
            generation: (val >> 32) as u32,
        }
    }
}

impl fmt::Display for CookieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Why an entry left the watch registry without being drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingCause {
    /// The kernel fired and dropped the association; its event is queued.
    Fired,
    /// The caller dissociated; an event may or may not still arrive.
    Dissociated,
}

/// Lifecycle state of a cookie entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CookieState {
    /// Recorded in the watch registry.
    Active,
    /// Out of the registry, awaiting retrieval or reclamation.
    Pending(PendingCause),
}

impl CookieState {
    /// Returns true for pending entries.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// A token held in the jar plus the bookkeeping needed to resolve it.
#[derive(Debug)]
pub struct Cookie<T> {
    /// The caller's token, returned verbatim on delivery.
    pub token: T,
    /// The object the token was associated with.
    pub object: WatchedObject,
    /// Timestamps supplied for path associations.
    pub stamp: Option<FileStamp>,
    /// Active or pending.
    pub state: CookieState,
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { cookie: Cookie<T>, generation: u32 },
    Vacant { next_free: u32, generation: u32 },
}

impl<T> Entry<T> {
    fn generation(&self) -> u32 {
        match self {
            Self::Occupied { generation, .. } | Self::Vacant { generation, .. } => *generation,
        }
    }
}

const FREE_LIST_END: u32 = u32::MAX;

/// Slab of cookie entries keyed by [`CookieId`].
///
/// `CookieJar` is not thread-safe; the port guards it with its state lock.
#[derive(Debug)]
pub struct CookieJar<T> {
    entries: Vec<Entry<T>>,
    free_head: u32,
    active: usize,
    pending: usize,
}

impl<T> CookieJar<T> {
    /// Creates an empty jar.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: FREE_LIST_END,
            active: 0,
            pending: 0,
        }
    }

    /// Stores a token for a new association and returns its id.
    ///
    /// The entry starts out active.
    pub fn insert(&mut self, object: WatchedObject, stamp: Option<FileStamp>, token: T) -> CookieId {
        let cookie = Cookie {
            token,
            object,
            stamp,
            state: CookieState::Active,
        };
        self.active += 1;

        if self.free_head == FREE_LIST_END {
            let index = u32::try_from(self.entries.len()).unwrap_or(FREE_LIST_END);
            assert!(index != FREE_LIST_END, "cookie jar exhausted");
            self.entries.push(Entry::Occupied {
                cookie,
                generation: 0,
            });
            return CookieId::new(index, 0);
        }

        let index = self.free_head;
        let slot = &mut self.entries[index as usize];
        let Entry::Vacant {
            next_free,
            generation,
        } = *slot
        else {
            panic!("free list pointed to occupied entry");
        };
        *slot = Entry::Occupied { cookie, generation };
        self.free_head = next_free;
        CookieId::new(index, generation)
    }

    /// Returns the entry for an id, or `None` if it is stale or unknown.
    #[must_use]
    pub fn get(&self, id: CookieId) -> Option<&Cookie<T>> {
        match self.entries.get(id.index as usize)? {
            Entry::Occupied { cookie, generation } if *generation == id.generation => Some(cookie),
            _ => None,
        }
    }

    /// Moves an active entry to the pending set.
    ///
    /// Returns false if the id is unknown or already pending.
    pub fn mark_pending(&mut self, id: CookieId, cause: PendingCause) -> bool {
        let Some(Entry::Occupied { cookie, generation }) = self.entries.get_mut(id.index as usize)
        else {
            return false;
        };
        if *generation != id.generation || cookie.state.is_pending() {
            return false;
        }
        cookie.state = CookieState::Pending(cause);
        self.active -= 1;
        self.pending += 1;
        true
    }

    /// Resolves a pending entry, removing it from the jar.
    pub fn take_pending(&mut self, id: CookieId) -> Option<Cookie<T>> {
        if self.get(id)?.state.is_pending() {
            self.remove(id)
        } else {
            None
        }
    }

    /// Resolves an active entry, removing it from the jar.
    pub fn take_active(&mut self, id: CookieId) -> Option<Cookie<T>> {
        if self.get(id)?.state == CookieState::Active {
            self.remove(id)
        } else {
            None
        }
    }

    /// Removes the entry for an id regardless of state.
    ///
    /// The slot goes back on the free list with its generation bumped so the
    /// old id can no longer resolve.
    pub fn remove(&mut self, id: CookieId) -> Option<Cookie<T>> {
        let index = id.index as usize;
        let entry = self.entries.get(index)?;
        if entry.generation() != id.generation || matches!(entry, Entry::Vacant { .. }) {
            return None;
        }

        let old = std::mem::replace(
            &mut self.entries[index],
            Entry::Vacant {
                next_free: self.free_head,
                generation: id.generation.wrapping_add(1),
            },
        );
        self.free_head = id.index;

        match old {
            Entry::Occupied { cookie, .. } => {
                if cookie.state.is_pending() {
                    self.pending -= 1;
                } else {
                    self.active -= 1;
                }
                Some(cookie)
            }
            Entry::Vacant { .. } => None,
        }
    }

    /// Drops every pending entry whose cause matches, returning how many.
    pub fn reclaim(&mut self, cause: PendingCause) -> usize {
        let stale: Vec<CookieId> = self
            .iter()
            .filter(|(_, cookie)| cookie.state == CookieState::Pending(cause))
            .map(|(id, _)| id)
            .collect();
        for id in &stale {
            self.remove(*id);
        }
        stale.len()
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (CookieId, &Cookie<T>)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                #[allow(clippy::cast_possible_truncation)]
                Entry::Occupied { cookie, generation } => {
                    Some((CookieId::new(index as u32, *generation), cookie))
                }
                Entry::Vacant { .. } => None,
            })
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active + self.pending
    }

    /// Returns true if the jar holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of active entries.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active
    }

    /// Number of pending entries.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.free_head = FREE_LIST_END;
        self.active = 0;
        self.pending = 0;
    }
}

impl<T> Default for CookieJar<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn path(p: &str) -> WatchedObject {
        WatchedObject::Path(PathBuf::from(p))
    }

    #[test]
    fn id_pack_unpack() {
        let id = CookieId::new(42, 7);
        let unpacked = CookieId::from_u64(id.to_u64());
        assert_eq!(id, unpacked);
        assert_eq!(unpacked.index(), 42);
        assert_eq!(unpacked.generation(), 7);
        assert_eq!(id.to_string(), "42v7");
    }

    #[test]
    fn insert_and_take_active() {
        let mut jar = CookieJar::new();
        let id = jar.insert(path("/a"), None, "c1");
        assert_eq!(jar.active(), 1);
        assert_eq!(jar.pending(), 0);
        assert!(jar.take_pending(id).is_none());
        let cookie = jar.take_active(id).expect("active entry");
        assert_eq!(cookie.token, "c1");
        assert!(jar.is_empty());
    }

    #[test]
    fn pending_transition_keeps_total() {
        let mut jar = CookieJar::new();
        let a = jar.insert(path("/a"), None, 1);
        let b = jar.insert(path("/a"), None, 2);
        assert!(jar.mark_pending(a, PendingCause::Fired));
        assert!(!jar.mark_pending(a, PendingCause::Fired));
        assert_eq!((jar.active(), jar.pending(), jar.len()), (1, 1, 2));
        assert!(jar.take_active(a).is_none());
        assert_eq!(jar.take_pending(a).map(|c| c.token), Some(1));
        assert_eq!(jar.take_active(b).map(|c| c.token), Some(2));
        assert!(jar.is_empty());
    }

    #[test]
    fn stale_id_does_not_resolve_reused_slot() {
        let mut jar = CookieJar::new();
        let old = jar.insert(path("/a"), None, "old");
        jar.remove(old);
        let new = jar.insert(path("/a"), None, "new");
        assert_eq!(old.index(), new.index());
        assert_ne!(old.generation(), new.generation());
        assert!(jar.get(old).is_none());
        assert_eq!(jar.get(new).map(|c| c.token), Some("new"));
    }

    #[test]
    fn reclaim_only_matching_cause() {
        let mut jar = CookieJar::new();
        let fired = jar.insert(path("/a"), None, 1);
        let gone = jar.insert(path("/b"), None, 2);
        let live = jar.insert(path("/c"), None, 3);
        jar.mark_pending(fired, PendingCause::Fired);
        jar.mark_pending(gone, PendingCause::Dissociated);
        assert_eq!(jar.reclaim(PendingCause::Dissociated), 1);
        assert!(jar.get(fired).is_some());
        assert!(jar.get(gone).is_none());
        assert!(jar.get(live).is_some());
        assert_eq!((jar.active(), jar.pending()), (1, 1));
    }
}
