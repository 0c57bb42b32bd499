//! Watch registry: which objects currently have a live association.
//!
//! Two maps, one per identity domain. An object appears at most once; its
//! value is the cookie id of the association the kernel is watching.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::PathBuf;

use super::cookie::CookieId;
use super::WatchedObject;

/// Active associations keyed by object identity.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    paths: HashMap<PathBuf, CookieId>,
    fds: HashMap<RawFd, CookieId>,
}

impl WatchRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cookie id watching `object`, if any.
    #[must_use]
    pub fn get(&self, object: &WatchedObject) -> Option<CookieId> {
        match object {
            WatchedObject::Path(path) => self.paths.get(path).copied(),
            WatchedObject::Fd(fd) => self.fds.get(fd).copied(),
        }
    }

    /// Returns true if `object` has a live association.
    #[must_use]
    pub fn contains(&self, object: &WatchedObject) -> bool {
        self.get(object).is_some()
    }

    /// Records a new association.
    ///
    /// Returns false and leaves the registry untouched if the object is
    /// already present.
    pub fn insert(&mut self, object: WatchedObject, id: CookieId) -> bool {
        match object {
            WatchedObject::Path(path) => match self.paths.entry(path) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(id);
                    true
                }
            },
            WatchedObject::Fd(fd) => match self.fds.entry(fd) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(id);
                    true
                }
            },
        }
    }

    /// Removes the association for `object`.
    pub fn remove(&mut self, object: &WatchedObject) -> Option<CookieId> {
        match object {
            WatchedObject::Path(path) => self.paths.remove(path),
            WatchedObject::Fd(fd) => self.fds.remove(fd),
        }
    }

    /// Removes the association for `object` only if it is still `id`.
    ///
    /// A stale event must not evict a fresher association of the same object.
    pub fn remove_if(&mut self, object: &WatchedObject, id: CookieId) -> bool {
        if self.get(object) == Some(id) {
            self.remove(object);
            true
        } else {
            false
        }
    }

    /// Number of watched paths.
    #[must_use]
    pub fn paths(&self) -> usize {
        self.paths.len()
    }

    /// Number of watched descriptors.
    #[must_use]
    pub fn fds(&self) -> usize {
        self.fds.len()
    }

    /// Total number of live associations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len() + self.fds.len()
    }

    /// Returns true if nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every association.
    pub fn clear(&mut self) {
        self.paths.clear();
        self.fds.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::cookie::CookieJar;

    fn ids(n: usize) -> Vec<CookieId> {
        let mut jar = CookieJar::new();
        (0..n)
            .map(|i| jar.insert(WatchedObject::Fd(-1), None, i))
            .collect()
    }

    #[test]
    fn duplicate_insert_rejected() {
        let ids = ids(2);
        let mut registry = WatchRegistry::new();
        let path = WatchedObject::Path(PathBuf::from("/a"));
        assert!(registry.insert(path.clone(), ids[0]));
        assert!(!registry.insert(path.clone(), ids[1]));
        assert_eq!(registry.get(&path), Some(ids[0]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn domains_are_separate() {
        let ids = ids(2);
        let mut registry = WatchRegistry::new();
        assert!(registry.insert(WatchedObject::Path(PathBuf::from("3")), ids[0]));
        assert!(registry.insert(WatchedObject::Fd(3), ids[1]));
        assert_eq!((registry.paths(), registry.fds()), (1, 1));
        assert_eq!(registry.remove(&WatchedObject::Fd(3)), Some(ids[1]));
        assert!(registry.contains(&WatchedObject::Path(PathBuf::from("3"))));
    }

    #[test]
    fn remove_if_respects_current_id() {
        let ids = ids(2);
        let mut registry = WatchRegistry::new();
        let fd = WatchedObject::Fd(7);
        registry.insert(fd.clone(), ids[1]);
        assert!(!registry.remove_if(&fd, ids[0]));
        assert!(registry.contains(&fd));
        assert!(registry.remove_if(&fd, ids[1]));
        assert!(registry.is_empty());
    }
}
