//! Registry of live sessions.
//!
//! A passive slab-backed table owned by the dispatcher's control loop; nothing
//! else ever touches it, so it needs no locking. Slab slots are reused after a
//! removal, so every [`ConnectionId`] also carries a serial number that is
//! never reused. Late events naming a removed session miss on the serial
//! instead of hitting whichever session took over the slot.

use crate::error::{RelayError, Result};
use crate::relay::session::SessionHandle;
use slab::Slab;
use std::fmt;

/// Handle of a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    slot: usize,
    serial: u64,
}

impl ConnectionId {
    pub(crate) fn new(slot: usize, serial: u64) -> Self {
        Self { slot, serial }
    }

    /// Unique, monotonically increasing number for this connection.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.serial)
    }
}

/// Registry of sessions eligible to receive broadcasts.
///
/// Provides O(1) reserve, insert, lookup, and remove operations.
pub struct Registry {
    sessions: Slab<SessionHandle>,
    max_sessions: usize,
    last_serial: u64,
}

impl Registry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::with_capacity(max_sessions.min(1024)),
            max_sessions,
            last_serial: 0,
        }
    }

    /// Allocate the id the next inserted session must carry.
    ///
    /// Fails with `RegistryFull` at capacity.
    pub fn reserve(&mut self) -> Result<ConnectionId> {
        if self.sessions.len() >= self.max_sessions {
            return Err(RelayError::RegistryFull(self.max_sessions));
        }
        self.last_serial += 1;
        Ok(ConnectionId::new(self.sessions.vacant_key(), self.last_serial))
    }

    /// Insert a session built on the id returned by the latest `reserve`.
    pub fn insert(&mut self, session: SessionHandle) -> Result<()> {
        let id = session.id();
        if let Some(existing) = self.sessions.get(id.slot) {
            return Err(RelayError::RegistryInvariant(format!(
                "slot {} already holds {} while inserting {}",
                id.slot,
                existing.id(),
                id
            )));
        }
        if id.slot != self.sessions.vacant_key() || id.serial != self.last_serial {
            return Err(RelayError::RegistryInvariant(format!(
                "{id} was not the latest reservation"
            )));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(RelayError::RegistryFull(self.max_sessions));
        }

        self.sessions.insert(session);
        Ok(())
    }

    /// Remove a session. Returns `None` if it was already removed.
    pub fn remove(&mut self, id: ConnectionId) -> Option<SessionHandle> {
        match self.sessions.get(id.slot) {
            Some(session) if session.id() == id => Some(self.sessions.remove(id.slot)),
            _ => None,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&SessionHandle> {
        self.sessions.get(id.slot).filter(|s| s.id() == id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(id.slot).filter(|s| s.id() == id)
    }

    /// Apply `f` to every registered session.
    pub fn for_each(&self, mut f: impl FnMut(&SessionHandle)) {
        for (_, session) in self.sessions.iter() {
            f(session);
        }
    }

    /// Remove and return every session.
    pub fn drain(&mut self) -> Vec<SessionHandle> {
        self.sessions.drain().collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Maximum number of sessions allowed.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::SessionSettings;

    fn detached(id: ConnectionId, name: &str) -> SessionHandle {
        SessionHandle::detached(id, name, &SessionSettings::default())
    }

    #[test]
    fn test_reserve_insert_remove() {
        let mut registry = Registry::new(2);

        let a = registry.reserve().unwrap();
        registry.insert(detached(a, "a")).unwrap();
        let b = registry.reserve().unwrap();
        registry.insert(detached(b, "b")).unwrap();

        // At capacity
        assert!(matches!(registry.reserve(), Err(RelayError::RegistryFull(2))));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(a).unwrap().identity(), "a");

        assert!(registry.remove(a).is_some());
        assert!(registry.get(a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = Registry::new(4);
        let a = registry.reserve().unwrap();
        registry.insert(detached(a, "a")).unwrap();

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reused_slot_gets_new_serial() {
        let mut registry = Registry::new(4);
        let a = registry.reserve().unwrap();
        registry.insert(detached(a, "a")).unwrap();
        registry.remove(a);

        let b = registry.reserve().unwrap();
        registry.insert(detached(b, "b")).unwrap();
        assert_eq!(a.slot, b.slot);
        assert_ne!(a, b);

        // A stale removal for `a` must not evict `b`.
        assert!(registry.remove(a).is_none());
        assert!(registry.get(a).is_none());
        assert_eq!(registry.get(b).unwrap().identity(), "b");
    }

    #[test]
    fn test_insert_without_reservation_is_invariant_violation() {
        let mut registry = Registry::new(4);
        let a = registry.reserve().unwrap();
        registry.insert(detached(a, "a")).unwrap();

        let forged = ConnectionId::new(a.slot, 99);
        assert!(matches!(
            registry.insert(detached(forged, "x")),
            Err(RelayError::RegistryInvariant(_))
        ));

        let unreserved = ConnectionId::new(1, 42);
        assert!(matches!(
            registry.insert(detached(unreserved, "y")),
            Err(RelayError::RegistryInvariant(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_for_each_visits_all() {
        let mut registry = Registry::new(8);
        for name in ["a", "b", "c"] {
            let id = registry.reserve().unwrap();
            registry.insert(detached(id, name)).unwrap();
        }

        let mut seen = Vec::new();
        registry.for_each(|s| seen.push(s.identity().to_string()));
        seen.sort();
        assert_eq!(seen, ["a", "b", "c"]);

        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.capacity(), 8);
    }
}
