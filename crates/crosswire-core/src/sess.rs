//! Bounded session table keyed by remote address string.
//!
//! Used by the UDP server to map datagram sources onto virtual connections.
//! The count and the map are updated together so readers observing the count
//! never see it drift past the bound; re-inserting an existing key replaces
//! the value without consuming capacity.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;

/// Errors from session-table operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The table is at its bound; the caller should drop the datagram.
    #[error("session table full (max {0})")]
    Overflow(i64),

    /// No session is registered under the key.
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Concurrent map of sessions with an explicit capacity bound.
///
/// `max == 0` means unbounded.
#[derive(Debug)]
pub struct SessionTable<V> {
    conns: DashMap<String, V>,
    count: AtomicI64,
    max: i64,
}

impl<V: Clone> SessionTable<V> {
    /// Table bounded at `max` sessions; zero disables the bound.
    pub fn new(max: i64) -> Self {
        Self { conns: DashMap::new(), count: AtomicI64::new(0), max }
    }

    /// Insert or replace the session under `key`.
    ///
    /// Replacing never consumes capacity. A fresh insert fails with
    /// [`SessionError::Overflow`] once the bound is reached. Returns the
    /// session count after the operation.
    pub fn insert(&self, key: &str, value: V) -> Result<i64, SessionError> {
        match self.conns.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(value);
                Ok(self.count.load(Ordering::SeqCst))
            }
            Entry::Vacant(vacant) => {
                let count = self.count.load(Ordering::SeqCst);
                if self.max != 0 && count >= self.max {
                    return Err(SessionError::Overflow(self.max));
                }
                self.count.fetch_add(1, Ordering::SeqCst);
                vacant.insert(value);
                Ok(count + 1)
            }
        }
    }

    /// Look up a session.
    pub fn get(&self, key: &str) -> Option<V> {
        self.conns.get(key).map(|entry| entry.value().clone())
    }

    /// Look up a session, failing with [`SessionError::NotFound`].
    pub fn require(&self, key: &str) -> Result<V, SessionError> {
        self.get(key).ok_or_else(|| SessionError::NotFound(key.to_string()))
    }

    /// Remove the session under `key`, returning it if present.
    pub fn remove(&self, key: &str) -> Option<V> {
        let removed = self.conns.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
        removed.map(|(_, value)| value)
    }

    /// Current session count.
    pub fn len(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    /// True when the table holds no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every session.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &V)) {
        for entry in self.conns.iter() {
            visit(entry.key(), entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let table = SessionTable::new(0);
        assert_eq!(table.insert("10.0.0.1:1000", 1u32).unwrap(), 1);
        assert_eq!(table.get("10.0.0.1:1000"), Some(1));
        assert_eq!(table.remove("10.0.0.1:1000"), Some(1));
        assert!(table.is_empty());
        assert_eq!(table.remove("10.0.0.1:1000"), None);
    }

    #[test]
    fn bound_rejects_fresh_inserts_until_eviction() {
        let table = SessionTable::new(2);
        table.insert("a", 1u32).unwrap();
        table.insert("b", 2).unwrap();
        assert_eq!(table.insert("c", 3), Err(SessionError::Overflow(2)));

        table.remove("a");
        assert_eq!(table.insert("c", 3).unwrap(), 2);
    }

    #[test]
    fn replacing_existing_key_ignores_the_bound() {
        let table = SessionTable::new(1);
        table.insert("a", 1u32).unwrap();
        assert_eq!(table.insert("a", 2).unwrap(), 1);
        assert_eq!(table.get("a"), Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn zero_bound_is_unbounded() {
        let table = SessionTable::new(0);
        for i in 0..1000u32 {
            table.insert(&format!("peer-{i}"), i).unwrap();
        }
        assert_eq!(table.len(), 1000);
    }

    #[test]
    fn require_reports_missing_key() {
        let table = SessionTable::<u32>::new(0);
        assert_eq!(
            table.require("192.168.1.9:9000"),
            Err(SessionError::NotFound("192.168.1.9:9000".into()))
        );
    }

    #[test]
    fn for_each_visits_all() {
        let table = SessionTable::new(0);
        table.insert("a", 1u32).unwrap();
        table.insert("b", 2).unwrap();

        let mut sum = 0;
        table.for_each(|_, v| sum += v);
        assert_eq!(sum, 3);
    }
}
