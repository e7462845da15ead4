//! Directory name cache.
//!
//! Maps `(parent handle, child name)` to the child's file handle so hot
//! lookups skip the backend. Entries are written through on every
//! successful lookup and creation and invalidated by any mutation of the
//! parent entry: remove, rename (both names), and failed revalidation.
//! A hit never carries attributes; callers that need them still perform
//! a getattr, which the attribute cache usually absorbs.

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_64;

use crate::fh::Fh;

struct NameKey {
    key_hash: u64,
    parent: Fh,
    name: Box<str>,
}

impl NameKey {
    fn new(parent: &Fh, name: &str) -> Self {
        let mut buf = Vec::with_capacity(parent.len() + name.len());
        buf.extend_from_slice(parent.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        NameKey {
            key_hash: xxh3_64(&buf),
            parent: *parent,
            name: name.into(),
        }
    }
}

impl PartialEq for NameKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_hash == other.key_hash
            && self.parent == other.parent
            && self.name == other.name
    }
}

impl Eq for NameKey {}

impl Hash for NameKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.key_hash);
    }
}

struct NameEntry {
    child: Fh,
    deadline: Instant,
}

/// Sharded name cache with per-entry deadlines.
pub(crate) struct NameCache {
    map: DashMap<NameKey, NameEntry>,
    ttl: Duration,
}

impl NameCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        NameCache {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Returns the child handle when the entry is still fresh.
    pub(crate) fn lookup(&self, parent: &Fh, name: &str) -> Option<Fh> {
        let key = NameKey::new(parent, name);
        let entry = self.map.get(&key)?;
        if Instant::now() >= entry.deadline {
            drop(entry);
            self.map.remove(&key);
            return None;
        }
        Some(entry.child)
    }

    /// Installs or refreshes the mapping.
    pub(crate) fn insert(&self, parent: &Fh, name: &str, child: Fh) {
        self.map.insert(
            NameKey::new(parent, name),
            NameEntry {
                child,
                deadline: Instant::now() + self.ttl,
            },
        );
    }

    /// Drops the mapping, if present.
    pub(crate) fn invalidate(&self, parent: &Fh, name: &str) {
        self.map.remove(&NameKey::new(parent, name));
    }
}
