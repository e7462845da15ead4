//! TTL-bounded attribute cache.
//!
//! Keyed by file handle, valued by the last attribute bundle a backend
//! returned. A lookup is served only when the entry is inside its TTL
//! and the requested mask is a subset of what the entry holds,
//! intersected with [`AttrMask::CACHEABLE`]: filesystem statistics and
//! the handle bit are never served from cache. Mutating operations
//! invalidate through [`AttrCache::invalidate`].

use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::attr::{AttrMask, Attrs};
use crate::fh::Fh;

struct AttrKey {
    fh_hash: u64,
    fh: Fh,
}

impl PartialEq for AttrKey {
    fn eq(&self, other: &Self) -> bool {
        self.fh_hash == other.fh_hash && self.fh == other.fh
    }
}

impl Eq for AttrKey {}

impl Hash for AttrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fh_hash);
    }
}

struct AttrEntry {
    attrs: Attrs,
    deadline: Instant,
}

/// Sharded attribute cache with per-entry deadlines.
pub(crate) struct AttrCache {
    map: DashMap<AttrKey, AttrEntry>,
    ttl: Duration,
}

impl AttrCache {
    pub(crate) fn new(ttl: Duration) -> Self {
        AttrCache {
            map: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached bundle when it is fresh and covers `mask`.
    pub(crate) fn lookup(&self, fh: &Fh, fh_hash: u64, mask: AttrMask) -> Option<Attrs> {
        let key = AttrKey { fh_hash, fh: *fh };
        let entry = self.map.get(&key)?;
        if Instant::now() >= entry.deadline {
            drop(entry);
            self.map.remove(&key);
            return None;
        }
        let servable = entry.attrs.set_mask & AttrMask::CACHEABLE;
        if !servable.contains(mask) {
            return None;
        }
        Some(entry.attrs.clone())
    }

    /// Installs or overwrites the bundle for `fh`.
    pub(crate) fn insert(&self, fh: &Fh, fh_hash: u64, attrs: &Attrs) {
        self.map.insert(
            AttrKey { fh_hash, fh: *fh },
            AttrEntry {
                attrs: attrs.clone(),
                deadline: Instant::now() + self.ttl,
            },
        );
    }

    /// Drops the entry for `fh`, if any.
    pub(crate) fn invalidate(&self, fh: &Fh, fh_hash: u64) {
        self.map.remove(&AttrKey { fh_hash, fh: *fh });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.len()
    }
}
