//! Open-handle caches.
//!
//! One backend open per `(file handle, access mode)` across the whole
//! process: concurrent opens of the same key converge on one entry,
//! callers arriving while the open is in flight queue in FIFO order, and
//! closes are deferred so short-lived protocol opens amortize to nothing.
//! Two caches exist, one for path-flavored handles (lookup, mkdir,
//! open-at targets) and one for file-flavored handles (read, write).
//!
//! Entries live in sharded maps under per-shard locks; each entry's own
//! mutable state (open count, pending waiters, idle stamp) sits behind a
//! private mutex so no lock is ever held across a backend dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::module::{AccessMode, VfsModule};

const SHARD_COUNT: usize = 64;

/// Path-flavored or file-flavored handle, mirroring the two caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleFlavor {
    /// Used by namespace operations; analogous to `O_PATH`.
    Path,
    /// Used by data-plane operations.
    File,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    /// Lives in a cache shard, closed by the reaper.
    Cached,
    /// Fabricated without a backend open; release is a no-op.
    Synthetic,
    /// Skips the cache; closed inline when the last reference drops.
    Detached,
}

enum Backing {
    /// The creating open is still in flight.
    Pending,
    /// The backend open completed.
    Ready { vfs_private: u64 },
}

struct Waiter {
    exclusive: bool,
    tx: oneshot::Sender<VfsResult<Arc<OpenHandle>>>,
}

struct HandleState {
    opencnt: u32,
    exclusive: bool,
    backing: Backing,
    waiters: Vec<Waiter>,
    idle_since: Option<Instant>,
}

/// A reference-counted open handle.
///
/// A handle observed outside the shard lock stays valid until the
/// caller's balancing release; `vfs_private` is immutable once the
/// pending open resolves.
pub struct OpenHandle {
    module: Arc<dyn VfsModule>,
    fh: Fh,
    fh_hash: u64,
    access: AccessMode,
    flavor: HandleFlavor,
    kind: HandleKind,
    state: Mutex<HandleState>,
}

impl OpenHandle {
    fn new(
        module: Arc<dyn VfsModule>,
        fh: Fh,
        fh_hash: u64,
        access: AccessMode,
        flavor: HandleFlavor,
        kind: HandleKind,
        backing: Backing,
        exclusive: bool,
    ) -> Arc<Self> {
        Arc::new(OpenHandle {
            module,
            fh,
            fh_hash,
            access,
            flavor,
            kind,
            state: Mutex::new(HandleState {
                opencnt: 1,
                exclusive,
                backing,
                waiters: Vec::new(),
                idle_since: None,
            }),
        })
    }

    /// Fabricates a synthetic handle carrying only the file handle.
    pub(crate) fn synthetic(
        module: Arc<dyn VfsModule>,
        fh: Fh,
        access: AccessMode,
        flavor: HandleFlavor,
    ) -> Arc<Self> {
        let fh_hash = fh.hash();
        OpenHandle::new(
            module,
            fh,
            fh_hash,
            access,
            flavor,
            HandleKind::Synthetic,
            Backing::Ready { vfs_private: 0 },
            false,
        )
    }

    /// Wraps an already-open backend object that bypasses the cache.
    pub(crate) fn detached(
        module: Arc<dyn VfsModule>,
        fh: Fh,
        access: AccessMode,
        flavor: HandleFlavor,
        vfs_private: u64,
    ) -> Arc<Self> {
        let fh_hash = fh.hash();
        OpenHandle::new(
            module,
            fh,
            fh_hash,
            access,
            flavor,
            HandleKind::Detached,
            Backing::Ready { vfs_private },
            false,
        )
    }

    /// The owning backend module.
    pub fn module(&self) -> &Arc<dyn VfsModule> {
        &self.module
    }

    /// The cached file handle.
    pub fn fh(&self) -> &Fh {
        &self.fh
    }

    /// Precomputed hash of the file handle.
    pub fn fh_hash(&self) -> u64 {
        self.fh_hash
    }

    /// Access mode of this open.
    pub fn access(&self) -> AccessMode {
        self.access
    }

    /// Path or file flavor.
    pub fn flavor(&self) -> HandleFlavor {
        self.flavor
    }

    /// True when no backend open backs this handle.
    pub fn is_synthetic(&self) -> bool {
        self.kind == HandleKind::Synthetic
    }

    /// Backend-private open state. Zero for synthetic handles and for
    /// handles whose open has not resolved yet.
    pub fn vfs_private(&self) -> u64 {
        match self.state.lock().backing {
            Backing::Ready { vfs_private } => vfs_private,
            Backing::Pending => 0,
        }
    }

    /// Grants queued waiters in FIFO order as far as exclusivity allows.
    /// Must be called with the state lock held.
    fn drain_waiters(self: &Arc<Self>, state: &mut HandleState) {
        loop {
            let wants_exclusive = match state.waiters.first() {
                Some(waiter) => waiter.exclusive,
                None => break,
            };
            if wants_exclusive {
                if state.opencnt != 0 {
                    break;
                }
            } else if state.exclusive {
                break;
            }
            let waiter = state.waiters.remove(0);
            state.exclusive = wants_exclusive;
            state.opencnt += 1;
            state.idle_since = None;
            // A gone receiver gives its grant back.
            if waiter.tx.send(Ok(self.clone())).is_err() {
                state.opencnt -= 1;
                if wants_exclusive {
                    state.exclusive = false;
                }
                if state.opencnt == 0 {
                    state.idle_since = Some(Instant::now());
                }
            }
        }
    }
}

/// Work order for the close path: the backend open to retire.
pub(crate) struct CloseTicket {
    pub(crate) module: Arc<dyn VfsModule>,
    pub(crate) fh: Fh,
    pub(crate) vfs_private: u64,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    fh: Fh,
    access: AccessMode,
}

struct Shard {
    map: Mutex<HashMap<Key, Arc<OpenHandle>>>,
}

/// Outcome of [`OpenCache::begin_acquire`].
pub(crate) enum Acquire {
    /// An existing handle was shared; no backend traffic needed.
    Hit(Arc<OpenHandle>),
    /// Another caller owns the open; await the grant.
    Wait(oneshot::Receiver<VfsResult<Arc<OpenHandle>>>),
    /// The caller must dispatch the backend open and then settle the
    /// entry with [`OpenCache::finish_open`].
    MustOpen(Arc<OpenHandle>),
}

/// Outcome of [`OpenCache::insert_ready`].
pub(crate) enum Insert {
    /// The handle was installed.
    Installed(Arc<OpenHandle>),
    /// An entry for the key already exists; the caller must retire its
    /// redundant backend open and acquire normally.
    Duplicate,
}

/// One of the two sharded open-handle caches.
pub(crate) struct OpenCache {
    flavor: HandleFlavor,
    shards: Box<[Shard]>,
}

impl OpenCache {
    pub(crate) fn new(flavor: HandleFlavor) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Shard {
                map: Mutex::new(HashMap::new()),
            })
            .collect();
        OpenCache { flavor, shards }
    }

    fn shard(&self, fh_hash: u64) -> &Shard {
        &self.shards[fh_hash as usize % self.shards.len()]
    }

    /// Looks up or creates the entry for `(fh, access)`.
    pub(crate) fn begin_acquire(
        &self,
        module: &Arc<dyn VfsModule>,
        fh: &Fh,
        access: AccessMode,
        exclusive: bool,
    ) -> Acquire {
        let fh_hash = fh.hash();
        let key = Key { fh: *fh, access };
        let shard = self.shard(fh_hash);
        let mut map = shard.map.lock();

        if let Some(handle) = map.get(&key) {
            let handle = handle.clone();
            // The shard lock stays held so the reaper cannot reclaim the
            // entry between finding it and taking a reference.
            let mut state = handle.state.lock();
            let pending = matches!(state.backing, Backing::Pending);
            if exclusive {
                // An idle entry can be claimed exclusively right away;
                // anything in flight or referenced forces a wait until
                // the open count drains to zero.
                if !pending
                    && !state.exclusive
                    && state.opencnt == 0
                    && state.waiters.is_empty()
                {
                    state.exclusive = true;
                    state.opencnt = 1;
                    state.idle_since = None;
                    drop(state);
                    return Acquire::Hit(handle);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push(Waiter { exclusive, tx });
                return Acquire::Wait(rx);
            }
            if pending || state.exclusive || !state.waiters.is_empty() {
                let (tx, rx) = oneshot::channel();
                state.waiters.push(Waiter { exclusive, tx });
                return Acquire::Wait(rx);
            }
            state.opencnt += 1;
            state.idle_since = None;
            drop(state);
            return Acquire::Hit(handle);
        }

        let handle = OpenHandle::new(
            module.clone(),
            *fh,
            fh_hash,
            access,
            self.flavor,
            HandleKind::Cached,
            Backing::Pending,
            exclusive,
        );
        map.insert(key, handle.clone());
        Acquire::MustOpen(handle)
    }

    /// Settles a pending entry after the backend open finished. On
    /// success the creator's handle becomes ready and queued waiters are
    /// granted in FIFO order; on failure the entry is removed and every
    /// waiter receives the same error.
    pub(crate) fn finish_open(
        &self,
        handle: &Arc<OpenHandle>,
        result: VfsResult<u64>,
    ) {
        match result {
            Ok(vfs_private) => {
                let mut state = handle.state.lock();
                state.backing = Backing::Ready { vfs_private };
                handle.drain_waiters(&mut state);
            }
            Err(err) => {
                let key = Key {
                    fh: handle.fh,
                    access: handle.access,
                };
                let shard = self.shard(handle.fh_hash);
                shard.map.lock().remove(&key);
                let mut state = handle.state.lock();
                state.opencnt = 0;
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.tx.send(Err(err));
                }
            }
        }
    }

    /// Installs an already-open handle, as produced by open-at. Fails as
    /// [`Insert::Duplicate`] when a concurrent opener won the race.
    pub(crate) fn insert_ready(
        &self,
        module: &Arc<dyn VfsModule>,
        fh: &Fh,
        access: AccessMode,
        vfs_private: u64,
    ) -> Insert {
        let fh_hash = fh.hash();
        let key = Key { fh: *fh, access };
        let shard = self.shard(fh_hash);
        let mut map = shard.map.lock();
        if map.contains_key(&key) {
            return Insert::Duplicate;
        }
        let handle = OpenHandle::new(
            module.clone(),
            *fh,
            fh_hash,
            access,
            self.flavor,
            HandleKind::Cached,
            Backing::Ready { vfs_private },
            false,
        );
        map.insert(key, handle.clone());
        Insert::Installed(handle)
    }

    /// Drops one reference. Returns a close ticket when the handle was
    /// detached and this was the last reference; cached handles are left
    /// for the reaper.
    pub(crate) fn release(handle: &Arc<OpenHandle>) -> Option<CloseTicket> {
        if handle.kind == HandleKind::Synthetic {
            return None;
        }
        let mut state = handle.state.lock();
        debug_assert!(state.opencnt > 0, "unbalanced open handle release");
        state.opencnt = state.opencnt.saturating_sub(1);
        if state.opencnt > 0 {
            return None;
        }
        // The last holder is gone; exclusivity ends and queued waiters,
        // exclusive or shared, get their turn in arrival order.
        state.exclusive = false;
        if !state.waiters.is_empty() {
            handle.drain_waiters(&mut state);
            if state.opencnt > 0 {
                return None;
            }
        }
        state.idle_since = Some(Instant::now());
        if handle.kind == HandleKind::Detached {
            if let Backing::Ready { vfs_private } = state.backing {
                return Some(CloseTicket {
                    module: handle.module.clone(),
                    fh: handle.fh,
                    vfs_private,
                });
            }
        }
        None
    }

    /// Removes and returns close tickets for every entry idle longer
    /// than `ttl`. Entries still referenced are never touched.
    pub(crate) fn sweep_idle(&self, ttl: Duration) -> Vec<CloseTicket> {
        let now = Instant::now();
        let mut tickets = Vec::new();
        for shard in self.shards.iter() {
            let mut map = shard.map.lock();
            map.retain(|_, handle| {
                let state = handle.state.lock();
                let expired = state.opencnt == 0
                    && state.waiters.is_empty()
                    && state
                        .idle_since
                        .is_some_and(|idle| now.duration_since(idle) > ttl);
                if !expired {
                    return true;
                }
                if let Backing::Ready { vfs_private } = state.backing {
                    tickets.push(CloseTicket {
                        module: handle.module.clone(),
                        fh: handle.fh,
                        vfs_private,
                    });
                }
                false
            });
        }
        tickets
    }

    /// Shutdown pass: reclaims every idle entry immediately and reports
    /// how many handles are still referenced.
    pub(crate) fn drain(&self) -> (Vec<CloseTicket>, usize) {
        let mut tickets = Vec::new();
        let mut busy = 0;
        for shard in self.shards.iter() {
            let mut map = shard.map.lock();
            map.retain(|_, handle| {
                let state = handle.state.lock();
                if state.opencnt > 0 || !state.waiters.is_empty() {
                    busy += 1;
                    return true;
                }
                if let Backing::Ready { vfs_private } = state.backing {
                    tickets.push(CloseTicket {
                        module: handle.module.clone(),
                        fh: handle.fh,
                        vfs_private,
                    });
                }
                false
            });
        }
        (tickets, busy)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }
}

impl std::fmt::Debug for OpenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHandle")
            .field("fh", &self.fh)
            .field("access", &self.access)
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}
