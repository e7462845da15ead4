//! Mount table.
//!
//! Every file handle carries a 16-byte mount id in bytes 1..17; the
//! table maps that id back to the mount record and its backend module.
//! Mount ids are stable 128-bit hashes of the normalized mount path, so
//! handles survive server restarts as long as the share definition does.

use std::sync::Arc;

use dashmap::DashMap;
use xxhash_rust::xxh3::xxh3_128;

use crate::error::{VfsError, VfsResult};
use crate::fh::{Fh, MOUNT_ID_SIZE};
use crate::module::VfsModule;
use crate::request::MountPrivate;

/// Stable 128-bit identity of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountId(pub [u8; MOUNT_ID_SIZE]);

impl MountId {
    /// Derives the id from a normalized mount path.
    pub fn from_path(path: &str) -> Self {
        MountId(xxh3_128(path.as_bytes()).to_be_bytes())
    }
}

/// Mount-level attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountAttrs {
    /// Backend-defined mount flags.
    pub flags: u64,
}

/// One attached share.
pub struct Mount {
    /// Backend serving this mount.
    pub module: Arc<dyn VfsModule>,
    /// Normalized mount path within the unified namespace.
    pub path: String,
    /// Root file handle: magic, mount id, backend fragment.
    pub root_fh: Fh,
    /// Mount attributes.
    pub attrs: MountAttrs,
    /// Backend per-mount state, echoed back at umount.
    pub(crate) private: Option<MountPrivate>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("module", &self.module.name())
            .field("path", &self.path)
            .field("root_fh", &self.root_fh)
            .field("attrs", &self.attrs)
            .field("private", &self.private.is_some())
            .finish()
    }
}

/// Collapses separators and strips leading/trailing slashes, so
/// `"/exports//a/"` and `"exports/a"` name the same mount.
pub(crate) fn normalize_mount_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Maps mount ids to mounts.
pub(crate) struct MountTable {
    mounts: DashMap<MountId, Arc<Mount>>,
}

impl MountTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(MountTable {
            mounts: DashMap::new(),
        })
    }

    /// Installs a mount. Fails with [`VfsError::Exist`] when the id or
    /// the path is already attached.
    pub(crate) fn insert(&self, id: MountId, mount: Arc<Mount>) -> VfsResult<()> {
        if self.by_path(&mount.path).is_some() {
            return Err(VfsError::Exist);
        }
        match self.mounts.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(VfsError::Exist),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(mount);
                Ok(())
            }
        }
    }

    /// Detaches and returns a mount.
    pub(crate) fn remove(&self, id: MountId) -> Option<Arc<Mount>> {
        self.mounts.remove(&id).map(|(_, mount)| mount)
    }

    /// Resolves a file handle to its mount via the embedded mount id.
    pub(crate) fn resolve(&self, fh: &Fh) -> VfsResult<Arc<Mount>> {
        let prefix = fh.prefix().ok_or(VfsError::BadHandle)?;
        self.mounts
            .get(&MountId(prefix.mount_id))
            .map(|m| Arc::clone(m.value()))
            .ok_or(VfsError::Stale)
    }

    /// Finds a mount by its normalized path.
    pub(crate) fn by_path(&self, path: &str) -> Option<Arc<Mount>> {
        self.mounts
            .iter()
            .find(|entry| entry.value().path == path)
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of `(path, root handle)` pairs, for the root
    /// pseudo-filesystem.
    pub(crate) fn paths(&self) -> Vec<(String, Fh)> {
        self.mounts
            .iter()
            .map(|entry| (entry.value().path.clone(), entry.value().root_fh))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.mounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Capabilities;
    use crate::request::Request;

    struct StubModule;

    impl VfsModule for StubModule {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn magic(&self) -> u8 {
            3
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn dispatch(&self, request: Request) {
            request.complete(Ok(()));
        }
    }

    fn mount(path: &str) -> (MountId, Arc<Mount>) {
        let path = normalize_mount_path(path);
        let id = MountId::from_path(&path);
        let root_fh = Fh::from_slice(&[3u8])
            .unwrap()
            .extend(&id.0)
            .unwrap()
            .extend(&[1])
            .unwrap();
        (
            id,
            Arc::new(Mount {
                module: Arc::new(StubModule),
                path,
                root_fh,
                attrs: MountAttrs::default(),
                private: None,
            }),
        )
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_mount_path("/exports//a/"), "exports/a");
        assert_eq!(normalize_mount_path("exports/a"), "exports/a");
        assert_eq!(normalize_mount_path("/"), "");
    }

    #[test]
    fn resolve_by_embedded_id() {
        let table = MountTable::new();
        let (id, m) = mount("/share");
        table.insert(id, m.clone()).unwrap();

        let resolved = table.resolve(&m.root_fh).unwrap();
        assert_eq!(resolved.path, "share");

        let child = m.root_fh.extend(b"xyz").unwrap();
        assert_eq!(table.resolve(&child).unwrap().path, "share");
    }

    #[test]
    fn unknown_mount_is_stale_and_short_fh_is_bad() {
        let table = MountTable::new();
        let (_, m) = mount("/share");
        assert_eq!(table.resolve(&m.root_fh).unwrap_err(), VfsError::Stale);
        assert_eq!(
            table.resolve(&Fh::root()).unwrap_err(),
            VfsError::BadHandle
        );
    }

    #[test]
    fn duplicate_rejected() {
        let table = MountTable::new();
        let (id, m) = mount("/share");
        table.insert(id, m.clone()).unwrap();
        let (id2, m2) = mount("share/");
        assert_eq!(id, id2);
        assert_eq!(table.insert(id2, m2).unwrap_err(), VfsError::Exist);
        assert_eq!(table.len(), 1);
    }
}
