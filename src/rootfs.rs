//! Root pseudo-filesystem.
//!
//! Module magic 0 presents the virtual union of all mounts. Its root
//! file handle is the single byte `0x00`; handles of intermediate
//! namespace directories are `0x00` followed by the directory's
//! normalized path bytes. Lookups descend mount paths one component at
//! a time and hand over the mount's real root handle at the leaf, which
//! is where handle routing crosses into the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use crate::attr::{
    AttrMask, Attrs, SYNTHETIC_FS_BYTES, SYNTHETIC_FS_INODES, TimeSpec,
};
use crate::error::{VfsError, VfsResult};
use crate::fh::{Fh, ROOT_MAGIC};
use crate::module::{Capabilities, ReaddirFlags, VfsModule};
use crate::mount_table::MountTable;
use crate::request::{DirEntry, OpPayload, Request};

/// Cookie of the first real entry; lower cookies are the dot entries.
const FIRST_ENTRY_COOKIE: u64 = 10;

pub(crate) struct RootFs {
    table: Arc<MountTable>,
}

impl RootFs {
    pub(crate) fn new(table: Arc<MountTable>) -> Arc<Self> {
        Arc::new(RootFs { table })
    }

    /// Decodes the namespace prefix out of a magic-0 handle.
    fn prefix_of(fh: &Fh) -> VfsResult<&str> {
        if fh.magic() != Some(ROOT_MAGIC) {
            return Err(VfsError::BadHandle);
        }
        std::str::from_utf8(&fh.as_bytes()[1..]).map_err(|_| VfsError::BadHandle)
    }

    fn prefix_fh(prefix: &str) -> VfsResult<Fh> {
        Fh::root()
            .extend(prefix.as_bytes())
            .map_err(|_| VfsError::NameTooLong)
    }

    /// The children of a namespace directory: next path components of
    /// every mount under `prefix`, each either another namespace
    /// directory or a mount root.
    fn children_of(&self, prefix: &str) -> BTreeMap<String, Fh> {
        let mut children = BTreeMap::new();
        for (path, root_fh) in self.table.paths() {
            let rest = if prefix.is_empty() {
                path.as_str()
            } else if let Some(rest) = path
                .strip_prefix(prefix)
                .and_then(|r| r.strip_prefix('/'))
            {
                rest
            } else {
                continue;
            };
            let Some(component) = rest.split('/').next().filter(|c| !c.is_empty())
            else {
                continue;
            };
            let fh = if rest == component {
                root_fh
            } else {
                let sub = if prefix.is_empty() {
                    component.to_string()
                } else {
                    format!("{prefix}/{component}")
                };
                match Self::prefix_fh(&sub) {
                    Ok(fh) => fh,
                    Err(_) => continue,
                }
            };
            children.entry(component.to_string()).or_insert(fh);
        }
        children
    }

    /// True when `prefix` names the root or an existing interior
    /// namespace directory.
    fn prefix_exists(&self, prefix: &str) -> bool {
        prefix.is_empty()
            || self.table.paths().iter().any(|(path, _)| {
                path.strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
            })
    }

    fn dir_attrs(&self, prefix: &str, fh: &Fh, mask: AttrMask) -> Attrs {
        let now = TimeSpec::now();
        let mut attrs = Attrs::request(mask);
        attrs.set_mask = AttrMask::STAT | AttrMask::STATFS;
        attrs.dev = 0;
        attrs.ino = if prefix.is_empty() {
            1
        } else {
            xxh3_64(prefix.as_bytes()) | 1
        };
        attrs.mode = libc::S_IFDIR as u32 | 0o755;
        attrs.nlink = 2 + self.children_of(prefix).len() as u32;
        attrs.uid = 0;
        attrs.gid = 0;
        attrs.size = 4096;
        attrs.space_used = 4096;
        attrs.atime = now;
        attrs.mtime = now;
        attrs.ctime = now;
        attrs.fs_space_total = SYNTHETIC_FS_BYTES;
        attrs.fs_space_free = SYNTHETIC_FS_BYTES;
        attrs.fs_space_avail = SYNTHETIC_FS_BYTES;
        attrs.fs_files_total = SYNTHETIC_FS_INODES;
        attrs.fs_files_free = SYNTHETIC_FS_INODES;
        attrs.fs_files_avail = SYNTHETIC_FS_INODES;
        attrs.fsid = 0;
        attrs.set_fh(*fh);
        attrs
    }

    fn lookup(&self, fh: &Fh, name: &str) -> VfsResult<Attrs> {
        let prefix = Self::prefix_of(fh)?;
        if !self.prefix_exists(prefix) {
            return Err(VfsError::Stale);
        }
        let children = self.children_of(prefix);
        let child_fh = children.get(name).ok_or(VfsError::NoEnt)?;
        let child_prefix = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        // A mount root belongs to its backend; report it as a directory
        // and let attribute refresh go through the owning module.
        Ok(self.dir_attrs(&child_prefix, child_fh, AttrMask::STAT))
    }

    fn getattr(&self, fh: &Fh, mask: AttrMask) -> VfsResult<Attrs> {
        let prefix = Self::prefix_of(fh)?;
        if !self.prefix_exists(prefix) {
            return Err(VfsError::Stale);
        }
        Ok(self.dir_attrs(prefix, fh, mask))
    }

    fn readdir(&self, request: &mut Request) -> VfsResult<()> {
        let fh = request.fh;
        let prefix = Self::prefix_of(&fh)?.to_string();
        if !self.prefix_exists(&prefix) {
            return Err(VfsError::Stale);
        }

        let children = self.children_of(&prefix);
        let verifier = {
            let names = children.keys().cloned().collect::<Vec<_>>().join("\n");
            xxh3_64(names.as_bytes())
        };
        let self_attrs = self.dir_attrs(&prefix, &fh, AttrMask::STAT);

        let OpPayload::Readdir(op) = &mut request.payload else {
            return Err(VfsError::Inval);
        };
        if op.cookie != 0 && op.verifier != verifier {
            return Err(VfsError::BadCookie);
        }
        let mut emit = op.emit.take().ok_or(VfsError::Inval)?;
        let mut cookie = op.cookie;
        let mut eof = true;

        if op.flags.contains(ReaddirFlags::EMIT_DOT) && cookie < 2 {
            for (dot, c) in [(".", 1u64), ("..", 2u64)] {
                if cookie >= c {
                    continue;
                }
                if !emit(&DirEntry {
                    ino: self_attrs.ino,
                    cookie: c,
                    name: dot,
                    attrs: &self_attrs,
                }) {
                    eof = false;
                    break;
                }
                cookie = c;
            }
        }

        if eof {
            for (index, (name, child_fh)) in children.iter().enumerate() {
                let entry_cookie = FIRST_ENTRY_COOKIE + index as u64;
                if cookie >= entry_cookie {
                    continue;
                }
                let child_prefix = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                let attrs = self.dir_attrs(&child_prefix, child_fh, op.attr_mask);
                if !emit(&DirEntry {
                    ino: attrs.ino,
                    cookie: entry_cookie,
                    name,
                    attrs: &attrs,
                }) {
                    eof = false;
                    break;
                }
                cookie = entry_cookie;
            }
        }

        op.out_cookie = cookie;
        op.out_verifier = verifier;
        op.out_eof = eof;
        op.out_dir_attrs = self_attrs;
        Ok(())
    }
}

impl VfsModule for RootFs {
    fn name(&self) -> &'static str {
        "root"
    }

    fn magic(&self) -> u8 {
        ROOT_MAGIC
    }

    fn capabilities(&self) -> Capabilities {
        // Stateless by construction: every handle is synthetic.
        Capabilities::empty()
    }

    fn dispatch(&self, mut request: Request) {
        let fh = request.fh;
        let status = if matches!(request.payload, OpPayload::Readdir(_)) {
            self.readdir(&mut request)
        } else {
            match &mut request.payload {
                OpPayload::Lookup(op) => self
                    .lookup(&fh, &op.name)
                    .map(|attrs| op.out_attrs = attrs),
                OpPayload::Getattr(op) => self
                    .getattr(&fh, op.out_attrs.req_mask)
                    .map(|attrs| op.out_attrs = attrs),
                OpPayload::Readlink(_) => Err(VfsError::Inval),
                // The union directory only changes through mount and
                // umount.
                OpPayload::Mkdir(_)
                | OpPayload::Remove(_)
                | OpPayload::Rename(_)
                | OpPayload::Link(_)
                | OpPayload::Symlink(_)
                | OpPayload::Mknod(_)
                | OpPayload::Setattr(_)
                | OpPayload::OpenAt(_)
                | OpPayload::Write(_) => Err(VfsError::RoFs),
                _ => Err(VfsError::NotSupp),
            }
        };
        request.complete(status);
    }
}
