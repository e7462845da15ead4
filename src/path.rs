//! Generic path resolution.
//!
//! `lookup_path` walks a slash-separated path one component at a time
//! from an arbitrary starting handle, following symlinks safely and
//! crossing mounts implicitly through file-handle routing. `create_path`
//! walks the same way but creates missing interior directories and the
//! leaf itself, racing benignly with concurrent creators.

use bitflags::bitflags;
use memchr::memchr;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::module::OpenFlags;
use crate::vfs::Vfs;
use crate::{NAME_MAX, PATH_MAX};

/// Maximum number of symlink expansions before `Loop`.
pub const SYMLOOP_MAX: u32 = 40;

bitflags! {
    /// Flags for [`Vfs::lookup_path`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LookupFlags: u32 {
        /// Follow a symlink in the final component.
        const FOLLOW = 1 << 0;
    }
}

/// Splits the first component off `path`. The input must not start with
/// a separator.
fn split_component(path: &str) -> (&str, &str) {
    match memchr(b'/', path.as_bytes()) {
        Some(at) => (&path[..at], &path[at + 1..]),
        None => (path, ""),
    }
}

/// True when `rest` holds no further components.
fn exhausted(rest: &str) -> bool {
    rest.bytes().all(|b| b == b'/')
}

impl Vfs {
    /// Resolves `path` relative to `root_fh` and returns the terminal
    /// object's attributes, file handle included.
    ///
    /// Leading, trailing and doubled separators are ignored. Interior
    /// symlinks are always expanded; a terminal symlink only under
    /// [`LookupFlags::FOLLOW`]. Absolute targets restart at `root_fh`.
    /// More than [`SYMLOOP_MAX`] expansions fail with
    /// [`VfsError::Loop`].
    pub async fn lookup_path(
        &self,
        cred: &Cred,
        root_fh: &Fh,
        path: &str,
        attr_mask: AttrMask,
        flags: LookupFlags,
    ) -> VfsResult<Attrs> {
        if path.len() > PATH_MAX {
            return Err(VfsError::NameTooLong);
        }
        let mut rest = path.trim_start_matches('/').to_string();
        let mut parent = *root_fh;
        let mut symlinks = 0u32;

        loop {
            if exhausted(&rest) {
                let mut attrs = self
                    .getattr_fh(cred, &parent, attr_mask | AttrMask::MODE)
                    .await?;
                attrs.set_fh(parent);
                return Ok(attrs);
            }
            let (name, remaining) = split_component(&rest);
            if name.is_empty() {
                rest = remaining.trim_start_matches('/').to_string();
                continue;
            }
            if name.len() > NAME_MAX {
                return Err(VfsError::NameTooLong);
            }
            let terminal = exhausted(remaining);

            let want = if terminal {
                attr_mask | AttrMask::FH | AttrMask::MODE
            } else {
                AttrMask::FH | AttrMask::MODE
            };
            let parent_handle = self.open_path(cred, &parent).await?;
            let looked_up = self.lookup(cred, &parent_handle, name, want).await;
            self.release(parent_handle).await;
            let child = looked_up?;

            if child.is_symlink()
                && (!terminal || flags.contains(LookupFlags::FOLLOW))
            {
                symlinks += 1;
                if symlinks > SYMLOOP_MAX {
                    return Err(VfsError::Loop);
                }
                let link_handle = self.open_path(cred, &child.fh).await?;
                let read = self
                    .readlink(cred, &link_handle, PATH_MAX as u32)
                    .await;
                self.release(link_handle).await;
                let target = read?;

                if target.starts_with('/') {
                    parent = *root_fh;
                }
                let target = target.trim_start_matches('/');
                let remaining = remaining.trim_start_matches('/');
                rest = if remaining.is_empty() {
                    target.to_string()
                } else if target.is_empty() {
                    remaining.to_string()
                } else {
                    format!("{target}/{remaining}")
                };
                continue;
            }

            if terminal {
                return Ok(child);
            }
            if !child.is_dir() {
                return Err(VfsError::NotDir);
            }
            parent = child.fh;
            rest = remaining.trim_start_matches('/').to_string();
        }
    }

    /// Resolves `path` like [`Vfs::lookup_path`] but creates what is
    /// missing: interior directories via mkdir (a concurrent creator's
    /// `Exist` is treated as success) and the leaf via an open-at with
    /// [`OpenFlags::CREATE`], carrying `set` as its initial attributes.
    /// Returns the leaf's attributes.
    pub async fn create_path(
        &self,
        cred: &Cred,
        root_fh: &Fh,
        path: &str,
        set: Attrs,
        attr_mask: AttrMask,
    ) -> VfsResult<Attrs> {
        if path.len() > PATH_MAX {
            return Err(VfsError::NameTooLong);
        }
        let mut rest = path.trim_start_matches('/').to_string();
        let mut parent = *root_fh;
        let mut symlinks = 0u32;

        loop {
            if exhausted(&rest) {
                return Err(VfsError::Inval);
            }
            let (name, remaining) = split_component(&rest);
            if name.is_empty() {
                rest = remaining.trim_start_matches('/').to_string();
                continue;
            }
            if name.len() > NAME_MAX {
                return Err(VfsError::NameTooLong);
            }
            let terminal = exhausted(remaining);

            let parent_handle = self.open_path(cred, &parent).await?;
            if terminal {
                let opened = self
                    .open_at(
                        cred,
                        &parent_handle,
                        name,
                        OpenFlags::CREATE,
                        set,
                        attr_mask,
                    )
                    .await;
                self.release(parent_handle).await;
                let (handle, attrs) = opened?;
                self.release(handle).await;
                return Ok(attrs);
            }

            let looked_up = self
                .lookup(
                    cred,
                    &parent_handle,
                    name,
                    AttrMask::FH | AttrMask::MODE,
                )
                .await;
            let child = match looked_up {
                Ok(child) => {
                    self.release(parent_handle).await;
                    child
                }
                Err(VfsError::NoEnt) => {
                    let mut dir_set = Attrs::default();
                    dir_set.mode = libc::S_IFDIR as u32 | 0o755;
                    dir_set.set_mask = AttrMask::MODE;
                    let made = self
                        .mkdir(cred, &parent_handle, name, dir_set)
                        .await;
                    let child = match made {
                        Ok(created) => Ok(created.attrs),
                        // Benign race: someone else created it first.
                        Err(VfsError::Exist) => {
                            self.lookup(
                                cred,
                                &parent_handle,
                                name,
                                AttrMask::FH | AttrMask::MODE,
                            )
                            .await
                        }
                        Err(err) => Err(err),
                    };
                    self.release(parent_handle).await;
                    child?
                }
                Err(err) => {
                    self.release(parent_handle).await;
                    return Err(err);
                }
            };

            if child.is_symlink() {
                symlinks += 1;
                if symlinks > SYMLOOP_MAX {
                    return Err(VfsError::Loop);
                }
                let link_handle = self.open_path(cred, &child.fh).await?;
                let read = self
                    .readlink(cred, &link_handle, PATH_MAX as u32)
                    .await;
                self.release(link_handle).await;
                let target = read?;
                if target.starts_with('/') {
                    parent = *root_fh;
                }
                let target = target.trim_start_matches('/');
                let remaining = remaining.trim_start_matches('/');
                rest = if target.is_empty() {
                    remaining.to_string()
                } else if remaining.is_empty() {
                    target.to_string()
                } else {
                    format!("{target}/{remaining}")
                };
                continue;
            }
            if !child.is_dir() {
                return Err(VfsError::NotDir);
            }
            parent = child.fh;
            rest = remaining.trim_start_matches('/').to_string();
        }
    }
}
