//! Directory mutations: mkdir, mknod, symlink, remove, rename, link.
//!
//! Every mutation here writes through the caches on completion: the new
//! or removed name is installed into or dropped from the name cache,
//! the child's attribute entry tracks the backend's answer, and the
//! parent directory's entry is invalidated and repopulated from the
//! post-operation attributes.

use std::sync::Arc;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::open_cache::OpenHandle;
use crate::ops::expect_payload;
use crate::request::{
    LinkOp, MkdirOp, MknodOp, OpPayload, RemoveOp, RenameOp, SymlinkOp,
};
use crate::vfs::Vfs;
use crate::NAME_MAX;

/// Result of the creating directory mutations.
#[derive(Debug)]
pub struct CreateResult {
    /// Attributes of the created object, file handle included.
    pub attrs: Attrs,
    /// Pre-operation parent attributes.
    pub dir_pre_attrs: Attrs,
    /// Post-operation parent attributes.
    pub dir_post_attrs: Attrs,
}

/// Result of [`Vfs::remove`].
#[derive(Debug)]
pub struct RemoveResult {
    /// Pre-operation parent attributes.
    pub dir_pre_attrs: Attrs,
    /// Post-operation parent attributes.
    pub dir_post_attrs: Attrs,
    /// Attributes of the removed object, when the backend returned them.
    pub removed_attrs: Attrs,
}

/// Result of [`Vfs::rename`].
#[derive(Debug)]
pub struct RenameResult {
    /// Pre/post attributes of the source directory.
    pub fromdir_pre_attrs: Attrs,
    /// Post-operation source directory attributes.
    pub fromdir_post_attrs: Attrs,
    /// Pre-operation destination directory attributes.
    pub todir_pre_attrs: Attrs,
    /// Post-operation destination directory attributes.
    pub todir_post_attrs: Attrs,
}

/// Result of [`Vfs::link`].
#[derive(Debug)]
pub struct LinkResult {
    /// Attributes of the linked object.
    pub attrs: Attrs,
    /// Attributes of a displaced entry, when replacing.
    pub replaced_attrs: Attrs,
    /// Pre-operation directory attributes.
    pub dir_pre_attrs: Attrs,
    /// Post-operation directory attributes.
    pub dir_post_attrs: Attrs,
}

fn check_name(name: &str) -> VfsResult<()> {
    if name.is_empty() {
        return Err(VfsError::Inval);
    }
    if name.len() > NAME_MAX {
        return Err(VfsError::NameTooLong);
    }
    Ok(())
}

impl Vfs {
    fn finish_create(
        &self,
        parent: &Arc<OpenHandle>,
        name: &str,
        attrs: &Attrs,
        dir_post: &Attrs,
    ) -> VfsResult<()> {
        if !attrs.set_mask.contains(AttrMask::FH) {
            return Err(VfsError::ServerFault);
        }
        let child_fh = attrs.fh;
        self.name_cache.insert(parent.fh(), name, child_fh);
        self.attr_cache.insert(&child_fh, child_fh.hash(), attrs);
        self.attr_cache.invalidate(parent.fh(), parent.fh_hash());
        if dir_post.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(parent.fh(), parent.fh_hash(), dir_post);
        }
        Ok(())
    }

    /// Creates a directory named `name` under `parent`.
    pub async fn mkdir(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        set: Attrs,
    ) -> VfsResult<CreateResult> {
        check_name(name)?;
        let state = self
            .run_request(
                parent.module().clone(),
                cred,
                *parent.fh(),
                OpPayload::Mkdir(MkdirOp {
                    name: name.to_string(),
                    set,
                    out_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status.inspect_err(|_| {
            self.attr_cache.invalidate(parent.fh(), parent.fh_hash());
        })?;
        let op = expect_payload!(state, Mkdir);
        self.finish_create(parent, name, &op.out_attrs, &op.out_dir_post_attrs)?;
        Ok(CreateResult {
            attrs: op.out_attrs,
            dir_pre_attrs: op.out_dir_pre_attrs,
            dir_post_attrs: op.out_dir_post_attrs,
        })
    }

    /// Creates a special node; type bits and device live in `set`.
    pub async fn mknod(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        set: Attrs,
    ) -> VfsResult<CreateResult> {
        check_name(name)?;
        let state = self
            .run_request(
                parent.module().clone(),
                cred,
                *parent.fh(),
                OpPayload::Mknod(MknodOp {
                    name: name.to_string(),
                    set,
                    out_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Mknod);
        self.finish_create(parent, name, &op.out_attrs, &op.out_dir_post_attrs)?;
        Ok(CreateResult {
            attrs: op.out_attrs,
            dir_pre_attrs: op.out_dir_pre_attrs,
            dir_post_attrs: op.out_dir_post_attrs,
        })
    }

    /// Creates a symbolic link named `name` pointing at `target`.
    pub async fn symlink(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        target: &str,
        set: Attrs,
    ) -> VfsResult<CreateResult> {
        check_name(name)?;
        let state = self
            .run_request(
                parent.module().clone(),
                cred,
                *parent.fh(),
                OpPayload::Symlink(SymlinkOp {
                    name: name.to_string(),
                    target: target.to_string(),
                    set,
                    out_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Symlink);
        self.finish_create(parent, name, &op.out_attrs, &op.out_dir_post_attrs)?;
        Ok(CreateResult {
            attrs: op.out_attrs,
            dir_pre_attrs: op.out_dir_pre_attrs,
            dir_post_attrs: op.out_dir_post_attrs,
        })
    }

    /// Removes the entry `name` from `parent`. `child_fh` lets the
    /// caches invalidate the removed object even when the backend does
    /// not return its attributes.
    pub async fn remove(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        child_fh: Option<Fh>,
    ) -> VfsResult<RemoveResult> {
        check_name(name)?;
        let state = self
            .run_request(
                parent.module().clone(),
                cred,
                *parent.fh(),
                OpPayload::Remove(RemoveOp {
                    name: name.to_string(),
                    child_fh,
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_removed_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                }),
            )
            .await?;
        // Whatever happened, the cached name is no longer trustworthy.
        self.name_cache.invalidate(parent.fh(), name);
        self.attr_cache.invalidate(parent.fh(), parent.fh_hash());
        state.status?;
        let op = expect_payload!(state, Remove);

        let removed_fh = if op.out_removed_attrs.set_mask.contains(AttrMask::FH)
        {
            Some(op.out_removed_attrs.fh)
        } else {
            child_fh
        };
        if let Some(fh) = removed_fh {
            self.attr_cache.invalidate(&fh, fh.hash());
        }
        if op.out_dir_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache.insert(
                parent.fh(),
                parent.fh_hash(),
                &op.out_dir_post_attrs,
            );
        }
        Ok(RemoveResult {
            dir_pre_attrs: op.out_dir_pre_attrs,
            dir_post_attrs: op.out_dir_post_attrs,
            removed_attrs: op.out_removed_attrs,
        })
    }

    /// Atomically (per backend capability) moves `from_dir`/`name` to
    /// `to_dir`/`new_name`. `target_fh` identifies an entry known to be
    /// replaced, so its caches can be dropped too.
    pub async fn rename(
        &self,
        cred: &Cred,
        from_dir: &Arc<OpenHandle>,
        name: &str,
        to_dir: &Arc<OpenHandle>,
        new_name: &str,
        target_fh: Option<Fh>,
    ) -> VfsResult<RenameResult> {
        check_name(name)?;
        check_name(new_name)?;
        if from_dir.fh().magic() != to_dir.fh().magic() {
            return Err(VfsError::XDev);
        }
        let state = self
            .run_request(
                from_dir.module().clone(),
                cred,
                *from_dir.fh(),
                OpPayload::Rename(RenameOp {
                    name: name.to_string(),
                    new_dir_fh: *to_dir.fh(),
                    new_name: new_name.to_string(),
                    target_fh,
                    out_fromdir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_fromdir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_todir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_todir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        // Both names move out from under their caches regardless of the
        // outcome.
        self.name_cache.invalidate(from_dir.fh(), name);
        self.name_cache.invalidate(to_dir.fh(), new_name);
        self.attr_cache
            .invalidate(from_dir.fh(), from_dir.fh_hash());
        self.attr_cache.invalidate(to_dir.fh(), to_dir.fh_hash());
        if let Some(fh) = target_fh {
            self.attr_cache.invalidate(&fh, fh.hash());
        }
        state.status?;
        let op = expect_payload!(state, Rename);
        if op
            .out_fromdir_post_attrs
            .set_mask
            .intersects(AttrMask::CACHEABLE)
        {
            self.attr_cache.insert(
                from_dir.fh(),
                from_dir.fh_hash(),
                &op.out_fromdir_post_attrs,
            );
        }
        if op
            .out_todir_post_attrs
            .set_mask
            .intersects(AttrMask::CACHEABLE)
        {
            self.attr_cache.insert(
                to_dir.fh(),
                to_dir.fh_hash(),
                &op.out_todir_post_attrs,
            );
        }
        Ok(RenameResult {
            fromdir_pre_attrs: op.out_fromdir_pre_attrs,
            fromdir_post_attrs: op.out_fromdir_post_attrs,
            todir_pre_attrs: op.out_todir_pre_attrs,
            todir_post_attrs: op.out_todir_post_attrs,
        })
    }

    /// Creates a hard link to the object behind `file` as
    /// `dir`/`name`.
    pub async fn link(
        &self,
        cred: &Cred,
        file: &Arc<OpenHandle>,
        dir: &Arc<OpenHandle>,
        name: &str,
        replace: bool,
    ) -> VfsResult<LinkResult> {
        check_name(name)?;
        if file.fh().magic() != dir.fh().magic() {
            return Err(VfsError::XDev);
        }
        let state = self
            .run_request(
                file.module().clone(),
                cred,
                *file.fh(),
                OpPayload::Link(LinkOp {
                    dir_fh: *dir.fh(),
                    name: name.to_string(),
                    replace,
                    out_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                    out_replaced_attrs: Attrs::request(
                        AttrMask::CACHEABLE | AttrMask::FH,
                    ),
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        // Link bumps the object's nlink, so its cached attributes are
        // stale either way.
        self.attr_cache.invalidate(file.fh(), file.fh_hash());
        self.attr_cache.invalidate(dir.fh(), dir.fh_hash());
        state.status?;
        let op = expect_payload!(state, Link);
        self.name_cache.insert(dir.fh(), name, *file.fh());
        if op.out_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(file.fh(), file.fh_hash(), &op.out_attrs);
        }
        if op.out_replaced_attrs.set_mask.contains(AttrMask::FH) {
            let fh = op.out_replaced_attrs.fh;
            self.attr_cache.invalidate(&fh, fh.hash());
        }
        if op.out_dir_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(dir.fh(), dir.fh_hash(), &op.out_dir_post_attrs);
        }
        Ok(LinkResult {
            attrs: op.out_attrs,
            replaced_attrs: op.out_replaced_attrs,
            dir_pre_attrs: op.out_dir_pre_attrs,
            dir_post_attrs: op.out_dir_post_attrs,
        })
    }
}
