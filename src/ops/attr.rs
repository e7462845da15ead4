//! Getattr and setattr.

use std::sync::Arc;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::VfsResult;
use crate::fh::Fh;
use crate::module::{AccessMode, OpenFlags};
use crate::open_cache::{HandleFlavor, OpenHandle};
use crate::ops::expect_payload;
use crate::request::{GetattrOp, OpPayload, SetattrOp};
use crate::vfs::Vfs;

impl Vfs {
    /// Fetches attributes, serving from the attribute cache when the
    /// requested mask allows it. Backend fetches always request the full
    /// cacheable set so the subsequent insert is maximally useful.
    pub async fn getattr(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        mask: AttrMask,
    ) -> VfsResult<Attrs> {
        if (mask - (AttrMask::FH | AttrMask::CACHEABLE)).is_empty() {
            if let Some(mut attrs) = self.attr_cache.lookup(
                handle.fh(),
                handle.fh_hash(),
                mask & AttrMask::CACHEABLE,
            ) {
                if mask.contains(AttrMask::FH) {
                    attrs.set_fh(*handle.fh());
                }
                return Ok(attrs);
            }
        }

        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Getattr(GetattrOp {
                    out_attrs: Attrs::request(mask | AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let mut op = expect_payload!(state, Getattr);
        self.attr_cache
            .insert(handle.fh(), handle.fh_hash(), &op.out_attrs);
        if mask.contains(AttrMask::FH)
            && !op.out_attrs.set_mask.contains(AttrMask::FH)
        {
            op.out_attrs.set_fh(*handle.fh());
        }
        Ok(op.out_attrs)
    }

    /// Convenience getattr that opens and releases a path handle around
    /// the fetch; the handle is synthetic for stateless backends, so the
    /// round trip usually costs nothing.
    pub async fn getattr_fh(
        &self,
        cred: &Cred,
        fh: &Fh,
        mask: AttrMask,
    ) -> VfsResult<Attrs> {
        let handle = self
            .acquire(
                cred,
                fh,
                AccessMode::ReadWrite,
                HandleFlavor::Path,
                OpenFlags::empty(),
            )
            .await?;
        let result = self.getattr(cred, &handle, mask).await;
        self.release(handle).await;
        result
    }

    /// Applies the attributes selected by `set.set_mask` and returns the
    /// pre/post pair. The target's cache entry is invalidated and then
    /// repopulated from the post-operation attributes.
    pub async fn setattr(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        set: Attrs,
    ) -> VfsResult<(Attrs, Attrs)> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Setattr(SetattrOp {
                    set,
                    out_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        self.attr_cache.invalidate(handle.fh(), handle.fh_hash());
        state.status?;
        let op = expect_payload!(state, Setattr);
        if op.out_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(handle.fh(), handle.fh_hash(), &op.out_post_attrs);
        }
        Ok((op.out_pre_attrs, op.out_post_attrs))
    }
}
