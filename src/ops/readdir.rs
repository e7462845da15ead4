//! Directory iteration.

use std::sync::Arc;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::VfsResult;
use crate::module::ReaddirFlags;
use crate::open_cache::OpenHandle;
use crate::ops::expect_payload;
use crate::request::{DirEntry, OpPayload, ReaddirOp};
use crate::vfs::Vfs;

/// Final state of a [`Vfs::readdir`] iteration.
#[derive(Debug, Clone)]
pub struct ReaddirResult {
    /// Cookie at which iteration stopped; resume from here.
    pub cookie: u64,
    /// Verifier for the cookies emitted in this pass.
    pub verifier: u64,
    /// True when the directory was exhausted.
    pub eof: bool,
    /// Post-operation directory attributes.
    pub dir_attrs: Attrs,
}

impl Vfs {
    /// Iterates directory entries, invoking `emit` per entry until the
    /// backend runs out or `emit` reports that the consumer is full.
    /// The emitted sequence is lazy; protocols that need a contiguous
    /// reply marshal directly out of their emit callback.
    pub async fn readdir(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        cookie: u64,
        verifier: u64,
        attr_mask: AttrMask,
        flags: ReaddirFlags,
        emit: impl FnMut(&DirEntry<'_>) -> bool + Send + 'static,
    ) -> VfsResult<ReaddirResult> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Readdir(ReaddirOp {
                    cookie,
                    verifier,
                    attr_mask: attr_mask | AttrMask::FH,
                    flags,
                    emit: Some(Box::new(emit)),
                    out_cookie: 0,
                    out_verifier: 0,
                    out_eof: false,
                    out_dir_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Readdir);
        if op.out_dir_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(handle.fh(), handle.fh_hash(), &op.out_dir_attrs);
        }
        Ok(ReaddirResult {
            cookie: op.out_cookie,
            verifier: op.out_verifier,
            eof: op.out_eof,
            dir_attrs: op.out_dir_attrs,
        })
    }
}
