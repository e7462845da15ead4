//! Data-plane operations: read, write, commit.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::VfsResult;
use crate::open_cache::OpenHandle;
use crate::ops::expect_payload;
use crate::request::{CommitOp, OpPayload, ReadOp, SeekOp, SeekWhence, WriteOp};
use crate::vfs::Vfs;

/// Result of [`Vfs::read`].
#[derive(Debug)]
pub struct ReadResult {
    /// Scatter list of data segments.
    pub data: SmallVec<[Vec<u8>; 2]>,
    /// Bytes read.
    pub length: u32,
    /// True when the read reached end of file.
    pub eof: bool,
    /// Post-read attributes.
    pub attrs: Attrs,
}

/// Result of [`Vfs::write`].
#[derive(Debug)]
pub struct WriteResult {
    /// Bytes written.
    pub length: u32,
    /// True when the data reached stable storage.
    pub sync: bool,
    /// Pre-operation attributes.
    pub pre_attrs: Attrs,
    /// Post-operation attributes.
    pub post_attrs: Attrs,
}

/// Result of [`Vfs::commit`].
#[derive(Debug)]
pub struct CommitResult {
    /// Pre-operation attributes.
    pub pre_attrs: Attrs,
    /// Post-operation attributes.
    pub post_attrs: Attrs,
}

/// Result of [`Vfs::seek`].
#[derive(Debug, Clone, Copy)]
pub struct SeekResult {
    /// Offset of the located region.
    pub offset: u64,
    /// True when no such region exists before end of file.
    pub eof: bool,
}

impl Vfs {
    /// Reads up to `length` bytes at `offset`.
    pub async fn read(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        offset: u64,
        length: u32,
    ) -> VfsResult<ReadResult> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Read(ReadOp {
                    offset,
                    length,
                    attr_mask: AttrMask::CACHEABLE,
                    out_data: SmallVec::new(),
                    out_length: 0,
                    out_eof: false,
                    out_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Read);
        if op.out_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(handle.fh(), handle.fh_hash(), &op.out_attrs);
        }
        Ok(ReadResult {
            data: op.out_data,
            length: op.out_length,
            eof: op.out_eof,
            attrs: op.out_attrs,
        })
    }

    /// Writes the gathered `data` at `offset`. With `sync`, the backend
    /// must not complete until the bytes are stable.
    pub async fn write(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        offset: u64,
        sync: bool,
        data: SmallVec<[Vec<u8>; 2]>,
    ) -> VfsResult<WriteResult> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Write(WriteOp {
                    offset,
                    sync,
                    data,
                    out_length: 0,
                    out_sync: false,
                    out_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        self.attr_cache.invalidate(handle.fh(), handle.fh_hash());
        state.status?;
        let op = expect_payload!(state, Write);
        if op.out_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(handle.fh(), handle.fh_hash(), &op.out_post_attrs);
        }
        Ok(WriteResult {
            length: op.out_length,
            sync: op.out_sync,
            pre_attrs: op.out_pre_attrs,
            post_attrs: op.out_post_attrs,
        })
    }

    /// Flushes previously written data to stable storage; `length` 0
    /// covers to end of file.
    pub async fn commit(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        offset: u64,
        length: u64,
    ) -> VfsResult<CommitResult> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Commit(CommitOp {
                    offset,
                    length,
                    out_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Commit);
        if op.out_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(handle.fh(), handle.fh_hash(), &op.out_post_attrs);
        }
        Ok(CommitResult {
            pre_attrs: op.out_pre_attrs,
            post_attrs: op.out_post_attrs,
        })
    }

    /// Finds the next data or hole region at or after `offset`, for
    /// sparse-file aware protocols.
    pub async fn seek(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        offset: u64,
        whence: SeekWhence,
    ) -> VfsResult<SeekResult> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Seek(SeekOp {
                    offset,
                    whence,
                    out_offset: 0,
                    out_eof: false,
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Seek);
        Ok(SeekResult {
            offset: op.out_offset,
            eof: op.out_eof,
        })
    }
}
