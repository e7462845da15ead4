//! Lookup and readlink.

use std::sync::Arc;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::open_cache::OpenHandle;
use crate::ops::expect_payload;
use crate::request::{LookupOp, OpPayload, ReadlinkOp};
use crate::vfs::Vfs;
use crate::{NAME_MAX, PATH_MAX};

impl Vfs {
    /// Resolves `name` under the directory `parent`. The child's file
    /// handle is always included in the returned attributes. Successful
    /// resolutions populate the name cache; a hit there short-circuits
    /// the backend and refreshes attributes through the attribute cache.
    pub async fn lookup(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        mask: AttrMask,
    ) -> VfsResult<Attrs> {
        if name.len() > NAME_MAX {
            return Err(VfsError::NameTooLong);
        }

        if let Some(child_fh) = self.name_cache.lookup(parent.fh(), name) {
            match self.getattr_fh(cred, &child_fh, mask).await {
                Ok(mut attrs) => {
                    attrs.set_fh(child_fh);
                    return Ok(attrs);
                }
                Err(_) => {
                    // The cached child is gone or unreachable; drop the
                    // entry and ask the backend.
                    self.name_cache.invalidate(parent.fh(), name);
                }
            }
        }

        let state = self
            .run_request(
                parent.module().clone(),
                cred,
                *parent.fh(),
                OpPayload::Lookup(LookupOp {
                    name: name.to_string(),
                    out_attrs: Attrs::request(
                        mask | AttrMask::FH | AttrMask::CACHEABLE,
                    ),
                    out_dir_attrs: Attrs::request(AttrMask::CACHEABLE),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Lookup);
        if !op.out_attrs.set_mask.contains(AttrMask::FH) {
            return Err(VfsError::ServerFault);
        }
        let child_fh = op.out_attrs.fh;
        self.name_cache.insert(parent.fh(), name, child_fh);
        self.attr_cache
            .insert(&child_fh, child_fh.hash(), &op.out_attrs);
        if op.out_dir_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache
                .insert(parent.fh(), parent.fh_hash(), &op.out_dir_attrs);
        }
        Ok(op.out_attrs)
    }

    /// Reads a symbolic link's target.
    pub async fn readlink(
        &self,
        cred: &Cred,
        handle: &Arc<OpenHandle>,
        max_length: u32,
    ) -> VfsResult<String> {
        let state = self
            .run_request(
                handle.module().clone(),
                cred,
                *handle.fh(),
                OpPayload::Readlink(ReadlinkOp {
                    max_length: max_length.min(PATH_MAX as u32),
                    out_target: String::new(),
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Readlink);
        Ok(op.out_target)
    }
}
