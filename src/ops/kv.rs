//! Key-value surface.
//!
//! Some backends expose a flat metadata index next to the filesystem
//! namespace (bucket listings, object metadata). Keys and values are
//! opaque byte strings; `search_keys` yields a lazy, key-ordered
//! sequence over an inclusive range. The `anchor` handle names the
//! mount whose index is addressed; any handle owned by the module
//! works, typically the mount root.

use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::ops::expect_payload;
use crate::request::{
    DeleteKeyOp, GetKeyOp, OpPayload, PutKeyOp, SearchKeysOp,
};
use crate::vfs::Vfs;

impl Vfs {
    /// Stores `value` under `key`, overwriting any previous value.
    pub async fn put_key(
        &self,
        cred: &Cred,
        anchor: &Fh,
        key: &[u8],
        value: &[u8],
    ) -> VfsResult<()> {
        let state = self
            .run_request_fh(
                cred,
                *anchor,
                OpPayload::PutKey(PutKeyOp {
                    key: key.to_vec(),
                    value: value.to_vec(),
                }),
            )
            .await?;
        state.status
    }

    /// Fetches the value stored under `key`; [`VfsError::NoEnt`] when
    /// absent.
    pub async fn get_key(
        &self,
        cred: &Cred,
        anchor: &Fh,
        key: &[u8],
    ) -> VfsResult<Vec<u8>> {
        let state = self
            .run_request_fh(
                cred,
                *anchor,
                OpPayload::GetKey(GetKeyOp {
                    key: key.to_vec(),
                    out_value: None,
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, GetKey);
        op.out_value.ok_or(VfsError::NoEnt)
    }

    /// Deletes `key`; [`VfsError::NoEnt`] when absent.
    pub async fn delete_key(
        &self,
        cred: &Cred,
        anchor: &Fh,
        key: &[u8],
    ) -> VfsResult<()> {
        let state = self
            .run_request_fh(
                cred,
                *anchor,
                OpPayload::DeleteKey(DeleteKeyOp { key: key.to_vec() }),
            )
            .await?;
        state.status
    }

    /// Scans keys in `start..=end` in key order, invoking `emit` per
    /// pair until exhaustion or until `emit` reports the consumer full.
    pub async fn search_keys(
        &self,
        cred: &Cred,
        anchor: &Fh,
        start: &[u8],
        end: &[u8],
        emit: impl FnMut(&[u8], &[u8]) -> bool + Send + 'static,
    ) -> VfsResult<()> {
        let state = self
            .run_request_fh(
                cred,
                *anchor,
                OpPayload::SearchKeys(SearchKeysOp {
                    start_key: start.to_vec(),
                    end_key: end.to_vec(),
                    emit: Some(Box::new(emit)),
                }),
            )
            .await?;
        state.status
    }
}
