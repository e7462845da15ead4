//! The operation surface.
//!
//! Thin async wrappers around the dispatch engine, one per VFS
//! operation. Each follows the same shape: consult the caches, build
//! the opcode payload, dispatch, and on completion write the results
//! back through the caches before returning to the protocol.

mod attr;
mod dir;
mod io;
mod kv;
mod lookup;
mod open;
mod readdir;

pub use dir::{CreateResult, LinkResult, RemoveResult, RenameResult};
pub use io::{CommitResult, ReadResult, SeekResult, WriteResult};
pub use readdir::ReaddirResult;

/// Pulls the expected payload variant out of a completed request.
/// A mismatch means a backend rewrote the payload tag, which is an
/// internal fault, not a caller error.
macro_rules! expect_payload {
    ($state:expr, $variant:ident) => {
        match $state.payload {
            crate::request::OpPayload::$variant(op) => op,
            _ => return Err(crate::error::VfsError::ServerFault),
        }
    };
}

pub(crate) use expect_payload;
