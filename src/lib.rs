//! Virtual filesystem core for a multi-protocol NAS server.
//!
//! Every protocol frontend (NFS3, SMB2/3, S3) talks to storage through
//! this crate: an asynchronous request-dispatch engine that routes
//! operations to pluggable backend modules by the magic byte of the
//! target file handle. Around the dispatcher sit the pieces that make a
//! NAS server fast and correct under concurrency:
//!
//! - an open-handle cache that collapses concurrent opens of the same
//!   object into one backend open and defers closes ([`OpenHandle`]);
//! - TTL-bounded attribute and name caches with write-through
//!   invalidation on every mutating operation;
//! - a delegation pool that runs blocking backends off the network
//!   tasks;
//! - a generic path resolver that walks multi-mount namespaces and
//!   follows symlinks safely ([`Vfs::lookup_path`]);
//! - a parallel find engine built entirely on the operation surface
//!   ([`Vfs::find`]).
//!
//! Backends implement [`VfsModule`]; protocols call the async operation
//! methods on [`Vfs`] and must release every acquired handle exactly
//! once. Wire parsing, authentication and the backends themselves live
//! in their own crates.

#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

mod attr;
mod attr_cache;
mod config;
mod cred;
mod delegation;
mod error;
mod fh;
mod find;
mod module;
mod mount_table;
mod name_cache;
mod open_cache;
mod ops;
mod path;
mod request;
mod rootfs;
mod vfs;

pub use crate::attr::{
    AttrMask, Attrs, SYNTHETIC_FS_BYTES, SYNTHETIC_FS_INODES, TIME_NOW_NSEC,
    TimeSpec,
};
pub use crate::config::{ModuleConfig, VfsConfig};
pub use crate::cred::Cred;
pub use crate::error::{VfsError, VfsResult};
pub use crate::fh::{FH_SIZE, FH_SUFFIX_MAX, Fh, FhPrefix, MOUNT_ID_SIZE, ROOT_MAGIC};
pub use crate::find::{FindEmit, FindFilter};
pub use crate::module::{
    AccessMode, Capabilities, OpenFlags, ReaddirFlags, VfsModule,
};
pub use crate::mount_table::{Mount, MountAttrs, MountId};
pub use crate::open_cache::{HandleFlavor, OpenHandle};
pub use crate::ops::{
    CommitResult, CreateResult, LinkResult, ReadResult, ReaddirResult,
    RemoveResult, RenameResult, SeekResult, WriteResult,
};
pub use crate::path::{LookupFlags, SYMLOOP_MAX};
pub use crate::request::{
    CloseOp, CommitOp, CreateUnlinkedOp, DeleteKeyOp, DirEntry, GetKeyOp,
    GetattrOp, LinkOp, LookupOp, MkdirOp, MknodOp, MountOp, MountOptions,
    MountPrivate, Opcode, OpPayload, OpenAtOp, OpenOp, PutKeyOp, ReadOp,
    ReaddirEmit, ReaddirOp, ReadlinkOp, RemoveOp, RenameOp, Request,
    RequestState, SearchKeysEmit, SearchKeysOp, SeekOp, SeekWhence,
    SetattrOp, SymlinkOp, UmountOp, WriteOp,
};
pub use crate::vfs::{Vfs, VfsBuilder};

/// Maximum length of a single name component.
pub const NAME_MAX: usize = 255;

/// Maximum length of a path handed to the resolver.
pub const PATH_MAX: usize = 4096;
