//! The backend module contract.
//!
//! A backend exposes a magic byte, a capability bitmask and a single
//! [`VfsModule::dispatch`] entry point that branches on the request
//! opcode. The backend fulfills a request by populating the payload's
//! output fields and calling [`crate::request::Request::complete`].

use bitflags::bitflags;

use crate::error::VfsResult;
use crate::request::Request;

bitflags! {
    /// Backend-declared properties consulted by the core to choose fast
    /// paths.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        /// The module requires open handles for path operations (mkdir,
        /// remove, open-at, ...), like POSIX `O_PATH`. When absent, the
        /// core fabricates synthetic handles that carry only the file
        /// handle, without an open callout, so stateless protocols such
        /// as NFS3 pay no open/close round trip.
        const OPEN_PATH_REQUIRED = 1 << 0;
        /// The module requires open handles for file operations and for
        /// setattr on directories. See [`Capabilities::OPEN_PATH_REQUIRED`].
        const OPEN_FILE_REQUIRED = 1 << 1;
        /// `dispatch` blocks. Requests are run on the delegation pool
        /// instead of the network threads. Non-blocking dispatch is
        /// preferred where feasible.
        const BLOCKING = 1 << 2;
        /// The module supports creating nameless objects
        /// (create-unlinked), used primarily for S3 PUT staging.
        const CREATE_UNLINKED = 1 << 3;
    }
}

bitflags! {
    /// Flags passed to the backend `Open`/`OpenAt` operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Create the target if it does not exist.
        const CREATE = 1 << 0;
        /// Path-flavored open; no data plane access is intended.
        const PATH = 1 << 1;
        /// The core fabricated this open on behalf of a path operation.
        const INFERRED = 1 << 2;
        /// The target must be a directory.
        const DIRECTORY = 1 << 3;
        /// Read-only data access.
        const READ_ONLY = 1 << 4;
        /// The backend must observe an exclusive open (truncate-on-open,
        /// `O_EXCL` creation).
        const EXCLUSIVE = 1 << 5;
    }
}

bitflags! {
    /// Flags for the `Readdir` operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReaddirFlags: u32 {
        /// Emit the `.` and `..` entries.
        const EMIT_DOT = 1 << 0;
    }
}

/// Data-plane access mode of an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read and write access.
    ReadWrite,
    /// Read-only access.
    ReadOnly,
}

/// A pluggable storage backend.
///
/// Modules are registered with the core before any traffic flows and are
/// polymorphic over exactly this surface; opcode routing inside
/// `dispatch` is a match on the request payload with one arm per
/// supported operation.
pub trait VfsModule: Send + Sync {
    /// Short name used in share definitions and logs.
    fn name(&self) -> &'static str;

    /// Unique magic byte. Every file handle returned by the module must
    /// start with this byte; it can never change once assigned.
    fn magic(&self) -> u8;

    /// Capability bitmask.
    fn capabilities(&self) -> Capabilities;

    /// Called once at registration with the module's opaque
    /// `config_data` string.
    fn init(&self, _config_data: &str) -> VfsResult<()> {
        Ok(())
    }

    /// Called once when the core shuts down.
    fn shutdown(&self) {}

    /// Called on each delegation worker before it processes requests.
    fn worker_init(&self) {}

    /// Called on each delegation worker as it exits.
    fn worker_shutdown(&self) {}

    /// Dispatches one request. Non-blocking modules must return quickly
    /// and complete the request asynchronously; blocking modules run on
    /// a delegation worker and may complete inline.
    fn dispatch(&self, request: Request);
}
