//! VFS error taxonomy.
//!
//! Every backend failure is expressed as a [`VfsError`] before it reaches a
//! protocol handler. Errors are enum values, never strings; the protocol
//! layers own the mapping onto their wire representations, but a libc errno
//! mapping is provided here since all three protocols need one.

use std::fmt;

/// Result alias used throughout the crate.
pub type VfsResult<T> = Result<T, VfsError>;

/// Error kinds surfaced by VFS operations.
///
/// The set is the union of what NFS3, SMB2 and S3 can express once their
/// protocol-specific codes are normalized, which is why it is close to but
/// not identical with POSIX errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VfsError {
    /// Caller is neither privileged nor the owner of the target.
    Perm,
    /// No such file or directory.
    NoEnt,
    /// Hard I/O error while processing the operation.
    Io,
    /// No such device or address.
    NxIo,
    /// Permission denied by access checks (contrast with [`VfsError::Perm`]).
    Access,
    /// Target already exists.
    Exist,
    /// Attempted a cross-device hard link.
    XDev,
    /// A non-directory was supplied where a directory was required.
    NotDir,
    /// A directory was supplied where a non-directory was required.
    IsDir,
    /// Invalid or unsupported argument.
    Inval,
    /// Operation would grow a file beyond the backend's limit.
    FBig,
    /// No space left on the backing store.
    NoSpc,
    /// Modifying operation on a read-only filesystem.
    RoFs,
    /// Too many hard links.
    MLink,
    /// Name exceeds the backend's limit.
    NameTooLong,
    /// Directory is not empty.
    NotEmpty,
    /// Quota exhausted.
    DQuot,
    /// The file referred to by a handle no longer exists.
    Stale,
    /// File handle failed internal consistency checks.
    BadHandle,
    /// Update synchronization mismatch during a guarded setattr.
    NotSync,
    /// Directory cookie is no longer valid for the current verifier.
    BadCookie,
    /// Operation is not supported by the backend.
    NotSupp,
    /// A caller-provided buffer or limit is too small.
    TooSmall,
    /// Internal server failure that maps to nothing more specific.
    ServerFault,
    /// Attempt to create an object of a type the backend does not support.
    BadType,
    /// Backend started the request but cannot finish it promptly; retry.
    Delay,
    /// Per-process or per-server file limit reached.
    MaxFiles,
    /// Too many levels of symbolic links.
    Loop,
}

impl VfsError {
    /// Maps this error onto the closest libc errno value.
    pub fn to_errno(self) -> i32 {
        match self {
            VfsError::Perm => libc::EPERM,
            VfsError::NoEnt => libc::ENOENT,
            VfsError::Io => libc::EIO,
            VfsError::NxIo => libc::ENXIO,
            VfsError::Access => libc::EACCES,
            VfsError::Exist => libc::EEXIST,
            VfsError::XDev => libc::EXDEV,
            VfsError::NotDir => libc::ENOTDIR,
            VfsError::IsDir => libc::EISDIR,
            VfsError::Inval => libc::EINVAL,
            VfsError::FBig => libc::EFBIG,
            VfsError::NoSpc => libc::ENOSPC,
            VfsError::RoFs => libc::EROFS,
            VfsError::MLink => libc::EMLINK,
            VfsError::NameTooLong => libc::ENAMETOOLONG,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::DQuot => libc::EDQUOT,
            VfsError::Stale => libc::ESTALE,
            VfsError::BadHandle => libc::EBADF,
            VfsError::NotSync => libc::EINVAL,
            VfsError::BadCookie => libc::EINVAL,
            VfsError::NotSupp => libc::EOPNOTSUPP,
            VfsError::TooSmall => libc::EINVAL,
            VfsError::ServerFault => libc::EIO,
            VfsError::BadType => libc::EINVAL,
            VfsError::Delay => libc::EAGAIN,
            VfsError::MaxFiles => libc::EMFILE,
            VfsError::Loop => libc::ELOOP,
        }
    }

    /// Builds an error from an errno value, typically out of a syscall-backed
    /// module. Unrecognized values degrade to [`VfsError::Io`].
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM => VfsError::Perm,
            libc::ENOENT => VfsError::NoEnt,
            libc::EIO => VfsError::Io,
            libc::ENXIO => VfsError::NxIo,
            libc::EACCES => VfsError::Access,
            libc::EEXIST => VfsError::Exist,
            libc::EXDEV => VfsError::XDev,
            libc::ENOTDIR => VfsError::NotDir,
            libc::EISDIR => VfsError::IsDir,
            libc::EINVAL => VfsError::Inval,
            libc::EFBIG => VfsError::FBig,
            libc::ENOSPC => VfsError::NoSpc,
            libc::EROFS => VfsError::RoFs,
            libc::EMLINK => VfsError::MLink,
            libc::ENAMETOOLONG => VfsError::NameTooLong,
            libc::ENOTEMPTY => VfsError::NotEmpty,
            libc::EDQUOT => VfsError::DQuot,
            libc::ESTALE => VfsError::Stale,
            libc::EBADF => VfsError::BadHandle,
            libc::EOPNOTSUPP => VfsError::NotSupp,
            libc::EAGAIN => VfsError::Delay,
            libc::EMFILE | libc::ENFILE => VfsError::MaxFiles,
            libc::ELOOP => VfsError::Loop,
            _ => VfsError::Io,
        }
    }
}

impl fmt::Display for VfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for VfsError {}
