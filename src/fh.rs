//! Opaque file handles.
//!
//! A file handle is at most [`FH_SIZE`] bytes. Byte 0 is the magic of the
//! owning backend module, bytes 1..17 are the mount id (a 128-bit hash of
//! the mount identity) and the remainder is backend-private. Consumers
//! must treat everything after byte 0 as opaque. Handles are immutable;
//! a backend may derive new handles but never rewrites one in place.

use std::fmt;
use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::xxh3_64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{VfsError, VfsResult};

/// Maximum number of bytes in a file handle.
pub const FH_SIZE: usize = 64;

/// Number of bytes in a mount id.
pub const MOUNT_ID_SIZE: usize = 16;

/// Maximum backend-private suffix length.
pub const FH_SUFFIX_MAX: usize = FH_SIZE - 1 - MOUNT_ID_SIZE;

/// Module magic of the root pseudo-filesystem.
pub const ROOT_MAGIC: u8 = 0;

/// Wire layout of the routable handle prefix.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FhPrefix {
    /// Backend module magic.
    pub magic: u8,
    /// Mount id, a 128-bit hash of the mount identity.
    pub mount_id: [u8; MOUNT_ID_SIZE],
}

/// An opaque file handle of 0..=64 bytes.
///
/// The zero-length handle is the *anonymous* handle used for single
/// operations against unlinked backend objects.
#[derive(Clone, Copy)]
pub struct Fh {
    len: u8,
    bytes: [u8; FH_SIZE],
}

impl Fh {
    /// Builds a handle from raw bytes. Fails with
    /// [`VfsError::BadHandle`] when the input exceeds [`FH_SIZE`].
    pub fn from_slice(raw: &[u8]) -> VfsResult<Self> {
        if raw.len() > FH_SIZE {
            return Err(VfsError::BadHandle);
        }
        let mut bytes = [0u8; FH_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Fh {
            len: raw.len() as u8,
            bytes,
        })
    }

    /// The zero-length anonymous handle.
    pub fn anonymous() -> Self {
        Fh {
            len: 0,
            bytes: [0u8; FH_SIZE],
        }
    }

    /// The root pseudo-filesystem handle: the single byte `0x00`.
    pub fn root() -> Self {
        let mut bytes = [0u8; FH_SIZE];
        bytes[0] = ROOT_MAGIC;
        Fh { len: 1, bytes }
    }

    /// The handle's bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the zero-length anonymous handle.
    pub fn is_anonymous(&self) -> bool {
        self.len == 0
    }

    /// Module magic, byte 0. Anonymous handles have no magic.
    pub fn magic(&self) -> Option<u8> {
        if self.len == 0 { None } else { Some(self.bytes[0]) }
    }

    /// The routable prefix, present when the handle is long enough to
    /// carry a mount id.
    pub fn prefix(&self) -> Option<&FhPrefix> {
        FhPrefix::ref_from_bytes(self.as_bytes().get(..1 + MOUNT_ID_SIZE)?).ok()
    }

    /// The mount id carried in bytes 1..17.
    pub fn mount_id(&self) -> Option<[u8; MOUNT_ID_SIZE]> {
        self.prefix().map(|p| p.mount_id)
    }

    /// Backend-private bytes after the mount id.
    pub fn suffix(&self) -> &[u8] {
        let start = (1 + MOUNT_ID_SIZE).min(self.len as usize);
        &self.bytes[start..self.len as usize]
    }

    /// 64-bit hash of the handle bytes.
    pub fn hash(&self) -> u64 {
        xxh3_64(self.as_bytes())
    }

    /// Composes a child handle as `self || fragment`, used by backends
    /// that encode handles under their parent (for example a remote-NFS
    /// module carrying a server index plus remote handle).
    pub fn extend(&self, fragment: &[u8]) -> VfsResult<Self> {
        let total = self.len as usize + fragment.len();
        if total > FH_SIZE {
            return Err(VfsError::BadHandle);
        }
        let mut out = *self;
        out.bytes[self.len as usize..total].copy_from_slice(fragment);
        out.len = total as u8;
        Ok(out)
    }
}

impl Default for Fh {
    fn default() -> Self {
        Fh::anonymous()
    }
}

impl PartialEq for Fh {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Fh {}

impl Hash for Fh {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(self.as_bytes());
    }
}

impl fmt::Debug for Fh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fh(")?;
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}
