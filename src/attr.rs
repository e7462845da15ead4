//! File attribute bundles and the request/set mask protocol.
//!
//! An [`Attrs`] bundle is the single currency of all metadata flow between
//! the core, the backends and the protocols. Requesters populate
//! `req_mask` with the union of the fields they need; backends populate
//! `set_mask` with the union they actually filled in. Nothing outside
//! `set_mask` may be read.

use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::fh::Fh;

bitflags! {
    /// Bitmask selecting fields of an [`Attrs`] bundle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AttrMask: u64 {
        /// Device id of the containing filesystem.
        const DEV = 1 << 0;
        /// Inode number.
        const INUM = 1 << 1;
        /// File mode including type bits.
        const MODE = 1 << 2;
        /// Hard link count.
        const NLINK = 1 << 3;
        /// Owner uid.
        const UID = 1 << 4;
        /// Owner gid.
        const GID = 1 << 5;
        /// Device number for special files.
        const RDEV = 1 << 6;
        /// Size in bytes.
        const SIZE = 1 << 7;
        /// Last access time.
        const ATIME = 1 << 8;
        /// Last modification time.
        const MTIME = 1 << 9;
        /// Last status change time.
        const CTIME = 1 << 10;
        /// Bytes actually consumed on the backing store.
        const SPACE_USED = 1 << 11;
        /// Filesystem bytes available to the caller.
        const SPACE_AVAIL = 1 << 12;
        /// Filesystem bytes free.
        const SPACE_FREE = 1 << 13;
        /// Filesystem bytes total.
        const SPACE_TOTAL = 1 << 14;
        /// Filesystem inode total.
        const FILES_TOTAL = 1 << 15;
        /// Filesystem inodes free.
        const FILES_FREE = 1 << 16;
        /// Filesystem inodes available to the caller.
        const FILES_AVAIL = 1 << 17;
        /// The file handle itself.
        const FH = 1 << 18;
        /// Pre/post attribute pair was captured atomically with the mutation.
        const ATOMIC = 1 << 19;
        /// Filesystem id.
        const FSID = 1 << 20;

        /// The POSIX `stat` subset.
        const STAT = Self::DEV.bits()
            | Self::INUM.bits()
            | Self::MODE.bits()
            | Self::NLINK.bits()
            | Self::UID.bits()
            | Self::GID.bits()
            | Self::RDEV.bits()
            | Self::SIZE.bits()
            | Self::SPACE_USED.bits()
            | Self::ATIME.bits()
            | Self::MTIME.bits()
            | Self::CTIME.bits();

        /// The `statvfs` subset.
        const STATFS = Self::SPACE_AVAIL.bits()
            | Self::SPACE_FREE.bits()
            | Self::SPACE_TOTAL.bits()
            | Self::FILES_TOTAL.bits()
            | Self::FILES_FREE.bits()
            | Self::FILES_AVAIL.bits()
            | Self::FSID.bits();

        /// Fields the attribute cache is allowed to serve. Filesystem
        /// statistics and the FH bit never satisfy a cache hit.
        const CACHEABLE = Self::STAT.bits();
    }
}

/// Sentinel nanosecond value meaning "the server picks the timestamp".
pub const TIME_NOW_NSEC: u32 = (1 << 30) - 3;

/// Nanosecond-precision timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TimeSpec {
    /// Seconds since the Unix epoch, negative for earlier times.
    pub sec: i64,
    /// Nanosecond remainder, or [`TIME_NOW_NSEC`].
    pub nsec: u32,
}

impl TimeSpec {
    /// The current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => TimeSpec {
                sec: d.as_secs() as i64,
                nsec: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                TimeSpec {
                    sec: -(d.as_secs() as i64),
                    nsec: d.subsec_nanos(),
                }
            }
        }
    }

    /// A timestamp whose nanoseconds carry the "server decides" sentinel.
    pub fn server_now() -> Self {
        TimeSpec {
            sec: 0,
            nsec: TIME_NOW_NSEC,
        }
    }

    /// True when the backend should substitute its own clock.
    pub fn is_server_now(&self) -> bool {
        self.nsec == TIME_NOW_NSEC
    }

    /// Resolves the sentinel against the given clock value.
    pub fn resolve(self, now: TimeSpec) -> TimeSpec {
        if self.is_server_now() { now } else { self }
    }
}

/// Synthetic filesystem byte total reported by backends that do not track
/// real statvfs numbers.
pub const SYNTHETIC_FS_BYTES: u64 = 100 * 1024 * 1024 * 1024;

/// Synthetic filesystem inode total, see [`SYNTHETIC_FS_BYTES`].
pub const SYNTHETIC_FS_INODES: u64 = 1024 * 1024;

/// Attribute bundle: the union of POSIX `stat`, filesystem statistics and
/// the object's file handle, gated by `req_mask`/`set_mask`.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
    /// Fields the requester wants populated.
    pub req_mask: AttrMask,
    /// Fields the backend actually populated.
    pub set_mask: AttrMask,

    /// Device id of the containing filesystem.
    pub dev: u64,
    /// Inode number.
    pub ino: u64,
    /// Mode bits including the `S_IFMT` type.
    pub mode: u32,
    /// Hard link count.
    pub nlink: u32,
    /// Owner uid.
    pub uid: u32,
    /// Owner gid.
    pub gid: u32,
    /// Device number for block/char specials.
    pub rdev: u64,
    /// Size in bytes.
    pub size: u64,
    /// Bytes consumed on the backing store.
    pub space_used: u64,
    /// Last access time.
    pub atime: TimeSpec,
    /// Last modification time.
    pub mtime: TimeSpec,
    /// Last status change time.
    pub ctime: TimeSpec,

    /// Filesystem bytes available to the caller.
    pub fs_space_avail: u64,
    /// Filesystem bytes free.
    pub fs_space_free: u64,
    /// Filesystem bytes total.
    pub fs_space_total: u64,
    /// Filesystem inode total.
    pub fs_files_total: u64,
    /// Filesystem inodes free.
    pub fs_files_free: u64,
    /// Filesystem inodes available to the caller.
    pub fs_files_avail: u64,
    /// Filesystem id.
    pub fsid: u64,

    /// The object's file handle, valid when `set_mask` contains
    /// [`AttrMask::FH`].
    pub fh: Fh,
    /// Precomputed 64-bit hash of `fh`.
    pub fh_hash: u64,
}

impl Attrs {
    /// An empty bundle requesting the given fields.
    pub fn request(mask: AttrMask) -> Self {
        Attrs {
            req_mask: mask,
            ..Default::default()
        }
    }

    /// Records the file handle and flags it as populated.
    pub fn set_fh(&mut self, fh: Fh) {
        self.fh_hash = fh.hash();
        self.fh = fh;
        self.set_mask |= AttrMask::FH;
    }

    /// True when the populated mode bits describe a directory.
    pub fn is_dir(&self) -> bool {
        self.set_mask.contains(AttrMask::MODE)
            && self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// True when the populated mode bits describe a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.set_mask.contains(AttrMask::MODE)
            && self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    /// True when every requested field was populated.
    pub fn satisfies(&self, mask: AttrMask) -> bool {
        self.set_mask.contains(mask)
    }
}
