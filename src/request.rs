//! In-flight request representation.
//!
//! A [`Request`] owns everything a backend needs to service one
//! operation: the caller's credential, the target file handle, the
//! opcode-specific payload with both input and output fields, a scratch
//! page and three token slots for the backend's private use, and the
//! completion channel that hands the finished request back to the
//! originating task.
//!
//! Completion is exactly-once by construction: [`Request::complete`]
//! consumes the request, and a request dropped without completing is
//! answered with [`VfsError::ServerFault`] by the drop guard, which also
//! logs the violation. There is no way to complete twice.

use std::any::Any;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::error;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::module::{OpenFlags, ReaddirFlags, VfsModule};

/// Operation codes, one per payload variant.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u32)]
pub enum Opcode {
    /// Mount a backend share.
    Mount = 1,
    /// Unmount a backend share.
    Umount,
    /// Resolve a name within a directory.
    Lookup,
    /// Fetch attributes.
    Getattr,
    /// Iterate directory entries.
    Readdir,
    /// Read a symbolic link target.
    Readlink,
    /// Open by file handle.
    Open,
    /// Open or create by parent handle and name.
    OpenAt,
    /// Close a backend open.
    Close,
    /// Read file data.
    Read,
    /// Write file data.
    Write,
    /// Remove a directory entry.
    Remove,
    /// Create a directory.
    Mkdir,
    /// Flush previous writes to stable storage.
    Commit,
    /// Create a symbolic link.
    Symlink,
    /// Rename a directory entry.
    Rename,
    /// Mutate attributes.
    Setattr,
    /// Create a hard link.
    Link,
    /// Create a nameless object.
    CreateUnlinked,
    /// Create a special node.
    Mknod,
    /// Store a key-value pair.
    PutKey,
    /// Fetch a value by key.
    GetKey,
    /// Delete a key.
    DeleteKey,
    /// Scan an inclusive key range in order.
    SearchKeys,
    /// Find the next hole or data region in a file.
    Seek,
}

/// Mount options as ordered key/value pairs; a `None` value marks a bare
/// flag.
pub type MountOptions = Vec<(String, Option<String>)>;

/// Opaque per-mount state a backend returns from `Mount` and receives
/// back at `Umount`.
pub type MountPrivate = Arc<dyn Any + Send + Sync>;

/// One directory entry handed to a readdir emit callback.
#[derive(Debug)]
pub struct DirEntry<'a> {
    /// Inode number.
    pub ino: u64,
    /// Cookie that resumes iteration *after* this entry.
    pub cookie: u64,
    /// Entry name.
    pub name: &'a str,
    /// Entry attributes, populated per the request's attribute mask.
    pub attrs: &'a Attrs,
}

/// Per-entry readdir callback. Returns `false` when the consumer is
/// full, which stops the iteration at the current cookie.
pub type ReaddirEmit = Box<dyn FnMut(&DirEntry<'_>) -> bool + Send>;

/// Per-pair key-scan callback; same stop contract as [`ReaddirEmit`].
pub type SearchKeysEmit = Box<dyn FnMut(&[u8], &[u8]) -> bool + Send>;

/// `Mount` payload.
pub struct MountOp {
    /// Mount path within the server namespace.
    pub mount_path: String,
    /// Backend mount options.
    pub options: MountOptions,
    /// Backend-private root handle fragment, appended to the mount id.
    pub out_root_fragment: Vec<u8>,
    /// Attributes of the mount root.
    pub out_attrs: Attrs,
    /// Backend per-mount state.
    pub out_private: Option<MountPrivate>,
}

/// `Umount` payload.
pub struct UmountOp {
    /// Mount path being detached.
    pub mount_path: String,
    /// The state returned by the mount operation, if any.
    pub private: Option<MountPrivate>,
}

/// `Lookup` payload.
pub struct LookupOp {
    /// Name to resolve within the target directory.
    pub name: String,
    /// Child attributes; the file handle is always populated on success.
    pub out_attrs: Attrs,
    /// Post-operation directory attributes.
    pub out_dir_attrs: Attrs,
}

/// `Getattr` payload.
pub struct GetattrOp {
    /// Fetched attributes.
    pub out_attrs: Attrs,
}

/// `Setattr` payload.
pub struct SetattrOp {
    /// Attributes to apply; `set_mask` selects the fields.
    pub set: Attrs,
    /// Pre-operation attributes.
    pub out_pre_attrs: Attrs,
    /// Post-operation attributes.
    pub out_post_attrs: Attrs,
}

/// `Readdir` payload.
pub struct ReaddirOp {
    /// Resume cookie, 0 for the beginning.
    pub cookie: u64,
    /// Cookie verifier from the previous iteration, 0 initially.
    pub verifier: u64,
    /// Attribute mask for per-entry attributes.
    pub attr_mask: AttrMask,
    /// Iteration flags.
    pub flags: ReaddirFlags,
    /// Per-entry callback. Present on dispatch, taken by the backend.
    pub emit: Option<ReaddirEmit>,
    /// Cookie at which iteration stopped.
    pub out_cookie: u64,
    /// New verifier; a change invalidates prior cookies.
    pub out_verifier: u64,
    /// True when the directory was exhausted.
    pub out_eof: bool,
    /// Post-operation directory attributes.
    pub out_dir_attrs: Attrs,
}

/// `Readlink` payload.
pub struct ReadlinkOp {
    /// Upper bound the caller can accept.
    pub max_length: u32,
    /// Link target.
    pub out_target: String,
}

/// `Open` payload.
pub struct OpenOp {
    /// Open disposition.
    pub flags: OpenFlags,
    /// Backend-private open state, echoed on every data op and at close.
    pub out_private: u64,
}

/// `OpenAt` payload.
pub struct OpenAtOp {
    /// Name to open or create under the target directory.
    pub name: String,
    /// Open disposition.
    pub flags: OpenFlags,
    /// Initial attributes when creating.
    pub set: Attrs,
    /// Attributes of the opened object, file handle included.
    pub out_attrs: Attrs,
    /// Pre-operation directory attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation directory attributes.
    pub out_dir_post_attrs: Attrs,
    /// Backend-private open state.
    pub out_private: u64,
}

/// `Close` payload.
pub struct CloseOp {
    /// The open state being retired.
    pub private: u64,
}

/// `Read` payload.
pub struct ReadOp {
    /// Byte offset.
    pub offset: u64,
    /// Requested length.
    pub length: u32,
    /// Attribute mask for the post-read attributes.
    pub attr_mask: AttrMask,
    /// Scatter list of result segments.
    pub out_data: SmallVec<[Vec<u8>; 2]>,
    /// Bytes read.
    pub out_length: u32,
    /// True when the read reached end of file.
    pub out_eof: bool,
    /// Post-read attributes.
    pub out_attrs: Attrs,
}

/// `Write` payload.
pub struct WriteOp {
    /// Byte offset.
    pub offset: u64,
    /// True to require stable storage before completion.
    pub sync: bool,
    /// Gather list of input segments.
    pub data: SmallVec<[Vec<u8>; 2]>,
    /// Bytes written.
    pub out_length: u32,
    /// True when the data reached stable storage.
    pub out_sync: bool,
    /// Pre-operation attributes.
    pub out_pre_attrs: Attrs,
    /// Post-operation attributes.
    pub out_post_attrs: Attrs,
}

/// `Commit` payload.
pub struct CommitOp {
    /// Start of the committed range.
    pub offset: u64,
    /// Length of the committed range, 0 for the whole file.
    pub length: u64,
    /// Pre-operation attributes.
    pub out_pre_attrs: Attrs,
    /// Post-operation attributes.
    pub out_post_attrs: Attrs,
}

/// `Remove` payload.
pub struct RemoveOp {
    /// Entry name.
    pub name: String,
    /// Child handle when the caller already knows it, so caches can be
    /// invalidated even when the backend does not return the removed
    /// object's attributes.
    pub child_fh: Option<Fh>,
    /// Pre-operation directory attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation directory attributes.
    pub out_dir_post_attrs: Attrs,
    /// Attributes of the removed object.
    pub out_removed_attrs: Attrs,
}

/// `Mkdir` payload.
pub struct MkdirOp {
    /// New directory name.
    pub name: String,
    /// Initial attributes.
    pub set: Attrs,
    /// Attributes of the created directory.
    pub out_attrs: Attrs,
    /// Pre-operation parent attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation parent attributes.
    pub out_dir_post_attrs: Attrs,
}

/// `Mknod` payload; the node type and device live in `set`.
pub struct MknodOp {
    /// New node name.
    pub name: String,
    /// Initial attributes, including type bits and rdev.
    pub set: Attrs,
    /// Attributes of the created node.
    pub out_attrs: Attrs,
    /// Pre-operation parent attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation parent attributes.
    pub out_dir_post_attrs: Attrs,
}

/// `Symlink` payload.
pub struct SymlinkOp {
    /// New link name.
    pub name: String,
    /// Link target path.
    pub target: String,
    /// Initial attributes.
    pub set: Attrs,
    /// Attributes of the created link.
    pub out_attrs: Attrs,
    /// Pre-operation parent attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation parent attributes.
    pub out_dir_post_attrs: Attrs,
}

/// `Rename` payload; the request targets the source directory.
pub struct RenameOp {
    /// Source entry name.
    pub name: String,
    /// Destination directory handle.
    pub new_dir_fh: Fh,
    /// Destination entry name.
    pub new_name: String,
    /// Handle of the entry being replaced, when the caller knows it.
    pub target_fh: Option<Fh>,
    /// Pre-operation source directory attributes.
    pub out_fromdir_pre_attrs: Attrs,
    /// Post-operation source directory attributes.
    pub out_fromdir_post_attrs: Attrs,
    /// Pre-operation destination directory attributes.
    pub out_todir_pre_attrs: Attrs,
    /// Post-operation destination directory attributes.
    pub out_todir_post_attrs: Attrs,
}

/// `Link` payload; the request targets the existing object.
pub struct LinkOp {
    /// Directory receiving the new entry.
    pub dir_fh: Fh,
    /// New entry name.
    pub name: String,
    /// Replace an existing entry instead of failing with `Exist`.
    pub replace: bool,
    /// Attributes of the linked object.
    pub out_attrs: Attrs,
    /// Attributes of a replaced entry, when `replace` displaced one.
    pub out_replaced_attrs: Attrs,
    /// Pre-operation directory attributes.
    pub out_dir_pre_attrs: Attrs,
    /// Post-operation directory attributes.
    pub out_dir_post_attrs: Attrs,
}

/// `CreateUnlinked` payload.
pub struct CreateUnlinkedOp {
    /// Open disposition for the returned handle.
    pub flags: OpenFlags,
    /// Initial attributes.
    pub set: Attrs,
    /// Attributes of the created object, file handle included.
    pub out_attrs: Attrs,
    /// Backend-private open state.
    pub out_private: u64,
}

/// `PutKey` payload.
pub struct PutKeyOp {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes, stored opaquely.
    pub value: Vec<u8>,
}

/// `GetKey` payload.
pub struct GetKeyOp {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes, `None` when absent.
    pub out_value: Option<Vec<u8>>,
}

/// `DeleteKey` payload.
pub struct DeleteKeyOp {
    /// Key bytes.
    pub key: Vec<u8>,
}

/// What a `Seek` looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    /// The next region containing data at or after the offset.
    Data,
    /// The next hole at or after the offset.
    Hole,
}

/// `Seek` payload.
pub struct SeekOp {
    /// Starting byte offset.
    pub offset: u64,
    /// Region kind to look for.
    pub whence: SeekWhence,
    /// Resulting offset.
    pub out_offset: u64,
    /// True when the search ran off the end of the file.
    pub out_eof: bool,
}

/// `SearchKeys` payload.
pub struct SearchKeysOp {
    /// Inclusive range start.
    pub start_key: Vec<u8>,
    /// Inclusive range end.
    pub end_key: Vec<u8>,
    /// Per-pair callback, ordered by key. Present on dispatch, taken by
    /// the backend.
    pub emit: Option<SearchKeysEmit>,
}

/// Opcode-tagged request payload.
pub enum OpPayload {
    /// See [`MountOp`].
    Mount(MountOp),
    /// See [`UmountOp`].
    Umount(UmountOp),
    /// See [`LookupOp`].
    Lookup(LookupOp),
    /// See [`GetattrOp`].
    Getattr(GetattrOp),
    /// See [`SetattrOp`].
    Setattr(SetattrOp),
    /// See [`ReaddirOp`].
    Readdir(ReaddirOp),
    /// See [`ReadlinkOp`].
    Readlink(ReadlinkOp),
    /// See [`OpenOp`].
    Open(OpenOp),
    /// See [`OpenAtOp`].
    OpenAt(OpenAtOp),
    /// See [`CloseOp`].
    Close(CloseOp),
    /// See [`ReadOp`].
    Read(ReadOp),
    /// See [`WriteOp`].
    Write(WriteOp),
    /// See [`RemoveOp`].
    Remove(RemoveOp),
    /// See [`MkdirOp`].
    Mkdir(MkdirOp),
    /// See [`CommitOp`].
    Commit(CommitOp),
    /// See [`SymlinkOp`].
    Symlink(SymlinkOp),
    /// See [`RenameOp`].
    Rename(RenameOp),
    /// See [`LinkOp`].
    Link(LinkOp),
    /// See [`CreateUnlinkedOp`].
    CreateUnlinked(CreateUnlinkedOp),
    /// See [`MknodOp`].
    Mknod(MknodOp),
    /// See [`PutKeyOp`].
    PutKey(PutKeyOp),
    /// See [`GetKeyOp`].
    GetKey(GetKeyOp),
    /// See [`DeleteKeyOp`].
    DeleteKey(DeleteKeyOp),
    /// See [`SearchKeysOp`].
    SearchKeys(SearchKeysOp),
    /// See [`SeekOp`].
    Seek(SeekOp),
}

impl OpPayload {
    /// The opcode tagging this payload.
    pub fn opcode(&self) -> Opcode {
        match self {
            OpPayload::Mount(_) => Opcode::Mount,
            OpPayload::Umount(_) => Opcode::Umount,
            OpPayload::Lookup(_) => Opcode::Lookup,
            OpPayload::Getattr(_) => Opcode::Getattr,
            OpPayload::Setattr(_) => Opcode::Setattr,
            OpPayload::Readdir(_) => Opcode::Readdir,
            OpPayload::Readlink(_) => Opcode::Readlink,
            OpPayload::Open(_) => Opcode::Open,
            OpPayload::OpenAt(_) => Opcode::OpenAt,
            OpPayload::Close(_) => Opcode::Close,
            OpPayload::Read(_) => Opcode::Read,
            OpPayload::Write(_) => Opcode::Write,
            OpPayload::Remove(_) => Opcode::Remove,
            OpPayload::Mkdir(_) => Opcode::Mkdir,
            OpPayload::Commit(_) => Opcode::Commit,
            OpPayload::Symlink(_) => Opcode::Symlink,
            OpPayload::Rename(_) => Opcode::Rename,
            OpPayload::Link(_) => Opcode::Link,
            OpPayload::CreateUnlinked(_) => Opcode::CreateUnlinked,
            OpPayload::Mknod(_) => Opcode::Mknod,
            OpPayload::PutKey(_) => Opcode::PutKey,
            OpPayload::GetKey(_) => Opcode::GetKey,
            OpPayload::DeleteKey(_) => Opcode::DeleteKey,
            OpPayload::SearchKeys(_) => Opcode::SearchKeys,
            OpPayload::Seek(_) => Opcode::Seek,
        }
    }
}

/// Registry of in-flight requests, swept by the watchdog.
pub(crate) struct ActiveRegistry {
    next_id: AtomicU64,
    entries: DashMap<u64, ActiveEntry>,
}

/// Watchdog bookkeeping for one in-flight request.
pub(crate) struct ActiveEntry {
    pub(crate) opcode: Opcode,
    pub(crate) started: Instant,
}

impl ActiveRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ActiveRegistry {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        })
    }

    fn register(&self, opcode: Opcode) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            id,
            ActiveEntry {
                opcode,
                started: Instant::now(),
            },
        );
        id
    }

    fn deregister(&self, id: u64) {
        self.entries.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Visits every in-flight request.
    pub(crate) fn for_each(&self, mut f: impl FnMut(u64, &ActiveEntry)) {
        for entry in self.entries.iter() {
            f(*entry.key(), entry.value());
        }
    }
}

/// The state a request carries; backends reach it through the
/// [`Request`] wrapper, the core gets it back whole once completed.
pub struct RequestState {
    /// Caller credential.
    pub cred: Cred,
    /// Target file handle.
    pub fh: Fh,
    /// Precomputed hash of `fh`.
    pub fh_hash: u64,
    /// Opcode-specific payload.
    pub payload: OpPayload,
    /// Completion status, meaningful once the request came back.
    pub status: VfsResult<()>,
    /// One page of memory the backend may use as it likes.
    pub scratch: Box<[u8]>,
    /// Token slots for the backend's private use across suspension
    /// points (submission ids, continuation cookies).
    pub slots: [u64; 3],

    pub(crate) module: Arc<dyn VfsModule>,
    id: u64,
    started: Instant,
    elapsed: Duration,
    registry: Arc<ActiveRegistry>,
    done: Option<oneshot::Sender<Box<RequestState>>>,
}

impl RequestState {
    /// Time from dispatch to completion.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn send(mut self: Box<Self>) {
        self.elapsed = self.started.elapsed();
        self.registry.deregister(self.id);
        if let Some(tx) = self.done.take() {
            // The receiver may be gone if the caller went away.
            let _ = tx.send(self);
        }
    }
}

/// Completion future handed back to the dispatching task.
pub(crate) type CompletionRx = oneshot::Receiver<Box<RequestState>>;

/// An in-flight request owned by a backend module.
pub struct Request {
    state: Option<Box<RequestState>>,
}

impl Request {
    pub(crate) fn new(
        module: Arc<dyn VfsModule>,
        cred: Cred,
        fh: Fh,
        payload: OpPayload,
        registry: Arc<ActiveRegistry>,
    ) -> (Request, CompletionRx) {
        let (tx, rx) = oneshot::channel();
        let id = registry.register(payload.opcode());
        let fh_hash = fh.hash();
        let state = Box::new(RequestState {
            cred,
            fh,
            fh_hash,
            payload,
            status: Ok(()),
            scratch: vec![0u8; page_size::get()].into_boxed_slice(),
            slots: [0; 3],
            module,
            id,
            started: Instant::now(),
            elapsed: Duration::ZERO,
            registry,
            done: Some(tx),
        });
        (Request { state: Some(state) }, rx)
    }

    /// The opcode of this request.
    pub fn opcode(&self) -> Opcode {
        self.payload.opcode()
    }

    /// Finishes the request with the given status and hands it back to
    /// the core. Consuming `self` makes a second completion impossible.
    pub fn complete(mut self, status: VfsResult<()>) {
        let mut state = self.state.take().expect("request state present");
        state.status = status;
        state.send();
    }
}

impl Deref for Request {
    type Target = RequestState;

    fn deref(&self) -> &RequestState {
        self.state.as_ref().expect("request state present")
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut RequestState {
        self.state.as_mut().expect("request state present")
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            error!(
                "request {:?} dropped without completion, answering ServerFault",
                state.payload.opcode()
            );
            state.status = Err(VfsError::ServerFault);
            state.send();
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => f
                .debug_struct("Request")
                .field("opcode", &state.payload.opcode())
                .field("fh", &state.fh)
                .finish_non_exhaustive(),
            None => write!(f, "Request(completed)"),
        }
    }
}
