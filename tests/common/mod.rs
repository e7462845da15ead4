//! Shared test harness: an in-memory backend module plus setup helpers.
//!
//! `MemFs` implements the full backend contract over a per-mount node
//! tree and key-value index. Its capabilities are chosen per test, so
//! one implementation covers the stateless (synthetic-handle), stateful
//! (open/close counting) and blocking (delegation) variants. Opens can
//! be held pending to probe the handle cache's dedup and FIFO paths.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use talus::{
    AttrMask, Attrs, Capabilities, Cred, DirEntry, Fh, MountId, OpPayload,
    OpenFlags, ReaddirFlags, Request, SeekWhence, TimeSpec, Vfs, VfsConfig,
    VfsError, VfsModule, VfsResult, MOUNT_ID_SIZE,
};

const FIRST_ENTRY_COOKIE: u64 = 10;

struct Node {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    rdev: u64,
    atime: TimeSpec,
    mtime: TimeSpec,
    ctime: TimeSpec,
    data: Vec<u8>,
    children: Option<BTreeMap<String, u64>>,
    target: Option<String>,
}

impl Node {
    fn new_dir(mode: u32) -> Self {
        Node {
            mode: libc::S_IFDIR as u32 | (mode & 0o7777),
            uid: 0,
            gid: 0,
            nlink: 2,
            rdev: 0,
            atime: TimeSpec::now(),
            mtime: TimeSpec::now(),
            ctime: TimeSpec::now(),
            data: Vec::new(),
            children: Some(BTreeMap::new()),
            target: None,
        }
    }

    fn new_file(mode: u32) -> Self {
        Node {
            mode: libc::S_IFREG as u32 | (mode & 0o7777),
            uid: 0,
            gid: 0,
            nlink: 1,
            rdev: 0,
            atime: TimeSpec::now(),
            mtime: TimeSpec::now(),
            ctime: TimeSpec::now(),
            data: Vec::new(),
            children: None,
            target: None,
        }
    }

    fn new_symlink(target: &str) -> Self {
        let mut node = Node::new_file(0o777);
        node.mode = libc::S_IFLNK as u32 | 0o777;
        node.target = Some(target.to_string());
        node
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

struct Volume {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    kv: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Volume {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(1, Node::new_dir(0o755));
        Volume {
            nodes,
            next_ino: 2,
            kv: BTreeMap::new(),
        }
    }

    fn alloc(&mut self, node: Node) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        ino
    }
}

/// In-memory backend used by the integration tests.
pub struct MemFs {
    magic: u8,
    caps: Capabilities,
    volumes: Mutex<HashMap<[u8; MOUNT_ID_SIZE], Volume>>,
    next_private: AtomicU64,
    /// Backend `Open`/`OpenAt` dispatches observed.
    pub opens: AtomicU64,
    /// Backend `Close` dispatches observed.
    pub closes: AtomicU64,
    /// Backend `Getattr` dispatches observed.
    pub getattrs: AtomicU64,
    /// Backend `Lookup` dispatches observed.
    pub lookups: AtomicU64,
    hold_opens: AtomicBool,
    held: Mutex<Vec<Request>>,
    closed: Mutex<Vec<u64>>,
    dispatch_delay: Mutex<Option<Duration>>,
    drop_requests: AtomicBool,
}

impl MemFs {
    pub fn new(magic: u8, caps: Capabilities) -> Arc<Self> {
        Arc::new(MemFs {
            magic,
            caps,
            volumes: Mutex::new(HashMap::new()),
            next_private: AtomicU64::new(1),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            getattrs: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
            hold_opens: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            dispatch_delay: Mutex::new(None),
            drop_requests: AtomicBool::new(false),
        })
    }

    /// A fully stateful variant: explicit opens for both flavors.
    pub fn stateful(magic: u8) -> Arc<Self> {
        Self::new(
            magic,
            Capabilities::OPEN_PATH_REQUIRED
                | Capabilities::OPEN_FILE_REQUIRED
                | Capabilities::CREATE_UNLINKED,
        )
    }

    /// A stateless variant: the core fabricates synthetic handles.
    pub fn stateless(magic: u8) -> Arc<Self> {
        Self::new(magic, Capabilities::CREATE_UNLINKED)
    }

    /// A blocking variant that sleeps in dispatch, exercising the
    /// delegation pool.
    pub fn blocking(magic: u8, delay: Duration) -> Arc<Self> {
        let fs = Self::new(magic, Capabilities::BLOCKING);
        *fs.dispatch_delay.lock() = Some(delay);
        fs
    }

    /// Holds subsequent `Open` dispatches pending until
    /// [`MemFs::release_held`].
    pub fn hold_opens(&self, hold: bool) {
        self.hold_opens.store(hold, Ordering::SeqCst);
    }

    /// Number of opens currently held pending.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    /// Completes every held open successfully.
    pub fn release_held(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        for mut request in held {
            let private = self.next_private.fetch_add(1, Ordering::SeqCst);
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let OpPayload::Open(op) = &mut request.payload {
                op.out_private = private;
            }
            request.complete(Ok(()));
        }
    }

    /// Backend privates retired by `Close` so far.
    pub fn closed_privates(&self) -> Vec<u64> {
        self.closed.lock().clone()
    }

    /// Makes the module drop requests without completing them, to
    /// exercise the completion drop guard.
    pub fn drop_requests(&self, drop: bool) {
        self.drop_requests.store(drop, Ordering::SeqCst);
    }

    fn ino_of(fh: &Fh) -> VfsResult<u64> {
        let suffix = fh.suffix();
        if suffix.len() != 8 {
            return Err(VfsError::BadHandle);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(suffix);
        Ok(u64::from_be_bytes(bytes))
    }

    fn fh_for(&self, mount_id: &[u8; MOUNT_ID_SIZE], ino: u64) -> Fh {
        Fh::from_slice(&[self.magic])
            .unwrap()
            .extend(mount_id)
            .unwrap()
            .extend(&ino.to_be_bytes())
            .unwrap()
    }

    fn mount_id_of(fh: &Fh) -> VfsResult<[u8; MOUNT_ID_SIZE]> {
        fh.mount_id().ok_or(VfsError::BadHandle)
    }

    fn fill_attrs(
        &self,
        mount_id: &[u8; MOUNT_ID_SIZE],
        ino: u64,
        node: &Node,
        attrs: &mut Attrs,
    ) {
        attrs.set_mask = AttrMask::STAT | AttrMask::STATFS;
        attrs.dev = self.magic as u64;
        attrs.ino = ino;
        attrs.mode = node.mode;
        attrs.nlink = node.nlink;
        attrs.uid = node.uid;
        attrs.gid = node.gid;
        attrs.rdev = node.rdev;
        attrs.size = if node.is_dir() {
            4096
        } else {
            node.data.len() as u64
        };
        attrs.space_used = attrs.size;
        attrs.atime = node.atime;
        attrs.mtime = node.mtime;
        attrs.ctime = node.ctime;
        attrs.fs_space_total = talus::SYNTHETIC_FS_BYTES;
        attrs.fs_space_free = talus::SYNTHETIC_FS_BYTES;
        attrs.fs_space_avail = talus::SYNTHETIC_FS_BYTES;
        attrs.fs_files_total = talus::SYNTHETIC_FS_INODES;
        attrs.fs_files_free = talus::SYNTHETIC_FS_INODES;
        attrs.fs_files_avail = talus::SYNTHETIC_FS_INODES;
        attrs.fsid = u64::from_be_bytes(mount_id[..8].try_into().unwrap());
        attrs.set_fh(self.fh_for(mount_id, ino));
    }

    fn apply_set(node: &mut Node, set: &Attrs) {
        let now = TimeSpec::now();
        if set.set_mask.contains(AttrMask::MODE) {
            let type_bits = if node.mode & libc::S_IFMT as u32 != 0 {
                node.mode & libc::S_IFMT as u32
            } else {
                set.mode & libc::S_IFMT as u32
            };
            node.mode = type_bits | (set.mode & 0o7777);
        }
        if set.set_mask.contains(AttrMask::UID) {
            node.uid = set.uid;
        }
        if set.set_mask.contains(AttrMask::GID) {
            node.gid = set.gid;
        }
        if set.set_mask.contains(AttrMask::SIZE) {
            node.data.resize(set.size as usize, 0);
        }
        if set.set_mask.contains(AttrMask::RDEV) {
            node.rdev = set.rdev;
        }
        if set.set_mask.contains(AttrMask::ATIME) {
            node.atime = set.atime.resolve(now);
        }
        if set.set_mask.contains(AttrMask::MTIME) {
            node.mtime = set.mtime.resolve(now);
        }
        node.ctime = now;
    }

    fn serve(&self, request: &mut Request) -> VfsResult<()> {
        let fh = request.fh;
        match &mut request.payload {
            OpPayload::Mount(op) => {
                let id = MountId::from_path(&op.mount_path).0;
                self.volumes.lock().entry(id).or_insert_with(Volume::new);
                op.out_root_fragment = 1u64.to_be_bytes().to_vec();
                let volumes = self.volumes.lock();
                let volume = volumes.get(&id).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&id, 1, volume.nodes.get(&1).unwrap(), &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::Umount(op) => {
                let id = MountId::from_path(&op.mount_path).0;
                self.volumes.lock().remove(&id);
                Ok(())
            }
            OpPayload::Lookup(op) => {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;
                let child_ino =
                    *children.get(&op.name).ok_or(VfsError::NoEnt)?;
                let child = volume.nodes.get(&child_ino).ok_or(VfsError::Stale)?;
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, child_ino, child, &mut attrs);
                op.out_attrs = attrs;
                let mut dir_attrs = std::mem::take(&mut op.out_dir_attrs);
                self.fill_attrs(&mount_id, ino, parent, &mut dir_attrs);
                op.out_dir_attrs = dir_attrs;
                Ok(())
            }
            OpPayload::Getattr(op) => {
                self.getattrs.fetch_add(1, Ordering::SeqCst);
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::Setattr(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get_mut(&ino).ok_or(VfsError::Stale)?;
                let mut pre = std::mem::take(&mut op.out_pre_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut pre);
                op.out_pre_attrs = pre;
                let set = op.set.clone();
                let node = volume.nodes.get_mut(&ino).unwrap();
                Self::apply_set(node, &set);
                let node = volume.nodes.get(&ino).unwrap();
                let mut post = std::mem::take(&mut op.out_post_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut post);
                op.out_post_attrs = post;
                Ok(())
            }
            OpPayload::Readdir(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let dir = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    dir.children.as_ref().ok_or(VfsError::NotDir)?;
                // A directory holding the marker entry fails iteration,
                // for subtree-error tests.
                if children.contains_key(".fail") {
                    return Err(VfsError::Io);
                }
                let mut emit = op.emit.take().ok_or(VfsError::Inval)?;
                let mut cookie = op.cookie;
                let mut eof = true;

                if op.flags.contains(ReaddirFlags::EMIT_DOT) && cookie < 2 {
                    let mut self_attrs =
                        Attrs::request(op.attr_mask);
                    self.fill_attrs(&mount_id, ino, dir, &mut self_attrs);
                    for (dot, c) in [(".", 1u64), ("..", 2u64)] {
                        if cookie >= c {
                            continue;
                        }
                        if !emit(&DirEntry {
                            ino,
                            cookie: c,
                            name: dot,
                            attrs: &self_attrs,
                        }) {
                            eof = false;
                            break;
                        }
                        cookie = c;
                    }
                }

                if eof {
                    for (index, (name, child_ino)) in
                        children.iter().enumerate()
                    {
                        let entry_cookie = FIRST_ENTRY_COOKIE + index as u64;
                        if cookie >= entry_cookie {
                            continue;
                        }
                        let child = volume
                            .nodes
                            .get(child_ino)
                            .ok_or(VfsError::Stale)?;
                        let mut attrs = Attrs::request(op.attr_mask);
                        self.fill_attrs(&mount_id, *child_ino, child, &mut attrs);
                        if !emit(&DirEntry {
                            ino: *child_ino,
                            cookie: entry_cookie,
                            name,
                            attrs: &attrs,
                        }) {
                            eof = false;
                            break;
                        }
                        cookie = entry_cookie;
                    }
                }

                op.out_cookie = cookie;
                op.out_verifier = 1;
                op.out_eof = eof;
                let mut dir_attrs = std::mem::take(&mut op.out_dir_attrs);
                self.fill_attrs(&mount_id, ino, dir, &mut dir_attrs);
                op.out_dir_attrs = dir_attrs;
                Ok(())
            }
            OpPayload::Readlink(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let target = node.target.as_ref().ok_or(VfsError::Inval)?;
                if target.len() > op.max_length as usize {
                    return Err(VfsError::TooSmall);
                }
                op.out_target = target.clone();
                Ok(())
            }
            OpPayload::Open(op) => {
                // Validate the target exists before granting the open.
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                self.opens.fetch_add(1, Ordering::SeqCst);
                op.out_private =
                    self.next_private.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            OpPayload::OpenAt(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;

                let child_ino = match children.get(&op.name) {
                    Some(existing) => {
                        if op.flags.contains(OpenFlags::EXCLUSIVE) {
                            return Err(VfsError::Exist);
                        }
                        *existing
                    }
                    None => {
                        if !op.flags.contains(OpenFlags::CREATE) {
                            return Err(VfsError::NoEnt);
                        }
                        let mode = if op.set.set_mask.contains(AttrMask::MODE)
                        {
                            op.set.mode
                        } else {
                            0o644
                        };
                        let mut node = Node::new_file(mode);
                        Self::apply_set(&mut node, &op.set);
                        let new_ino = volume.alloc(node);
                        let parent =
                            volume.nodes.get_mut(&ino).unwrap();
                        parent
                            .children
                            .as_mut()
                            .unwrap()
                            .insert(op.name.clone(), new_ino);
                        parent.mtime = TimeSpec::now();
                        new_ino
                    }
                };

                self.opens.fetch_add(1, Ordering::SeqCst);
                op.out_private =
                    self.next_private.fetch_add(1, Ordering::SeqCst);
                let child = volume.nodes.get(&child_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, child_ino, child, &mut attrs);
                op.out_attrs = attrs;
                let parent = volume.nodes.get(&ino).unwrap();
                let mut post = std::mem::take(&mut op.out_dir_post_attrs);
                self.fill_attrs(&mount_id, ino, parent, &mut post);
                op.out_dir_post_attrs = post;
                Ok(())
            }
            OpPayload::Close(op) => {
                self.closes.fetch_add(1, Ordering::SeqCst);
                self.closed.lock().push(op.private);
                Ok(())
            }
            OpPayload::Read(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                if node.is_dir() {
                    return Err(VfsError::IsDir);
                }
                let start = (op.offset as usize).min(node.data.len());
                let end =
                    (start + op.length as usize).min(node.data.len());
                op.out_data.push(node.data[start..end].to_vec());
                op.out_length = (end - start) as u32;
                op.out_eof = end == node.data.len();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::Write(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                if node.is_dir() {
                    return Err(VfsError::IsDir);
                }
                let mut pre = std::mem::take(&mut op.out_pre_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut pre);
                op.out_pre_attrs = pre;

                let node = volume.nodes.get_mut(&ino).unwrap();
                let mut offset = op.offset as usize;
                let mut written = 0u32;
                for segment in &op.data {
                    let end = offset + segment.len();
                    if node.data.len() < end {
                        node.data.resize(end, 0);
                    }
                    node.data[offset..end].copy_from_slice(segment);
                    offset = end;
                    written += segment.len() as u32;
                }
                node.mtime = TimeSpec::now();
                node.ctime = node.mtime;
                op.out_length = written;
                op.out_sync = op.sync;
                let node = volume.nodes.get(&ino).unwrap();
                let mut post = std::mem::take(&mut op.out_post_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut post);
                op.out_post_attrs = post;
                Ok(())
            }
            OpPayload::Commit(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let mut post = std::mem::take(&mut op.out_post_attrs);
                self.fill_attrs(&mount_id, ino, node, &mut post);
                op.out_post_attrs = post;
                Ok(())
            }
            OpPayload::Remove(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;
                let child_ino =
                    *children.get(&op.name).ok_or(VfsError::NoEnt)?;
                let child = volume.nodes.get(&child_ino).ok_or(VfsError::Stale)?;
                if let Some(grandchildren) = &child.children {
                    if !grandchildren.is_empty() {
                        return Err(VfsError::NotEmpty);
                    }
                }
                let mut removed = std::mem::take(&mut op.out_removed_attrs);
                self.fill_attrs(&mount_id, child_ino, child, &mut removed);
                op.out_removed_attrs = removed;

                let parent = volume.nodes.get_mut(&ino).unwrap();
                parent.children.as_mut().unwrap().remove(&op.name);
                parent.mtime = TimeSpec::now();
                let child = volume.nodes.get_mut(&child_ino).unwrap();
                child.nlink = child.nlink.saturating_sub(1);
                if child.nlink == 0 || child.is_dir() {
                    volume.nodes.remove(&child_ino);
                }
                let parent = volume.nodes.get(&ino).unwrap();
                let mut post = std::mem::take(&mut op.out_dir_post_attrs);
                self.fill_attrs(&mount_id, ino, parent, &mut post);
                op.out_dir_post_attrs = post;
                Ok(())
            }
            OpPayload::Mkdir(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;
                if children.contains_key(&op.name) {
                    return Err(VfsError::Exist);
                }
                let mode = if op.set.set_mask.contains(AttrMask::MODE) {
                    op.set.mode
                } else {
                    0o755
                };
                let mut node = Node::new_dir(mode);
                Self::apply_set(&mut node, &op.set);
                node.mode = libc::S_IFDIR as u32 | (node.mode & 0o7777);
                let new_ino = volume.alloc(node);
                let parent = volume.nodes.get_mut(&ino).unwrap();
                parent
                    .children
                    .as_mut()
                    .unwrap()
                    .insert(op.name.clone(), new_ino);
                parent.nlink += 1;
                parent.mtime = TimeSpec::now();

                let child = volume.nodes.get(&new_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, new_ino, child, &mut attrs);
                op.out_attrs = attrs;
                let parent = volume.nodes.get(&ino).unwrap();
                let mut post = std::mem::take(&mut op.out_dir_post_attrs);
                self.fill_attrs(&mount_id, ino, parent, &mut post);
                op.out_dir_post_attrs = post;
                Ok(())
            }
            OpPayload::Mknod(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;
                if children.contains_key(&op.name) {
                    return Err(VfsError::Exist);
                }
                let mut node = Node::new_file(op.set.mode & 0o7777);
                node.mode = op.set.mode;
                Self::apply_set(&mut node, &op.set);
                node.mode = op.set.mode;
                let new_ino = volume.alloc(node);
                let parent = volume.nodes.get_mut(&ino).unwrap();
                parent
                    .children
                    .as_mut()
                    .unwrap()
                    .insert(op.name.clone(), new_ino);
                let child = volume.nodes.get(&new_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, new_ino, child, &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::Symlink(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let parent = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                let children =
                    parent.children.as_ref().ok_or(VfsError::NotDir)?;
                if children.contains_key(&op.name) {
                    return Err(VfsError::Exist);
                }
                let new_ino = volume.alloc(Node::new_symlink(&op.target));
                let parent = volume.nodes.get_mut(&ino).unwrap();
                parent
                    .children
                    .as_mut()
                    .unwrap()
                    .insert(op.name.clone(), new_ino);
                parent.mtime = TimeSpec::now();
                let child = volume.nodes.get(&new_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, new_ino, child, &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::Rename(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let from_ino = Self::ino_of(&fh)?;
                let to_ino = Self::ino_of(&op.new_dir_fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;

                let from = volume.nodes.get(&from_ino).ok_or(VfsError::Stale)?;
                let moved_ino = *from
                    .children
                    .as_ref()
                    .ok_or(VfsError::NotDir)?
                    .get(&op.name)
                    .ok_or(VfsError::NoEnt)?;
                volume
                    .nodes
                    .get(&to_ino)
                    .ok_or(VfsError::Stale)?
                    .children
                    .as_ref()
                    .ok_or(VfsError::NotDir)?;

                let from = volume.nodes.get_mut(&from_ino).unwrap();
                from.children.as_mut().unwrap().remove(&op.name);
                from.mtime = TimeSpec::now();
                let to = volume.nodes.get_mut(&to_ino).unwrap();
                let displaced = to
                    .children
                    .as_mut()
                    .unwrap()
                    .insert(op.new_name.clone(), moved_ino);
                to.mtime = TimeSpec::now();
                if let Some(displaced) = displaced {
                    if displaced != moved_ino {
                        let dead = volume.nodes.get_mut(&displaced).unwrap();
                        dead.nlink = dead.nlink.saturating_sub(1);
                        if dead.nlink == 0 {
                            volume.nodes.remove(&displaced);
                        }
                    }
                }

                let from = volume.nodes.get(&from_ino).unwrap();
                let mut post = std::mem::take(&mut op.out_fromdir_post_attrs);
                self.fill_attrs(&mount_id, from_ino, from, &mut post);
                op.out_fromdir_post_attrs = post;
                let to = volume.nodes.get(&to_ino).unwrap();
                let mut post = std::mem::take(&mut op.out_todir_post_attrs);
                self.fill_attrs(&mount_id, to_ino, to, &mut post);
                op.out_todir_post_attrs = post;
                Ok(())
            }
            OpPayload::Link(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let source_ino = Self::ino_of(&fh)?;
                let dir_ino = Self::ino_of(&op.dir_fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                volume.nodes.get(&source_ino).ok_or(VfsError::Stale)?;
                let dir = volume.nodes.get(&dir_ino).ok_or(VfsError::Stale)?;
                let children =
                    dir.children.as_ref().ok_or(VfsError::NotDir)?;
                if children.contains_key(&op.name) && !op.replace {
                    return Err(VfsError::Exist);
                }
                let dir = volume.nodes.get_mut(&dir_ino).unwrap();
                let displaced = dir
                    .children
                    .as_mut()
                    .unwrap()
                    .insert(op.name.clone(), source_ino);
                dir.mtime = TimeSpec::now();
                if let Some(displaced) = displaced {
                    if displaced != source_ino {
                        let mut replaced =
                            std::mem::take(&mut op.out_replaced_attrs);
                        let dead = volume.nodes.get(&displaced).unwrap();
                        self.fill_attrs(&mount_id, displaced, dead, &mut replaced);
                        op.out_replaced_attrs = replaced;
                        let dead = volume.nodes.get_mut(&displaced).unwrap();
                        dead.nlink = dead.nlink.saturating_sub(1);
                        if dead.nlink == 0 {
                            volume.nodes.remove(&displaced);
                        }
                    }
                }
                let source = volume.nodes.get_mut(&source_ino).unwrap();
                source.nlink += 1;
                source.ctime = TimeSpec::now();
                let source = volume.nodes.get(&source_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, source_ino, source, &mut attrs);
                op.out_attrs = attrs;
                let dir = volume.nodes.get(&dir_ino).unwrap();
                let mut post = std::mem::take(&mut op.out_dir_post_attrs);
                self.fill_attrs(&mount_id, dir_ino, dir, &mut post);
                op.out_dir_post_attrs = post;
                Ok(())
            }
            OpPayload::CreateUnlinked(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                let mode = if op.set.set_mask.contains(AttrMask::MODE) {
                    op.set.mode
                } else {
                    0o600
                };
                let mut node = Node::new_file(mode);
                Self::apply_set(&mut node, &op.set);
                node.nlink = 0;
                let new_ino = volume.alloc(node);
                self.opens.fetch_add(1, Ordering::SeqCst);
                op.out_private =
                    self.next_private.fetch_add(1, Ordering::SeqCst);
                let node = volume.nodes.get(&new_ino).unwrap();
                let mut attrs = std::mem::take(&mut op.out_attrs);
                self.fill_attrs(&mount_id, new_ino, node, &mut attrs);
                op.out_attrs = attrs;
                Ok(())
            }
            OpPayload::PutKey(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                volume.kv.insert(op.key.clone(), op.value.clone());
                Ok(())
            }
            OpPayload::GetKey(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                op.out_value = volume.kv.get(&op.key).cloned();
                Ok(())
            }
            OpPayload::DeleteKey(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let mut volumes = self.volumes.lock();
                let volume =
                    volumes.get_mut(&mount_id).ok_or(VfsError::Stale)?;
                if volume.kv.remove(&op.key).is_none() {
                    return Err(VfsError::NoEnt);
                }
                Ok(())
            }
            OpPayload::Seek(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let ino = Self::ino_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let node = volume.nodes.get(&ino).ok_or(VfsError::Stale)?;
                if node.is_dir() {
                    return Err(VfsError::IsDir);
                }
                let size = node.data.len() as u64;
                if op.offset >= size {
                    op.out_offset = size;
                    op.out_eof = true;
                } else {
                    // Dense files: data everywhere, the only hole is at
                    // end of file.
                    op.out_offset = match op.whence {
                        SeekWhence::Data => op.offset,
                        SeekWhence::Hole => size,
                    };
                    op.out_eof = false;
                }
                Ok(())
            }
            OpPayload::SearchKeys(op) => {
                let mount_id = Self::mount_id_of(&fh)?;
                let volumes = self.volumes.lock();
                let volume = volumes.get(&mount_id).ok_or(VfsError::Stale)?;
                let mut emit = op.emit.take().ok_or(VfsError::Inval)?;
                let range = op.start_key.clone()..=op.end_key.clone();
                for (key, value) in volume.kv.range(range) {
                    if !emit(key, value) {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

impl VfsModule for MemFs {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn magic(&self) -> u8 {
        self.magic
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn dispatch(&self, mut request: Request) {
        if self.drop_requests.load(Ordering::SeqCst) {
            drop(request);
            return;
        }
        if let Some(delay) = *self.dispatch_delay.lock() {
            std::thread::sleep(delay);
        }
        if self.hold_opens.load(Ordering::SeqCst)
            && matches!(request.payload, OpPayload::Open(_))
        {
            self.held.lock().push(request);
            return;
        }
        let status = self.serve(&mut request);
        request.complete(status);
    }
}

/// Builds a running core with the given cache TTL and modules.
pub fn new_vfs(cache_ttl: u64, modules: &[Arc<MemFs>]) -> Arc<Vfs> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = VfsConfig {
        cache_ttl,
        delegation_threads: 2,
        ..Default::default()
    };
    let mut builder = Vfs::builder(config);
    for module in modules {
        builder = builder.register(module.clone());
    }
    builder.start().expect("vfs start")
}

/// Builds a core with an explicit delegation pool size.
pub fn new_vfs_with_delegation(
    cache_ttl: u64,
    delegation_threads: usize,
    modules: &[Arc<MemFs>],
) -> Arc<Vfs> {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = VfsConfig {
        cache_ttl,
        delegation_threads,
        ..Default::default()
    };
    let mut builder = Vfs::builder(config);
    for module in modules {
        builder = builder.register(module.clone());
    }
    builder.start().expect("vfs start")
}

/// Mounts `module` at `path` and returns the mount root handle.
pub async fn mount(vfs: &Arc<Vfs>, module: &Arc<MemFs>, path: &str) -> Fh {
    vfs.mount(&Cred::root(), module.magic(), path, Vec::new())
        .await
        .expect("mount")
}

/// Attribute bundle setting only a mode, for create operations.
pub fn mode_set(mode: u32) -> Attrs {
    let mut set = Attrs::default();
    set.mode = mode;
    set.set_mask = AttrMask::MODE;
    set
}

/// Creates a regular file at `path` and returns its handle.
pub async fn create_file(vfs: &Arc<Vfs>, path: &str) -> Fh {
    vfs.create_path(
        &Cred::root(),
        &vfs.root_fh(),
        path,
        mode_set(0o644),
        AttrMask::STAT,
    )
    .await
    .expect("create_path")
    .fh
}
