//! The VFS core object.
//!
//! [`Vfs`] owns the module registry, the mount table, the open-handle,
//! attribute and name caches, and the delegation pool, and provides the
//! dispatch plumbing every operation goes through: route by the magic
//! byte of the target handle, run inline for non-blocking backends or on
//! the delegation pool for blocking ones, then hand the completed
//! request back to the submitting task.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::attr::{AttrMask, Attrs};
use crate::attr_cache::AttrCache;
use crate::config::VfsConfig;
use crate::cred::Cred;
use crate::delegation::DelegationPool;
use crate::error::{VfsError, VfsResult};
use crate::fh::{Fh, ROOT_MAGIC};
use crate::module::{Capabilities, VfsModule};
use crate::mount_table::{
    Mount, MountAttrs, MountId, MountTable, normalize_mount_path,
};
use crate::name_cache::NameCache;
use crate::open_cache::{CloseTicket, HandleFlavor, OpenCache, OpenHandle};
use crate::request::{
    ActiveRegistry, CloseOp, MountOp, MountOptions, OpPayload, Request,
    RequestState, UmountOp,
};
use crate::rootfs::RootFs;

/// Requests in flight longer than this are reported by the watchdog.
const WATCHDOG_THRESHOLD: Duration = Duration::from_secs(10);

/// Watchdog sweep period.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// Close-queue depth between the reaper and the close task.
const CLOSE_QUEUE_DEPTH: usize = 1024;

/// How long shutdown waits for in-flight requests to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builder for a [`Vfs`] instance. Backends register here; registration
/// is closed once the core starts.
pub struct VfsBuilder {
    config: VfsConfig,
    modules: Vec<Arc<dyn VfsModule>>,
}

impl VfsBuilder {
    /// Registers a backend module, keyed by its magic byte.
    pub fn register(mut self, module: Arc<dyn VfsModule>) -> Self {
        self.modules.push(module);
        self
    }

    /// Initializes the registered modules, spawns the delegation pool
    /// and the background tasks, and returns the running core.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self) -> VfsResult<Arc<Vfs>> {
        let config = self.config;
        info!(
            "vfs starting: core_threads={} delegation_threads={} cache_ttl={}s max_fds={} (advisory)",
            config.core_threads, config.delegation_threads, config.cache_ttl, config.max_fds
        );

        let mount_table = MountTable::new();
        let rootfs: Arc<dyn VfsModule> = RootFs::new(mount_table.clone());

        let mut slots: Vec<Option<Arc<dyn VfsModule>>> = vec![None; 256];
        slots[ROOT_MAGIC as usize] = Some(rootfs);
        for module in &self.modules {
            let magic = module.magic();
            if magic == ROOT_MAGIC {
                error!("module {} claims reserved magic 0", module.name());
                return Err(VfsError::Inval);
            }
            if slots[magic as usize].is_some() {
                error!("duplicate module magic {magic}");
                return Err(VfsError::Inval);
            }
            let config_data = config
                .modules
                .iter()
                .find(|m| m.module_name == module.name())
                .map(|m| m.config_data.as_str())
                .unwrap_or("");
            module.init(config_data)?;
            slots[magic as usize] = Some(module.clone());
        }

        let ttl = config.cache_ttl();
        let delegation =
            DelegationPool::new(config.delegation_threads, self.modules.clone());
        let (close_tx, close_rx) = mpsc::channel(CLOSE_QUEUE_DEPTH);

        let vfs = Arc::new(Vfs {
            config,
            modules: slots.into_boxed_slice(),
            mount_table,
            open_path_cache: OpenCache::new(HandleFlavor::Path),
            open_file_cache: OpenCache::new(HandleFlavor::File),
            attr_cache: AttrCache::new(ttl),
            name_cache: NameCache::new(ttl),
            delegation,
            active: ActiveRegistry::new(),
            close_tx: Mutex::new(Some(close_tx)),
            tasks: Mutex::new(Vec::new()),
            close_task: Mutex::new(None),
        });

        vfs.spawn_background(close_rx);
        Ok(vfs)
    }
}

/// The VFS core. One per process; shared by every protocol frontend.
pub struct Vfs {
    pub(crate) config: VfsConfig,
    modules: Box<[Option<Arc<dyn VfsModule>>]>,
    pub(crate) mount_table: Arc<MountTable>,
    pub(crate) open_path_cache: OpenCache,
    pub(crate) open_file_cache: OpenCache,
    pub(crate) attr_cache: AttrCache,
    pub(crate) name_cache: NameCache,
    delegation: DelegationPool,
    pub(crate) active: Arc<ActiveRegistry>,
    close_tx: Mutex<Option<mpsc::Sender<CloseTicket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_task: Mutex<Option<JoinHandle<()>>>,
}

impl Vfs {
    /// Starts building a core with the given configuration.
    pub fn builder(config: VfsConfig) -> VfsBuilder {
        VfsBuilder {
            config,
            modules: Vec::new(),
        }
    }

    /// The file handle of the namespace root: the virtual union of all
    /// mounts.
    pub fn root_fh(&self) -> Fh {
        Fh::root()
    }

    /// Resolves the backend module owning a handle via its magic byte.
    pub(crate) fn module_for(&self, fh: &Fh) -> VfsResult<Arc<dyn VfsModule>> {
        let magic = fh.magic().ok_or(VfsError::BadHandle)?;
        self.modules[magic as usize]
            .clone()
            .ok_or(VfsError::BadHandle)
    }

    /// Builds a request for `module`, dispatches it inline or through
    /// the delegation pool, and waits for completion. The status still
    /// sits in the returned state; callers decide how to combine it with
    /// partial outputs.
    pub(crate) async fn run_request(
        &self,
        module: Arc<dyn VfsModule>,
        cred: &Cred,
        fh: Fh,
        payload: OpPayload,
    ) -> VfsResult<Box<RequestState>> {
        let (request, completion) = Request::new(
            module.clone(),
            cred.clone(),
            fh,
            payload,
            self.active.clone(),
        );
        let opcode = request.opcode();
        if module.capabilities().contains(Capabilities::BLOCKING) {
            self.delegation.submit(request).await;
        } else {
            module.dispatch(request);
        }
        match completion.await {
            Ok(state) => {
                debug!(
                    "{} {:?} completed in {:?}: {:?}",
                    module.name(),
                    opcode,
                    state.elapsed(),
                    state.status
                );
                Ok(state)
            }
            // The drop guard always sends, so this only fires if the
            // runtime tore the channel down underneath us.
            Err(_) => Err(VfsError::ServerFault),
        }
    }

    /// Same, with the module derived from the handle's magic byte.
    pub(crate) async fn run_request_fh(
        &self,
        cred: &Cred,
        fh: Fh,
        payload: OpPayload,
    ) -> VfsResult<Box<RequestState>> {
        let module = self.module_for(&fh)?;
        self.run_request(module, cred, fh, payload).await
    }

    /// Attaches a share served by the module registered under `magic`.
    /// Returns the mount's root file handle.
    pub async fn mount(
        &self,
        cred: &Cred,
        magic: u8,
        mount_path: &str,
        options: MountOptions,
    ) -> VfsResult<Fh> {
        if magic == ROOT_MAGIC {
            return Err(VfsError::Inval);
        }
        let module = self.modules[magic as usize]
            .clone()
            .ok_or(VfsError::Inval)?;
        let path = normalize_mount_path(mount_path);
        if path.is_empty() {
            return Err(VfsError::Inval);
        }
        if self.mount_table.by_path(&path).is_some() {
            return Err(VfsError::Exist);
        }
        let id = MountId::from_path(&path);

        let state = self
            .run_request(
                module.clone(),
                cred,
                Fh::anonymous(),
                OpPayload::Mount(MountOp {
                    mount_path: path.clone(),
                    options,
                    out_root_fragment: Vec::new(),
                    out_attrs: Attrs::request(AttrMask::STAT | AttrMask::FH),
                    out_private: None,
                }),
            )
            .await?;
        state.status?;
        let OpPayload::Mount(op) = state.payload else {
            return Err(VfsError::ServerFault);
        };

        let root_fh = Fh::from_slice(&[magic])?
            .extend(&id.0)?
            .extend(&op.out_root_fragment)?;
        let mount = Arc::new(Mount {
            module: module.clone(),
            path: path.clone(),
            root_fh,
            attrs: MountAttrs::default(),
            private: op.out_private,
        });
        if let Err(err) = self.mount_table.insert(id, mount) {
            // Lost a mount race; roll the backend attach back.
            warn!("mount {path} raced, detaching backend again");
            self.dispatch_umount(&module, cred, &path, None).await;
            return Err(err);
        }
        self.purge_namespace_entry(&path);
        info!("mounted {} at /{path}", module.name());
        Ok(root_fh)
    }

    /// Drops cached namespace state for a mount path after the mount
    /// table changed underneath it.
    fn purge_namespace_entry(&self, path: &str) {
        let (parent, name) = match path.rfind('/') {
            Some(at) => (&path[..at], &path[at + 1..]),
            None => ("", path),
        };
        if let Ok(parent_fh) = Fh::root().extend(parent.as_bytes()) {
            self.name_cache.invalidate(&parent_fh, name);
            self.attr_cache.invalidate(&parent_fh, parent_fh.hash());
        }
    }

    /// Detaches the mount at `mount_path`.
    pub async fn umount(&self, cred: &Cred, mount_path: &str) -> VfsResult<()> {
        let path = normalize_mount_path(mount_path);
        let mount = self.mount_table.by_path(&path).ok_or(VfsError::NoEnt)?;
        self.umount_id(cred, MountId::from_path(&mount.path)).await
    }

    /// Detaches a mount by its id.
    pub async fn umount_id(&self, cred: &Cred, id: MountId) -> VfsResult<()> {
        let mount = self.mount_table.remove(id).ok_or(VfsError::NoEnt)?;
        self.purge_namespace_entry(&mount.path);
        self.attr_cache
            .invalidate(&mount.root_fh, mount.root_fh.hash());
        self.dispatch_umount(
            &mount.module,
            cred,
            &mount.path,
            mount.private.clone(),
        )
        .await;
        info!("unmounted /{}", mount.path);
        Ok(())
    }

    async fn dispatch_umount(
        &self,
        module: &Arc<dyn VfsModule>,
        cred: &Cred,
        path: &str,
        private: Option<crate::request::MountPrivate>,
    ) {
        let result = self
            .run_request(
                module.clone(),
                cred,
                Fh::anonymous(),
                OpPayload::Umount(UmountOp {
                    mount_path: path.to_string(),
                    private,
                }),
            )
            .await;
        match result {
            Ok(state) => {
                if let Err(err) = state.status {
                    warn!("backend umount of /{path} failed: {err}");
                }
            }
            Err(err) => warn!("backend umount of /{path} failed: {err}"),
        }
    }

    /// Releases an open handle acquired from any operation. Every
    /// acquire must be balanced by exactly one release.
    pub async fn release(&self, handle: Arc<OpenHandle>) {
        if let Some(ticket) = OpenCache::release(&handle) {
            // Detached handles close inline; cached ones wait for the
            // reaper.
            self.run_close(ticket).await;
        }
    }

    pub(crate) async fn run_close(&self, ticket: CloseTicket) {
        let result = self
            .run_request(
                ticket.module.clone(),
                &Cred::root(),
                ticket.fh,
                OpPayload::Close(CloseOp {
                    private: ticket.vfs_private,
                }),
            )
            .await;
        match result {
            Ok(state) => {
                if let Err(err) = state.status {
                    warn!("close of {:?} failed: {err}", ticket.fh);
                }
            }
            Err(err) => warn!("close of {:?} failed: {err}", ticket.fh),
        }
    }

    fn spawn_background(self: &Arc<Self>, mut close_rx: mpsc::Receiver<CloseTicket>) {
        let mut tasks = self.tasks.lock();

        // Close task: retires backend opens the reaper reclaimed.
        let weak = Arc::downgrade(self);
        *self.close_task.lock() = Some(tokio::spawn(async move {
            while let Some(ticket) = close_rx.recv().await {
                let Some(vfs) = weak.upgrade() else { break };
                vfs.run_close(ticket).await;
            }
        }));

        // Reaper: returns idle open handles to the backends once their
        // reclaim window passes.
        let weak = Arc::downgrade(self);
        let ttl = self.config.cache_ttl();
        let period = (ttl / 4).clamp(Duration::from_millis(50), Duration::from_secs(1));
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(vfs) = weak.upgrade() else { break };
                let tickets = vfs
                    .open_path_cache
                    .sweep_idle(ttl)
                    .into_iter()
                    .chain(vfs.open_file_cache.sweep_idle(ttl));
                let tx = vfs.close_tx.lock().clone();
                let Some(tx) = tx else { break };
                for ticket in tickets {
                    if tx.send(ticket).await.is_err() {
                        return;
                    }
                }
            }
        }));

        // Watchdog: reports requests stuck in flight. Never aborts them.
        let weak = Arc::downgrade(self);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(WATCHDOG_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(vfs) = weak.upgrade() else { break };
                vfs.active.for_each(|id, entry| {
                    let age = entry.started.elapsed();
                    if age > WATCHDOG_THRESHOLD {
                        warn!(
                            "request {id} ({:?}) in flight for {age:?}",
                            entry.opcode
                        );
                    }
                });
            }
        }));
    }

    /// Stops background work, drains in-flight requests, closes cached
    /// handles and joins the delegation pool. Call once, after the
    /// protocol frontends have stopped submitting.
    pub async fn shutdown(&self) {
        // Give in-flight requests a bounded chance to finish.
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let leftover = self.active.len();
        if leftover > 0 {
            warn!("shutdown with {leftover} requests still in flight");
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        // Close every idle cached handle directly; the close task is
        // about to go away.
        let (path_tickets, path_busy) = self.open_path_cache.drain();
        let (file_tickets, file_busy) = self.open_file_cache.drain();
        if path_busy + file_busy > 0 {
            warn!(
                "shutdown with {} open handles still referenced",
                path_busy + file_busy
            );
        }
        for ticket in path_tickets.into_iter().chain(file_tickets) {
            self.run_close(ticket).await;
        }

        drop(self.close_tx.lock().take());
        let close_task = self.close_task.lock().take();
        if let Some(task) = close_task {
            let _ = task.await;
        }

        self.delegation.shutdown();

        for module in self.modules.iter().flatten() {
            module.shutdown();
        }
        info!("vfs stopped");
    }
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("mounts", &self.mount_table.len())
            .field("in_flight", &self.active.len())
            .finish_non_exhaustive()
    }
}
