//! Open, open-at, create-unlinked and the shared acquire path.

use std::sync::Arc;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::module::{AccessMode, Capabilities, OpenFlags, VfsModule};
use crate::open_cache::{
    Acquire, CloseTicket, HandleFlavor, Insert, OpenCache, OpenHandle,
};
use crate::ops::expect_payload;
use crate::request::{CreateUnlinkedOp, OpPayload, OpenAtOp, OpenOp};
use crate::vfs::Vfs;
use crate::NAME_MAX;

impl Vfs {
    fn cache_for(&self, flavor: HandleFlavor) -> &OpenCache {
        match flavor {
            HandleFlavor::Path => &self.open_path_cache,
            HandleFlavor::File => &self.open_file_cache,
        }
    }

    /// The acquire protocol: synthetic fast path for stateless modules,
    /// dedup against the cache, FIFO blocking behind an in-flight or
    /// exclusive open, and the backend `Open` dispatch for the caller
    /// that creates the entry.
    pub(crate) async fn acquire(
        &self,
        cred: &Cred,
        fh: &Fh,
        access: AccessMode,
        flavor: HandleFlavor,
        extra_flags: OpenFlags,
    ) -> VfsResult<Arc<OpenHandle>> {
        let module = self.module_for(fh)?;
        let required = match flavor {
            HandleFlavor::Path => Capabilities::OPEN_PATH_REQUIRED,
            HandleFlavor::File => Capabilities::OPEN_FILE_REQUIRED,
        };
        if !module.capabilities().contains(required) {
            return Ok(OpenHandle::synthetic(module, *fh, access, flavor));
        }
        if fh.is_anonymous() {
            return Err(VfsError::BadHandle);
        }

        let exclusive = extra_flags.contains(OpenFlags::EXCLUSIVE);
        let cache = self.cache_for(flavor);
        match cache.begin_acquire(&module, fh, access, exclusive) {
            Acquire::Hit(handle) => Ok(handle),
            Acquire::Wait(rx) => rx.await.map_err(|_| VfsError::ServerFault)?,
            Acquire::MustOpen(handle) => {
                let mut flags = extra_flags;
                if flavor == HandleFlavor::Path {
                    flags |= OpenFlags::PATH | OpenFlags::INFERRED;
                }
                if access == AccessMode::ReadOnly {
                    flags |= OpenFlags::READ_ONLY;
                }
                let opened = self
                    .open_backend(&module, cred, fh, flags)
                    .await;
                match opened {
                    Ok(vfs_private) => {
                        cache.finish_open(&handle, Ok(vfs_private));
                        Ok(handle)
                    }
                    Err(err) => {
                        cache.finish_open(&handle, Err(err));
                        Err(err)
                    }
                }
            }
        }
    }

    async fn open_backend(
        &self,
        module: &Arc<dyn VfsModule>,
        cred: &Cred,
        fh: &Fh,
        flags: OpenFlags,
    ) -> VfsResult<u64> {
        let state = self
            .run_request(
                module.clone(),
                cred,
                *fh,
                OpPayload::Open(OpenOp {
                    flags,
                    out_private: 0,
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, Open);
        Ok(op.out_private)
    }

    /// Opens a file-flavored handle on `fh` for data-plane access.
    pub async fn open(
        &self,
        cred: &Cred,
        fh: &Fh,
        access: AccessMode,
        flags: OpenFlags,
    ) -> VfsResult<Arc<OpenHandle>> {
        self.acquire(cred, fh, access, HandleFlavor::File, flags).await
    }

    /// Opens a path-flavored handle on `fh` for namespace operations.
    pub async fn open_path(
        &self,
        cred: &Cred,
        fh: &Fh,
    ) -> VfsResult<Arc<OpenHandle>> {
        self.acquire(
            cred,
            fh,
            AccessMode::ReadWrite,
            HandleFlavor::Path,
            OpenFlags::empty(),
        )
        .await
    }

    /// Opens, and with [`OpenFlags::CREATE`] possibly creates, `name`
    /// under `parent`. Returns the file-flavored handle plus the
    /// object's attributes.
    pub async fn open_at(
        &self,
        cred: &Cred,
        parent: &Arc<OpenHandle>,
        name: &str,
        flags: OpenFlags,
        set: Attrs,
        attr_mask: AttrMask,
    ) -> VfsResult<(Arc<OpenHandle>, Attrs)> {
        if name.len() > NAME_MAX {
            return Err(VfsError::NameTooLong);
        }
        let module = parent.module().clone();
        let state = self
            .run_request(
                module.clone(),
                cred,
                *parent.fh(),
                OpPayload::OpenAt(OpenAtOp {
                    name: name.to_string(),
                    flags,
                    set,
                    out_attrs: Attrs::request(
                        attr_mask | AttrMask::FH | AttrMask::CACHEABLE,
                    ),
                    out_dir_pre_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_dir_post_attrs: Attrs::request(AttrMask::CACHEABLE),
                    out_private: 0,
                }),
            )
            .await?;
        self.attr_cache.invalidate(parent.fh(), parent.fh_hash());
        state.status?;
        let op = expect_payload!(state, OpenAt);
        if !op.out_attrs.set_mask.contains(AttrMask::FH) {
            return Err(VfsError::ServerFault);
        }
        let child_fh = op.out_attrs.fh;

        self.name_cache.insert(parent.fh(), name, child_fh);
        self.attr_cache
            .insert(&child_fh, child_fh.hash(), &op.out_attrs);
        if op.out_dir_post_attrs.set_mask.intersects(AttrMask::CACHEABLE) {
            self.attr_cache.insert(
                parent.fh(),
                parent.fh_hash(),
                &op.out_dir_post_attrs,
            );
        }

        let access = if flags.contains(OpenFlags::READ_ONLY) {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let handle = if !module
            .capabilities()
            .contains(Capabilities::OPEN_FILE_REQUIRED)
        {
            OpenHandle::synthetic(module, child_fh, access, HandleFlavor::File)
        } else {
            match self.open_file_cache.insert_ready(
                &module,
                &child_fh,
                access,
                op.out_private,
            ) {
                Insert::Installed(handle) => handle,
                Insert::Duplicate => {
                    // A concurrent opener beat us to the cache; retire
                    // the redundant backend open and share theirs.
                    self.run_close(CloseTicket {
                        module: module.clone(),
                        fh: child_fh,
                        vfs_private: op.out_private,
                    })
                    .await;
                    self.acquire(
                        cred,
                        &child_fh,
                        access,
                        HandleFlavor::File,
                        OpenFlags::empty(),
                    )
                    .await?
                }
            }
        };
        Ok((handle, op.out_attrs))
    }

    /// Creates a nameless object on the mount owning `anchor` and
    /// returns an open handle to it, for staged uploads that only get
    /// linked into the namespace on completion.
    pub async fn create_unlinked(
        &self,
        cred: &Cred,
        anchor: &Fh,
        flags: OpenFlags,
        set: Attrs,
        attr_mask: AttrMask,
    ) -> VfsResult<(Arc<OpenHandle>, Attrs)> {
        let module = self.module_for(anchor)?;
        if !module
            .capabilities()
            .contains(Capabilities::CREATE_UNLINKED)
        {
            return Err(VfsError::NotSupp);
        }
        let state = self
            .run_request(
                module.clone(),
                cred,
                *anchor,
                OpPayload::CreateUnlinked(CreateUnlinkedOp {
                    flags,
                    set,
                    out_attrs: Attrs::request(
                        attr_mask | AttrMask::FH | AttrMask::CACHEABLE,
                    ),
                    out_private: 0,
                }),
            )
            .await?;
        state.status?;
        let op = expect_payload!(state, CreateUnlinked);
        if !op.out_attrs.set_mask.contains(AttrMask::FH) {
            return Err(VfsError::ServerFault);
        }
        let child_fh = op.out_attrs.fh;
        self.attr_cache
            .insert(&child_fh, child_fh.hash(), &op.out_attrs);

        let handle = if module
            .capabilities()
            .contains(Capabilities::OPEN_FILE_REQUIRED)
        {
            OpenHandle::detached(
                module,
                child_fh,
                AccessMode::ReadWrite,
                HandleFlavor::File,
                op.out_private,
            )
        } else {
            OpenHandle::synthetic(
                module,
                child_fh,
                AccessMode::ReadWrite,
                HandleFlavor::File,
            )
        };
        Ok((handle, op.out_attrs))
    }
}
