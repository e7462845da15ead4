//! Parallel recursive tree walk.
//!
//! `find` descends from a root directory, applying a caller filter to
//! every discovered entry and emitting the survivors. Each directory is
//! walked as its own task, so discovery, emission and descent run
//! concurrently across branches; within one directory, emission follows
//! readdir order. A readdir failure prunes that subtree only, leaving
//! siblings running, and the first error observed becomes the overall
//! status, reported exactly once when the whole tree has drained.

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::attr::{AttrMask, Attrs};
use crate::cred::Cred;
use crate::error::{VfsError, VfsResult};
use crate::fh::Fh;
use crate::module::ReaddirFlags;
use crate::vfs::Vfs;

/// Filter applied to each discovered entry; `false` skips the entry
/// entirely, including descent into it.
pub type FindFilter = dyn Fn(&str, &Attrs) -> bool + Send + Sync;

/// Callback invoked for each entry that passes the filter, with the
/// path relative to the walk root.
pub type FindEmit = dyn Fn(&str, &Attrs) + Send + Sync;

struct FindCtx {
    vfs: Arc<Vfs>,
    cred: Cred,
    attr_mask: AttrMask,
    filter: Box<FindFilter>,
    emit: Box<FindEmit>,
    status: Mutex<Option<VfsError>>,
}

impl FindCtx {
    fn record(&self, err: VfsError) {
        let mut status = self.status.lock();
        if status.is_none() {
            *status = Some(err);
        }
    }
}

fn walk(ctx: Arc<FindCtx>, fh: Fh, path: String) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        let handle = match ctx.vfs.open_path(&ctx.cred, &fh).await {
            Ok(handle) => handle,
            Err(err) => {
                ctx.record(err);
                return;
            }
        };

        let sink: Arc<Mutex<Vec<(String, Attrs)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let collect = sink.clone();
        let result = ctx
            .vfs
            .readdir(
                &ctx.cred,
                &handle,
                0,
                0,
                ctx.attr_mask | AttrMask::FH | AttrMask::MODE,
                ReaddirFlags::empty(),
                move |entry| {
                    collect
                        .lock()
                        .push((entry.name.to_string(), entry.attrs.clone()));
                    true
                },
            )
            .await;
        ctx.vfs.release(handle).await;
        if let Err(err) = result {
            ctx.record(err);
            return;
        }

        let entries = std::mem::take(&mut *sink.lock());
        let mut children = JoinSet::new();
        for (name, attrs) in entries {
            if name == "." || name == ".." {
                continue;
            }
            let child_path = if path.is_empty() {
                name
            } else {
                format!("{path}/{name}")
            };
            if !(ctx.filter)(&child_path, &attrs) {
                continue;
            }
            (ctx.emit)(&child_path, &attrs);
            if attrs.is_dir() && attrs.set_mask.contains(AttrMask::FH) {
                children.spawn(walk(ctx.clone(), attrs.fh, child_path));
            }
        }
        while children.join_next().await.is_some() {}
    })
}

impl Vfs {
    /// Walks the tree rooted at `root_fh` in parallel, filtering and
    /// emitting entries. Completes when the whole subtree has drained;
    /// the result is the first error any branch observed.
    pub async fn find(
        self: &Arc<Self>,
        cred: &Cred,
        root_fh: &Fh,
        attr_mask: AttrMask,
        filter: impl Fn(&str, &Attrs) -> bool + Send + Sync + 'static,
        emit: impl Fn(&str, &Attrs) + Send + Sync + 'static,
    ) -> VfsResult<()> {
        let ctx = Arc::new(FindCtx {
            vfs: self.clone(),
            cred: cred.clone(),
            attr_mask,
            filter: Box::new(filter),
            emit: Box::new(emit),
            status: Mutex::new(None),
        });
        walk(ctx.clone(), *root_fh, String::new()).await;
        match ctx.status.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
