//! Delegation worker pool.
//!
//! Backends that declare [`Capabilities::BLOCKING`] run their dispatch
//! on this fixed pool of OS threads instead of the network tasks. Each
//! worker owns a bounded intake channel, so a slow backend applies
//! natural backpressure to its submitters without stalling anyone
//! else's traffic. Submission round-robins across workers; within one
//! worker, requests run one at a time in arrival order.
//!
//! [`Capabilities::BLOCKING`]: crate::module::Capabilities::BLOCKING

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use log::{debug, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::VfsError;
use crate::module::VfsModule;
use crate::request::Request;

/// Per-worker intake depth. Submitters wait for a slot when the queue
/// is full.
const INTAKE_DEPTH: usize = 128;

/// Fixed-size pool of delegation workers.
pub(crate) struct DelegationPool {
    intakes: Mutex<Option<Vec<mpsc::Sender<Request>>>>,
    next: AtomicUsize,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DelegationPool {
    /// Spawns `count` workers. Every registered module's `worker_init`
    /// hook runs on each worker before it accepts requests.
    pub(crate) fn new(count: usize, modules: Vec<Arc<dyn VfsModule>>) -> Self {
        let mut intakes = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::channel(INTAKE_DEPTH);
            let modules = modules.clone();
            match std::thread::Builder::new()
                .name(format!("vfs-delegation-{index}"))
                .spawn(move || worker_main(index, rx, modules))
            {
                Ok(join) => {
                    intakes.push(tx);
                    joins.push(join);
                }
                Err(err) => {
                    // Run degraded on whatever workers did start.
                    warn!("failed to spawn delegation worker {index}: {err}");
                }
            }
        }
        DelegationPool {
            intakes: Mutex::new(Some(intakes)),
            next: AtomicUsize::new(0),
            joins: Mutex::new(joins),
        }
    }

    /// Hands a request to a worker, waiting when its intake is full.
    pub(crate) async fn submit(&self, request: Request) {
        let intake = {
            let guard = self.intakes.lock();
            match guard.as_ref() {
                Some(intakes) if !intakes.is_empty() => {
                    let index =
                        self.next.fetch_add(1, Ordering::Relaxed) % intakes.len();
                    intakes[index].clone()
                }
                _ => {
                    drop(guard);
                    request.complete(Err(VfsError::Delay));
                    return;
                }
            }
        };
        if let Err(err) = intake.send(request).await {
            // Raced with shutdown; fail the request rather than hang.
            err.0.complete(Err(VfsError::Delay));
        }
    }

    /// Closes all intakes and joins the workers. Requests already queued
    /// still run to completion first.
    pub(crate) fn shutdown(&self) {
        drop(self.intakes.lock().take());
        let joins = std::mem::take(&mut *self.joins.lock());
        for join in joins {
            if let Err(e) = join.join() {
                warn!("delegation worker panicked: {e:?}");
            }
        }
    }
}

fn worker_main(
    index: usize,
    mut intake: mpsc::Receiver<Request>,
    modules: Vec<Arc<dyn VfsModule>>,
) {
    debug!("delegation worker {index} starting");
    for module in &modules {
        module.worker_init();
    }
    while let Some(request) = intake.blocking_recv() {
        let module = request.module.clone();
        module.dispatch(request);
    }
    for module in &modules {
        module.worker_shutdown();
    }
    debug!("delegation worker {index} exiting");
}
