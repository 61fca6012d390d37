//! Liveness probing for remotely-coordinated transactions.
//!
//! A remote coordinator that crashed or dropped off the network would
//! otherwise leave its transactions pinning entries forever. The checker
//! periodically asks each remote coordinator for the status of its
//! transactions and force-aborts the ones whose coordinator reports them
//! aborted or cannot be reached at all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use tspace_error::Result;
use tspace_types::{TxnId, TxnStatus};

use crate::manager::TxnManager;
use crate::op::EntryBackend;

/// Client side of a remote transaction coordinator.
pub trait CoordinatorGateway: Send + Sync {
    /// Current status of `id` at its coordinator. An `Err` means the
    /// coordinator could not be reached.
    fn status_of(&self, id: &TxnId) -> Result<TxnStatus>;
}

/// What the checker needs from its host. Held weakly so the checker thread
/// never keeps the host alive.
pub trait TxnHost: Send + Sync {
    fn remote_transactions(&self) -> Vec<TxnId>;
    fn force_abort(&self, id: &TxnId);
}

impl<B: EntryBackend + 'static> TxnHost for TxnManager<B> {
    fn remote_transactions(&self) -> Vec<TxnId> {
        self.remote_transaction_ids()
    }

    fn force_abort(&self, id: &TxnId) {
        if let Err(err) = self.abort(id) {
            warn!(txn = %id, error = %err, "force-abort of dead remote transaction failed");
        }
    }
}

struct LivenessShared {
    shutdown: AtomicBool,
    gate: Mutex<()>,
    wake: Condvar,
}

/// Owned background probe loop. Dropping the checker stops and joins the
/// thread.
pub struct LivenessChecker {
    shared: Arc<LivenessShared>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessChecker {
    /// Start probing `host`'s remote transactions every `interval`.
    pub fn start<H: TxnHost + 'static>(
        host: Weak<H>,
        gateway: Arc<dyn CoordinatorGateway>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(LivenessShared {
            shutdown: AtomicBool::new(false),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("tspace-liveness".into())
            .spawn(move || run_loop(&loop_shared, &host, gateway.as_ref(), interval))
            .expect("spawn liveness thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }
}

impl Drop for LivenessChecker {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop<H: TxnHost>(
    shared: &LivenessShared,
    host: &Weak<H>,
    gateway: &dyn CoordinatorGateway,
    interval: Duration,
) {
    loop {
        {
            let mut gate = shared.gate.lock();
            shared.wake.wait_for(&mut gate, interval);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        let Some(host) = host.upgrade() else {
            break;
        };
        probe(host.as_ref(), gateway);
    }
    debug!("liveness checker stopped");
}

fn probe<H: TxnHost + ?Sized>(host: &H, gateway: &dyn CoordinatorGateway) {
    for id in host.remote_transactions() {
        match gateway.status_of(&id) {
            Ok(TxnStatus::Aborted) => {
                debug!(txn = %id, "coordinator reports transaction aborted");
                host.force_abort(&id);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(txn = %id, error = %err, "coordinator unreachable, aborting");
                host.force_abort(&id);
            }
        }
    }
}
