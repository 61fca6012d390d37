//! Lease expiry tracking.
//!
//! Every leased entry is indexed by (expiry, slot) inside its bucket so a
//! sweep touches only the expired prefix of each bucket. Removing an expired
//! entry is a durable event: the sweep logs a take through [`OpLog`] rather
//! than deleting behind the log's back. The log call is the lossy `try_log`
//! variant; an entry that misses its slot this sweep is simply picked up by
//! the next one.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use tspace_txn::{Op, OpLog};
use tspace_types::{EntryRecord, Oid};

/// How long a sweep waits for log access per expired entry.
const SWEEP_LOG_TIMEOUT: Duration = Duration::from_millis(100);

/// Last word on whether an expired entry may really be removed. The space
/// layer vetoes entries that are pinned by an in-progress operation.
pub trait ExpiryFilter: Send + Sync {
    fn allow_removal(&self, record: &EntryRecord) -> bool;
}

#[derive(Default)]
struct LeaseIndex {
    /// bucket -> ordered (expiry_ms, slot) pairs.
    by_expiry: HashMap<u32, BTreeSet<(u64, u64)>>,
    records: HashMap<Oid, EntryRecord>,
}

impl LeaseIndex {
    fn insert(&mut self, record: EntryRecord) {
        let oid = record.oid;
        self.by_expiry
            .entry(oid.bucket)
            .or_default()
            .insert((record.expiry_ms, oid.slot));
        self.records.insert(oid, record);
    }

    fn remove(&mut self, oid: Oid) -> Option<EntryRecord> {
        let record = self.records.remove(&oid)?;
        if let Some(bucket) = self.by_expiry.get_mut(&oid.bucket) {
            bucket.remove(&(record.expiry_ms, oid.slot));
            if bucket.is_empty() {
                self.by_expiry.remove(&oid.bucket);
            }
        }
        Some(record)
    }
}

/// Expiry index over all leased entries.
pub struct LeaseTracker {
    log: Arc<dyn OpLog>,
    index: Mutex<LeaseIndex>,
}

impl LeaseTracker {
    #[must_use]
    pub fn new(log: Arc<dyn OpLog>) -> Self {
        Self {
            log,
            index: Mutex::new(LeaseIndex::default()),
        }
    }

    /// Track a leased entry. An expiry of zero means "forever"; such entries
    /// are not indexed at all.
    pub fn insert(&self, record: EntryRecord) {
        if record.expiry_ms == 0 {
            return;
        }
        self.index.lock().insert(record);
    }

    /// Stop tracking an entry (it was taken or cancelled).
    pub fn remove(&self, oid: Oid) {
        self.index.lock().remove(oid);
    }

    /// Rebuild the index from recovered entries. The index is in-memory
    /// only, so a restart must reseed it from the entries the store brought
    /// back, or no pre-crash lease would ever expire again.
    pub fn restore(&self, records: impl IntoIterator<Item = EntryRecord>) {
        let mut count = 0usize;
        {
            let mut index = self.index.lock();
            for record in records {
                if record.expiry_ms == 0 {
                    continue;
                }
                index.insert(record);
                count += 1;
            }
        }
        debug!(count, "lease index restored");
    }

    /// Renew a lease: durably log the new expiry, then move the entry in the
    /// index.
    pub fn renew(&self, oid: Oid, expiry_ms: u64) -> tspace_error::Result<()> {
        self.log.log(Op::Renew { oid, expiry_ms })?;
        let mut index = self.index.lock();
        if let Some(mut record) = index.remove(oid) {
            record.expiry_ms = expiry_ms;
            if expiry_ms != 0 {
                index.insert(record);
            }
        }
        debug!(oid = %oid, expiry_ms, "lease renewed");
        Ok(())
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.index.lock().records.len()
    }

    /// Earliest expiry across all buckets, if anything is tracked.
    #[must_use]
    pub fn next_expiry(&self) -> Option<u64> {
        let index = self.index.lock();
        index
            .by_expiry
            .values()
            .filter_map(|bucket| bucket.first().map(|(expiry, _)| *expiry))
            .min()
    }

    /// Remove every entry whose lease expired at or before `now_ms`, subject
    /// to the filter's veto. Returns the oids actually removed.
    pub fn sweep(&self, now_ms: u64, filter: &dyn ExpiryFilter) -> Vec<Oid> {
        let expired: Vec<EntryRecord> = {
            let index = self.index.lock();
            index
                .by_expiry
                .iter()
                .flat_map(|(bucket, set)| {
                    set.range(..=(now_ms, u64::MAX))
                        .map(|(_, slot)| Oid::new(*bucket, *slot))
                })
                .filter_map(|oid| index.records.get(&oid).cloned())
                .collect()
        };

        let mut removed = Vec::new();
        for record in expired {
            let oid = record.oid;
            if !filter.allow_removal(&record) {
                // Vetoed entries stay indexed; the next sweep asks again.
                debug!(oid = %oid, "expiry vetoed");
                continue;
            }
            match self.log.try_log(Op::Take { oid }, SWEEP_LOG_TIMEOUT) {
                Ok(true) => {
                    self.index.lock().remove(oid);
                    removed.push(oid);
                }
                Ok(false) => {
                    debug!(oid = %oid, "expiry removal deferred, log busy");
                }
                Err(err) => {
                    warn!(oid = %oid, error = %err, "expiry removal failed");
                }
            }
        }
        if !removed.is_empty() {
            debug!(removed = removed.len(), now_ms, "lease sweep");
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// LeaseSweeper — owned background sweep loop
// ---------------------------------------------------------------------------

struct SweeperShared {
    shutdown: AtomicBool,
    gate: Mutex<()>,
    wake: Condvar,
}

/// Periodic sweep thread. Dropping it stops and joins the thread.
pub struct LeaseSweeper {
    shared: Arc<SweeperShared>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseSweeper {
    pub fn start(
        tracker: Weak<LeaseTracker>,
        filter: Arc<dyn ExpiryFilter>,
        interval: Duration,
    ) -> Self {
        let shared = Arc::new(SweeperShared {
            shutdown: AtomicBool::new(false),
            gate: Mutex::new(()),
            wake: Condvar::new(),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("tspace-lease-sweep".into())
            .spawn(move || {
                loop {
                    {
                        let mut gate = loop_shared.gate.lock();
                        loop_shared.wake.wait_for(&mut gate, interval);
                    }
                    if loop_shared.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(tracker) = tracker.upgrade() else {
                        break;
                    };
                    tracker.sweep(now_ms(), filter.as_ref());
                }
                debug!("lease sweeper stopped");
            })
            .expect("spawn lease sweeper");
        Self {
            shared,
            handle: Some(handle),
        }
    }
}

impl Drop for LeaseSweeper {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex as PMutex;
    use tspace_error::Result;

    use super::*;

    #[derive(Default)]
    struct RecordingLog {
        ops: PMutex<Vec<Op>>,
        refuse_try: AtomicBool,
    }

    impl OpLog for RecordingLog {
        fn log(&self, op: Op) -> Result<()> {
            self.ops.lock().push(op);
            Ok(())
        }

        fn try_log(&self, op: Op, _timeout: Duration) -> Result<bool> {
            if self.refuse_try.load(Ordering::Acquire) {
                return Ok(false);
            }
            self.ops.lock().push(op);
            Ok(true)
        }
    }

    struct AllowAll;
    impl ExpiryFilter for AllowAll {
        fn allow_removal(&self, _record: &EntryRecord) -> bool {
            true
        }
    }

    struct VetoClass(u32);
    impl ExpiryFilter for VetoClass {
        fn allow_removal(&self, record: &EntryRecord) -> bool {
            record.class_id != self.0
        }
    }

    fn leased(bucket: u32, slot: u64, class_id: u32, expiry_ms: u64) -> EntryRecord {
        EntryRecord::new(Oid::new(bucket, slot), class_id, vec![], expiry_ms)
    }

    #[test]
    fn test_sweep_removes_expired_and_logs_takes() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(Arc::clone(&log) as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 1, 100));
        tracker.insert(leased(0, 2, 1, 500));
        tracker.insert(leased(1, 3, 1, 50));

        let removed = tracker.sweep(100, &AllowAll);
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&Oid::new(0, 1)));
        assert!(removed.contains(&Oid::new(1, 3)));
        assert_eq!(tracker.tracked(), 1);
        assert_eq!(log.ops.lock().len(), 2);
        assert!(log
            .ops
            .lock()
            .iter()
            .all(|op| matches!(op, Op::Take { .. })));

        // Nothing left to do at the same instant.
        assert!(tracker.sweep(100, &AllowAll).is_empty());
    }

    #[test]
    fn test_veto_keeps_entry_tracked() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(Arc::clone(&log) as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 7, 100));
        tracker.insert(leased(0, 2, 1, 100));

        let removed = tracker.sweep(200, &VetoClass(7));
        assert_eq!(removed, vec![Oid::new(0, 2)]);
        assert_eq!(tracker.tracked(), 1);

        // The veto lifted: the survivor goes on the next sweep.
        let removed = tracker.sweep(200, &AllowAll);
        assert_eq!(removed, vec![Oid::new(0, 1)]);
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn test_busy_log_defers_removal() {
        let log = Arc::new(RecordingLog::default());
        log.refuse_try.store(true, Ordering::Release);
        let tracker = LeaseTracker::new(Arc::clone(&log) as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 1, 10));

        assert!(tracker.sweep(100, &AllowAll).is_empty());
        assert_eq!(tracker.tracked(), 1);

        log.refuse_try.store(false, Ordering::Release);
        assert_eq!(tracker.sweep(100, &AllowAll), vec![Oid::new(0, 1)]);
    }

    #[test]
    fn test_renew_is_logged_and_moves_expiry() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(Arc::clone(&log) as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 1, 100));

        tracker.renew(Oid::new(0, 1), 900).expect("renew");
        assert!(matches!(
            log.ops.lock().as_slice(),
            [Op::Renew { expiry_ms: 900, .. }]
        ));

        // Old deadline passes harmlessly; new one expires.
        assert!(tracker.sweep(100, &AllowAll).is_empty());
        assert_eq!(tracker.sweep(900, &AllowAll), vec![Oid::new(0, 1)]);
    }

    #[test]
    fn test_restore_reseeds_index_and_skips_forever_leases() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(log as Arc<dyn OpLog>);
        tracker.restore(vec![
            leased(0, 1, 1, 100),
            leased(0, 2, 1, 0),
            leased(3, 4, 1, 250),
        ]);
        assert_eq!(tracker.tracked(), 2);
        assert_eq!(tracker.next_expiry(), Some(100));

        let removed = tracker.sweep(300, &AllowAll);
        assert_eq!(removed.len(), 2);
    }

    #[test]
    fn test_forever_leases_are_not_tracked() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(log as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 1, 0));
        assert_eq!(tracker.tracked(), 0);
        assert_eq!(tracker.next_expiry(), None);
    }

    #[test]
    fn test_next_expiry_spans_buckets() {
        let log = Arc::new(RecordingLog::default());
        let tracker = LeaseTracker::new(log as Arc<dyn OpLog>);
        tracker.insert(leased(0, 1, 1, 300));
        tracker.insert(leased(5, 2, 1, 120));
        assert_eq!(tracker.next_expiry(), Some(120));
    }

    #[test]
    fn test_sweeper_thread_sweeps_and_stops() {
        let log = Arc::new(RecordingLog::default());
        let tracker = Arc::new(LeaseTracker::new(log as Arc<dyn OpLog>));
        tracker.insert(leased(0, 1, 1, 1)); // long expired
        let sweeper = LeaseSweeper::start(
            Arc::downgrade(&tracker),
            Arc::new(AllowAll),
            Duration::from_millis(5),
        );
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while tracker.tracked() > 0 {
            assert!(std::time::Instant::now() < deadline, "sweep never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(sweeper);
    }
}
