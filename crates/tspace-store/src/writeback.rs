//! Asynchronous coalescing write-back buffer.
//!
//! Physical storage I/O happens off the caller's thread. Each oid owns a
//! FIFO queue of outstanding write requests; a new request merges into the
//! queue tail unless that request is already being flushed, so a burst of
//! changes to one entry collapses into at most one physical operation per
//! flush cycle. An entry created and deleted before its first flush produces
//! no physical I/O at all.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace, warn};
use tspace_error::{Result, TspaceError};
use tspace_types::{EntryRecord, Oid};

// ---------------------------------------------------------------------------
// PhysicalStore — the seam to on-disk entry storage
// ---------------------------------------------------------------------------

/// Physical entry storage as seen by the write-back layer.
pub trait PhysicalStore: Send + Sync {
    fn insert(&self, record: &EntryRecord) -> Result<()>;
    fn update(&self, record: &EntryRecord) -> Result<()>;
    fn delete(&self, oid: Oid) -> Result<()>;
    /// Read one record back; recovery uses this to resurrect entries held by
    /// prepared takes.
    fn load(&self, oid: Oid) -> Result<Option<EntryRecord>>;
    /// Every stored record, for warm-starting the in-memory cache.
    fn scan(&self) -> Result<Vec<EntryRecord>>;
}

// ---------------------------------------------------------------------------
// WriteState / FlushAction
// ---------------------------------------------------------------------------

/// Pending-change classification of a buffered request, relative to what the
/// physical store currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Not on disk yet; flush inserts.
    New,
    /// On disk; flush rewrites.
    Updated,
    /// On disk; flush deletes.
    Deleted,
    /// Created and deleted before ever reaching disk; flush is elided.
    NewDeleted,
}

impl WriteState {
    /// Combine with a later change to the same oid. The result classifies the
    /// net effect against the unchanged on-disk state.
    #[must_use]
    pub fn merge(self, later: Self) -> Self {
        match (self, later) {
            (Self::New, Self::Deleted) => Self::NewDeleted,
            (Self::New, _) => Self::New,
            (Self::Updated | Self::Deleted, Self::Deleted) => Self::Deleted,
            (Self::Updated | Self::Deleted, _) => Self::Updated,
            // The slot was reborn before its elided write ever ran.
            (Self::NewDeleted, Self::New | Self::Updated) => Self::New,
            (Self::NewDeleted, Self::Deleted | Self::NewDeleted) => Self::NewDeleted,
        }
    }

    /// The physical operation a flush of this state performs.
    #[must_use]
    pub fn action(self) -> FlushAction {
        match self {
            Self::New => FlushAction::Insert,
            Self::Updated => FlushAction::Update,
            Self::Deleted => FlushAction::Delete,
            Self::NewDeleted => FlushAction::Elide,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushAction {
    Insert,
    Update,
    Delete,
    Elide,
}

/// One buffered change. `record` is absent for deletions.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub oid: Oid,
    pub record: Option<EntryRecord>,
    pub state: WriteState,
}

/// What a dirty read of the buffer sees for an oid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buffered {
    Record(EntryRecord),
    Deleted,
}

// ---------------------------------------------------------------------------
// WriteBuffer
// ---------------------------------------------------------------------------

/// Called after the last pending request for an oid has been flushed.
pub type FlushedHook = Box<dyn Fn(Oid) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WriteBufferConfig {
    /// Flush worker threads. `0` disables the pool; the owner drives flushes
    /// through [`WriteBuffer::run_pending`].
    pub workers: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

#[derive(Default)]
struct OidQueue {
    pending: VecDeque<WriteRequest>,
    /// The front request is currently being written out; it can no longer
    /// absorb merges.
    flushing: bool,
}

struct BufferInner {
    store: Arc<dyn PhysicalStore>,
    table: Mutex<HashMap<Oid, OidQueue>>,
    /// Deferred changes for evicted-while-pinned entries. A parked request
    /// holds the newest committed state of its oid and stays out of the
    /// flush queues until the pin is released.
    pinned: Mutex<HashMap<Oid, WriteRequest>>,
    jobs: Mutex<VecDeque<Oid>>,
    wake: Condvar,
    shutdown: AtomicBool,
    flushed_hook: RwLock<Option<FlushedHook>>,
}

impl BufferInner {
    fn enqueue(&self, oid: Oid) {
        self.jobs.lock().push_back(oid);
        self.wake.notify_one();
    }

    /// Flush the front request for `oid`, if any. Concurrent workers that
    /// race on the same oid leave all but one empty-handed; the winner
    /// re-enqueues if more requests remain.
    fn flush_one(&self, oid: Oid) -> Result<()> {
        let request = {
            let mut table = self.table.lock();
            let Some(queue) = table.get_mut(&oid) else {
                return Ok(());
            };
            if queue.flushing || queue.pending.is_empty() {
                return Ok(());
            }
            queue.flushing = true;
            queue.pending.front().cloned().ok_or_else(|| {
                TspaceError::internal("non-empty queue without a front request")
            })?
        };

        let result = match request.state.action() {
            FlushAction::Insert => self.store.insert(self.require_record(&request)?),
            FlushAction::Update => self.store.update(self.require_record(&request)?),
            FlushAction::Delete => self.store.delete(oid),
            FlushAction::Elide => {
                trace!(oid = %oid, "physical write elided");
                Ok(())
            }
        };

        let drained = {
            let mut table = self.table.lock();
            match table.get_mut(&oid) {
                Some(queue) => {
                    queue.flushing = false;
                    queue.pending.pop_front();
                    if queue.pending.is_empty() {
                        table.remove(&oid);
                        true
                    } else {
                        self.enqueue(oid);
                        false
                    }
                }
                None => true,
            }
        };
        if drained {
            if let Some(hook) = self.flushed_hook.read().as_ref() {
                hook(oid);
            }
        }
        result
    }

    fn require_record<'a>(&self, request: &'a WriteRequest) -> Result<&'a EntryRecord> {
        request.record.as_ref().ok_or_else(|| {
            TspaceError::internal(format!(
                "buffered {:?} for {} carries no record",
                request.state, request.oid
            ))
        })
    }
}

/// The buffer itself. Dropping it stops the workers and drains every
/// remaining request synchronously.
pub struct WriteBuffer {
    inner: Arc<BufferInner>,
    workers: Vec<JoinHandle<()>>,
}

impl WriteBuffer {
    #[must_use]
    pub fn new(store: Arc<dyn PhysicalStore>, config: &WriteBufferConfig) -> Self {
        let inner = Arc::new(BufferInner {
            store,
            table: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashMap::new()),
            jobs: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            flushed_hook: RwLock::new(None),
        });
        let workers = (0..config.workers)
            .map(|i| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("tspace-writeback-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("spawn write-back worker")
            })
            .collect();
        Self { inner, workers }
    }

    /// Install the notification fired when an oid's queue fully drains.
    pub fn set_flushed_hook(&self, hook: FlushedHook) {
        *self.inner.flushed_hook.write() = Some(hook);
    }

    /// Buffer one change. Merges into the queue tail when that request has
    /// not started flushing yet.
    pub fn push(&self, oid: Oid, record: Option<EntryRecord>, state: WriteState) {
        {
            let mut table = self.inner.table.lock();
            let queue = table.entry(oid).or_default();
            let tail_is_flushing = queue.flushing && queue.pending.len() == 1;
            if !tail_is_flushing {
                if let Some(tail) = queue.pending.back_mut() {
                    tail.state = tail.state.merge(state);
                    if record.is_some() {
                        tail.record = record;
                    }
                    trace!(oid = %oid, state = ?tail.state, "request merged into tail");
                    return;
                }
            }
            queue.pending.push_back(WriteRequest { oid, record, state });
        }
        self.inner.enqueue(oid);
    }

    /// Defer a change for a pinned entry. It sits outside the flush queues,
    /// absorbing further changes, until [`Self::unpark`] releases it.
    pub fn park(&self, oid: Oid, record: Option<EntryRecord>, state: WriteState) {
        let mut pinned = self.inner.pinned.lock();
        if let Some(existing) = pinned.get_mut(&oid) {
            existing.state = existing.state.merge(state);
            if record.is_some() {
                existing.record = record;
            }
            trace!(oid = %oid, state = ?existing.state, "request merged while parked");
            return;
        }
        pinned.insert(oid, WriteRequest { oid, record, state });
    }

    /// Release a parked change into the flush queues. Returns whether one
    /// was parked.
    pub fn unpark(&self, oid: Oid) -> bool {
        let request = self.inner.pinned.lock().remove(&oid);
        match request {
            Some(request) => {
                self.push(oid, request.record, request.state);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn has_parked(&self, oid: Oid) -> bool {
        self.inner.pinned.lock().contains_key(&oid)
    }

    /// The most recent buffered version of `oid`, bypassing physical storage.
    /// A parked request supersedes the queues: it left the sleeve layer
    /// after everything queued ahead of it.
    #[must_use]
    pub fn dirty_read(&self, oid: Oid) -> Option<Buffered> {
        {
            let pinned = self.inner.pinned.lock();
            if let Some(request) = pinned.get(&oid) {
                return match request.state {
                    WriteState::Deleted | WriteState::NewDeleted => Some(Buffered::Deleted),
                    WriteState::New | WriteState::Updated => {
                        request.record.clone().map(Buffered::Record)
                    }
                };
            }
        }
        let table = self.inner.table.lock();
        let tail = table.get(&oid)?.pending.back()?;
        match tail.state {
            WriteState::Deleted | WriteState::NewDeleted => Some(Buffered::Deleted),
            WriteState::New | WriteState::Updated => tail.record.clone().map(Buffered::Record),
        }
    }

    #[must_use]
    pub fn has_pending(&self, oid: Oid) -> bool {
        self.inner.table.lock().contains_key(&oid)
    }

    /// Total buffered requests across all oids.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.table.lock().values().map(|q| q.pending.len()).sum()
    }

    /// Drain the job queue on the calling thread. The flush path when the
    /// worker pool is disabled, and the tail end of shutdown.
    pub fn run_pending(&self) {
        loop {
            let oid = self.inner.jobs.lock().pop_front();
            let Some(oid) = oid else { break };
            if let Err(err) = self.inner.flush_one(oid) {
                warn!(oid = %oid, error = %err, "write-back flush failed");
            }
        }
    }

    /// Flush every buffered request, including parked ones, and return only
    /// once the physical store holds them all. Unlike the fire-and-forget
    /// flush paths, a failed write here propagates to the caller.
    ///
    /// Parked requests are written but stay parked: the pin still owns the
    /// in-memory copy and further changes keep merging into it.
    pub fn flush_all(&self) -> Result<()> {
        loop {
            let before = self.pending_len();
            if before == 0 {
                break;
            }
            let oids: Vec<Oid> = self.inner.table.lock().keys().copied().collect();
            for oid in oids {
                self.inner.flush_one(oid)?;
            }
            if self.pending_len() >= before {
                // The remaining queues are mid-flush on worker threads.
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        let parked: Vec<Oid> = self.inner.pinned.lock().keys().copied().collect();
        for oid in parked {
            let request = self.inner.pinned.lock().get(&oid).cloned();
            let Some(request) = request else { continue };
            match request.state.action() {
                FlushAction::Insert => {
                    self.inner.store.insert(self.inner.require_record(&request)?)?;
                    // Now on disk; a later flush of this parked request must
                    // rewrite rather than insert again.
                    if let Some(parked) = self.inner.pinned.lock().get_mut(&oid) {
                        parked.state = WriteState::Updated;
                    }
                }
                FlushAction::Update => {
                    self.inner.store.update(self.inner.require_record(&request)?)?;
                }
                FlushAction::Delete | FlushAction::Elide => {}
            }
        }
        Ok(())
    }
}

impl Drop for WriteBuffer {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        // Workers drain before exiting; anything pushed after they left is
        // flushed here. Parked requests lose their pins at shutdown.
        let parked: Vec<Oid> = self.inner.pinned.lock().keys().copied().collect();
        for oid in parked {
            self.unpark(oid);
        }
        self.run_pending();
        let leftover = self.pending_len();
        if leftover > 0 {
            debug!(leftover, "write buffer dropped with unflushable requests");
        }
    }
}

fn worker_loop(inner: &BufferInner) {
    loop {
        let oid = {
            let mut jobs = inner.jobs.lock();
            loop {
                if let Some(oid) = jobs.pop_front() {
                    break oid;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.wake.wait(&mut jobs);
            }
        };
        if let Err(err) = inner.flush_one(oid) {
            warn!(oid = %oid, error = %err, "write-back flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parking_lot::Mutex as PMutex;

    use super::*;

    #[derive(Default)]
    struct MemStore {
        entries: PMutex<HashMap<Oid, EntryRecord>>,
        calls: PMutex<Vec<String>>,
    }

    impl MemStore {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl PhysicalStore for MemStore {
        fn insert(&self, record: &EntryRecord) -> Result<()> {
            self.calls.lock().push(format!(
                "insert {} {:?}",
                record.oid, record.payload
            ));
            self.entries.lock().insert(record.oid, record.clone());
            Ok(())
        }
        fn update(&self, record: &EntryRecord) -> Result<()> {
            self.calls.lock().push(format!(
                "update {} {:?}",
                record.oid, record.payload
            ));
            self.entries.lock().insert(record.oid, record.clone());
            Ok(())
        }
        fn delete(&self, oid: Oid) -> Result<()> {
            self.calls.lock().push(format!("delete {oid}"));
            self.entries.lock().remove(&oid);
            Ok(())
        }
        fn load(&self, oid: Oid) -> Result<Option<EntryRecord>> {
            Ok(self.entries.lock().get(&oid).cloned())
        }
        fn scan(&self) -> Result<Vec<EntryRecord>> {
            Ok(self.entries.lock().values().cloned().collect())
        }
    }

    fn manual_buffer() -> (WriteBuffer, Arc<MemStore>) {
        let store = Arc::new(MemStore::default());
        let buffer = WriteBuffer::new(
            Arc::clone(&store) as Arc<dyn PhysicalStore>,
            &WriteBufferConfig { workers: 0 },
        );
        (buffer, store)
    }

    fn record(slot: u64, payload: &[u8]) -> EntryRecord {
        EntryRecord::new(Oid::new(0, slot), 1, payload.to_vec(), 0)
    }

    #[test]
    fn test_merge_coalesces_to_one_flush() {
        let (buffer, store) = manual_buffer();
        let oid = Oid::new(0, 1);
        buffer.push(oid, Some(record(1, b"v1")), WriteState::New);
        buffer.push(oid, Some(record(1, b"v2")), WriteState::Updated);
        assert_eq!(buffer.pending_len(), 1);
        buffer.run_pending();
        // New + Updated merges to New carrying the latest payload.
        assert_eq!(store.calls(), vec!["insert 0:1 [118, 50]"]);
        assert!(!buffer.has_pending(oid));
    }

    #[test]
    fn test_new_then_deleted_is_elided() {
        let (buffer, store) = manual_buffer();
        let oid = Oid::new(0, 2);
        buffer.push(oid, Some(record(2, b"x")), WriteState::New);
        buffer.push(oid, None, WriteState::Deleted);
        assert_eq!(buffer.dirty_read(oid), Some(Buffered::Deleted));
        buffer.run_pending();
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_flushed_then_deleted_hits_disk() {
        let (buffer, store) = manual_buffer();
        let oid = Oid::new(0, 3);
        buffer.push(oid, Some(record(3, b"x")), WriteState::New);
        buffer.run_pending();
        buffer.push(oid, None, WriteState::Deleted);
        buffer.run_pending();
        assert_eq!(store.calls(), vec!["insert 0:3 [120]", "delete 0:3"]);
    }

    #[test]
    fn test_dirty_read_sees_latest_buffered_payload() {
        let (buffer, _) = manual_buffer();
        let oid = Oid::new(0, 4);
        buffer.push(oid, Some(record(4, b"old")), WriteState::New);
        buffer.push(oid, Some(record(4, b"new")), WriteState::Updated);
        match buffer.dirty_read(oid) {
            Some(Buffered::Record(rec)) => assert_eq!(rec.payload, b"new"),
            other => panic!("unexpected dirty read: {other:?}"),
        }
        assert_eq!(buffer.dirty_read(Oid::new(9, 9)), None);
    }

    #[test]
    fn test_merge_table() {
        use WriteState::{Deleted, New, NewDeleted, Updated};
        assert_eq!(New.merge(Updated), New);
        assert_eq!(New.merge(Deleted), NewDeleted);
        assert_eq!(Updated.merge(Deleted), Deleted);
        assert_eq!(Updated.merge(Updated), Updated);
        assert_eq!(Deleted.merge(New), Updated);
        assert_eq!(NewDeleted.merge(New), New);
        assert_eq!(FlushAction::Elide, NewDeleted.action());
    }

    /// Store whose first insert blocks until released, to freeze a flush
    /// mid-write.
    struct GatedStore {
        delegate: MemStore,
        started: AtomicBool,
        release: PMutex<bool>,
        released: Condvar,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                delegate: MemStore::default(),
                started: AtomicBool::new(false),
                release: PMutex::new(false),
                released: Condvar::new(),
            }
        }

        fn release(&self) {
            *self.release.lock() = true;
            self.released.notify_all();
        }

        fn wait_started(&self) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.started.load(Ordering::Acquire) {
                assert!(Instant::now() < deadline, "flush never started");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }

    impl PhysicalStore for GatedStore {
        fn insert(&self, record: &EntryRecord) -> Result<()> {
            self.started.store(true, Ordering::Release);
            let mut release = self.release.lock();
            while !*release {
                self.released.wait(&mut release);
            }
            drop(release);
            self.delegate.insert(record)
        }
        fn update(&self, record: &EntryRecord) -> Result<()> {
            self.delegate.update(record)
        }
        fn delete(&self, oid: Oid) -> Result<()> {
            self.delegate.delete(oid)
        }
        fn load(&self, oid: Oid) -> Result<Option<EntryRecord>> {
            self.delegate.load(oid)
        }
        fn scan(&self) -> Result<Vec<EntryRecord>> {
            self.delegate.scan()
        }
    }

    #[test]
    fn test_push_during_flush_queues_behind_it() {
        let store = Arc::new(GatedStore::new());
        let buffer = WriteBuffer::new(
            Arc::clone(&store) as Arc<dyn PhysicalStore>,
            &WriteBufferConfig { workers: 1 },
        );
        let oid = Oid::new(0, 5);
        buffer.push(oid, Some(record(5, b"v1")), WriteState::New);
        store.wait_started();

        // The in-flight request cannot absorb this; it must queue behind.
        buffer.push(oid, Some(record(5, b"v2")), WriteState::Updated);
        store.release();
        drop(buffer); // joins the worker and drains

        assert_eq!(
            store.delegate.calls(),
            vec!["insert 0:5 [118, 49]", "update 0:5 [118, 50]"]
        );
    }

    #[test]
    fn test_flushed_hook_fires_when_queue_drains() {
        let (buffer, _) = manual_buffer();
        let drained: Arc<PMutex<Vec<Oid>>> = Arc::default();
        let sink = Arc::clone(&drained);
        buffer.set_flushed_hook(Box::new(move |oid| sink.lock().push(oid)));

        let oid = Oid::new(0, 6);
        buffer.push(oid, Some(record(6, b"x")), WriteState::New);
        buffer.push(oid, Some(record(6, b"y")), WriteState::Updated);
        buffer.run_pending();
        assert_eq!(drained.lock().as_slice(), &[oid]);
    }

    #[test]
    fn test_parked_request_waits_for_unpark() {
        let (buffer, store) = manual_buffer();
        let oid = Oid::new(0, 8);
        buffer.park(oid, Some(record(8, b"held")), WriteState::Updated);

        // Parked requests never enter the flush queues.
        buffer.run_pending();
        assert!(store.calls().is_empty());
        assert!(buffer.has_parked(oid));

        // But a dirty read still sees the newest state.
        match buffer.dirty_read(oid) {
            Some(Buffered::Record(rec)) => assert_eq!(rec.payload, b"held"),
            other => panic!("unexpected dirty read: {other:?}"),
        }

        assert!(buffer.unpark(oid));
        assert!(!buffer.has_parked(oid));
        buffer.run_pending();
        assert_eq!(store.calls(), vec!["update 0:8 [104, 101, 108, 100]"]);
    }

    #[test]
    fn test_parked_request_supersedes_queued_one() {
        let (buffer, _) = manual_buffer();
        let oid = Oid::new(0, 9);
        buffer.push(oid, Some(record(9, b"old")), WriteState::New);
        buffer.park(oid, Some(record(9, b"new")), WriteState::Updated);
        match buffer.dirty_read(oid) {
            Some(Buffered::Record(rec)) => assert_eq!(rec.payload, b"new"),
            other => panic!("unexpected dirty read: {other:?}"),
        }
    }

    #[test]
    fn test_flush_all_writes_parked_without_releasing() {
        let (buffer, store) = manual_buffer();
        let queued = Oid::new(0, 10);
        let parked = Oid::new(0, 11);
        buffer.push(queued, Some(record(10, b"q")), WriteState::New);
        buffer.park(parked, Some(record(11, b"p")), WriteState::Updated);

        buffer.flush_all().expect("flush all");
        assert_eq!(
            store.calls(),
            vec!["insert 0:10 [113]", "update 0:11 [112]"]
        );
        // The pin still owns the parked copy.
        assert!(buffer.has_parked(parked));
        assert!(!buffer.has_pending(queued));
    }

    #[test]
    fn test_drop_drains_workerless_buffer() {
        let store = Arc::new(MemStore::default());
        {
            let buffer = WriteBuffer::new(
                Arc::clone(&store) as Arc<dyn PhysicalStore>,
                &WriteBufferConfig { workers: 0 },
            );
            buffer.push(Oid::new(0, 7), Some(record(7, b"z")), WriteState::New);
        }
        assert_eq!(store.calls(), vec!["insert 0:7 [122]"]);
    }
}
