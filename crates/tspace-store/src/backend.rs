//! The entry store: in-memory sleeves over physical storage, with write-back
//! scheduling and transactional staging.
//!
//! Visibility lives here. Entries written under an open transaction sit in
//! the pending table until the transaction commits; entries taken under an
//! open transaction move to the held table and either disappear (commit) or
//! reappear exactly once (abort). The transaction layer drives these
//! transitions through the [`EntryBackend`] seam.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use tspace_error::Result;
use tspace_txn::EntryBackend;
use tspace_types::{EntryRecord, Oid, Sleeve, SleeveState};

use crate::writeback::{Buffered, PhysicalStore, WriteBuffer, WriteBufferConfig, WriteState};

/// Committed-visible entry storage backed by a physical store.
pub struct StoreBackend {
    store: Arc<dyn PhysicalStore>,
    buffer: WriteBuffer,
    /// Committed, observable entries.
    sleeves: Arc<Mutex<HashMap<Oid, Sleeve>>>,
    /// Written under a still-open transaction; not yet observable.
    pending: Mutex<HashMap<Oid, EntryRecord>>,
    /// Taken under a still-open transaction; kept for abort.
    held: Mutex<HashMap<Oid, EntryRecord>>,
}

impl StoreBackend {
    /// Warm-start from physical storage: every stored record becomes a clean
    /// sleeve.
    pub fn open(store: Arc<dyn PhysicalStore>, config: &WriteBufferConfig) -> Result<Arc<Self>> {
        let sleeves: HashMap<Oid, Sleeve> = store
            .scan()?
            .into_iter()
            .map(|record| (record.oid, Sleeve::new(record, SleeveState::Clean)))
            .collect();
        debug!(entries = sleeves.len(), "entry store warm-started");

        let sleeves = Arc::new(Mutex::new(sleeves));
        let buffer = WriteBuffer::new(Arc::clone(&store), config);
        let hook_sleeves = Arc::clone(&sleeves);
        buffer.set_flushed_hook(Box::new(move |oid| {
            let mut sleeves = hook_sleeves.lock();
            if let Some(sleeve) = sleeves.get_mut(&oid) {
                if sleeve.state.can_become(SleeveState::Clean) {
                    sleeve.state = SleeveState::Clean;
                }
            }
        }));

        Ok(Arc::new(Self {
            store,
            buffer,
            sleeves,
            pending: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
        }))
    }

    // -----------------------------------------------------------------------
    // Space-layer staging
    // -----------------------------------------------------------------------

    /// Stage a write under an open transaction. The entry is not observable
    /// until the transaction commits.
    pub fn stage_write(&self, record: EntryRecord) {
        self.pending.lock().insert(record.oid, record);
    }

    /// Stage a take under an open transaction: the entry leaves visibility
    /// now; the transactional outcome decides whether it returns.
    pub fn stage_take(&self, oid: Oid) -> Option<EntryRecord> {
        let sleeve = self.sleeves.lock().remove(&oid)?;
        self.held.lock().insert(oid, sleeve.record.clone());
        Some(sleeve.record)
    }

    /// A committed-visible entry.
    #[must_use]
    pub fn read(&self, oid: Oid) -> Option<EntryRecord> {
        self.sleeves.lock().get(&oid).map(|s| s.record.clone())
    }

    #[must_use]
    pub fn visible_count(&self) -> usize {
        self.sleeves.lock().len()
    }

    /// Pin an entry against eviction while a holder works on it.
    pub fn pin(&self, oid: Oid) -> bool {
        let mut sleeves = self.sleeves.lock();
        let Some(sleeve) = sleeves.get_mut(&oid) else {
            return false;
        };
        let pinned = if sleeve.state.is_dirty() {
            SleeveState::PinnedDirty
        } else {
            SleeveState::PinnedClean
        };
        if sleeve.state.is_pinned() || sleeve.state.can_become(pinned) {
            sleeve.state = pinned;
            true
        } else {
            false
        }
    }

    /// Release a pin. A pinned-dirty sleeve goes back to dirty-updated so the
    /// flush hook can clean it later. If the sleeve was evicted while pinned,
    /// its parked change enters the flush queues now.
    pub fn unpin(&self, oid: Oid) {
        {
            let mut sleeves = self.sleeves.lock();
            if let Some(sleeve) = sleeves.get_mut(&oid) {
                sleeve.state = match sleeve.state {
                    SleeveState::PinnedClean => SleeveState::Clean,
                    SleeveState::PinnedDirty => SleeveState::DirtyUpdated,
                    other => other,
                };
                return;
            }
        }
        self.buffer.unpark(oid);
    }

    /// Drop a sleeve from memory; the record stays reachable through physical
    /// load. A clean sleeve is simply removed. A pinned-dirty sleeve parks
    /// its record in the write buffer, to be scheduled when the pin is
    /// released. Unpinned dirty sleeves are refused: the flush already
    /// scheduled will clean them shortly.
    pub fn evict(&self, oid: Oid) -> bool {
        let mut sleeves = self.sleeves.lock();
        match sleeves.get(&oid) {
            Some(sleeve) if sleeve.state == SleeveState::Clean => {
                sleeves.remove(&oid);
                true
            }
            Some(sleeve) if sleeve.state == SleeveState::PinnedDirty => {
                let record = sleeve.record.clone();
                sleeves.remove(&oid);
                // Updated is correct whether or not the entry reached disk:
                // an unflushed New ahead in the queue merges back to New.
                self.buffer.park(oid, Some(record), WriteState::Updated);
                true
            }
            _ => false,
        }
    }

    /// Reload an evicted entry from physical storage.
    pub fn fault_in(&self, oid: Oid) -> Result<Option<EntryRecord>> {
        if let Some(record) = self.read(oid) {
            return Ok(Some(record));
        }
        let Some(record) = self.store.load(oid)? else {
            return Ok(None);
        };
        self.sleeves
            .lock()
            .entry(oid)
            .or_insert_with(|| Sleeve::new(record.clone(), SleeveState::Clean));
        Ok(Some(record))
    }

    /// Drain the write buffer on the calling thread. Flush path for a
    /// worker-less buffer, and a barrier before orderly shutdown.
    pub fn flush_now(&self) {
        self.buffer.run_pending();
    }

    /// Flush everything buffered and return once physical storage holds it.
    /// The checkpoint installs this as its durability barrier: log segments
    /// covering these commits may be discarded only after it succeeds.
    pub fn flush_all(&self) -> Result<()> {
        self.buffer.flush_all()
    }

    /// A dirty read of the buffered state for `oid`, parked changes included.
    #[must_use]
    pub fn buffered(&self, oid: Oid) -> Option<Buffered> {
        self.buffer.dirty_read(oid)
    }

    #[must_use]
    pub fn unflushed(&self) -> usize {
        self.buffer.pending_len()
    }

    /// Every visible entry carrying a finite expiry, for rebuilding the
    /// lease index after a restart.
    #[must_use]
    pub fn leased_entries(&self) -> Vec<EntryRecord> {
        self.sleeves
            .lock()
            .values()
            .filter(|sleeve| sleeve.record.expiry_ms != 0)
            .map(|sleeve| sleeve.record.clone())
            .collect()
    }
}

impl EntryBackend for StoreBackend {
    fn commit_write(&self, record: &EntryRecord) -> Result<()> {
        self.pending.lock().remove(&record.oid);
        let state = if self.sleeves.lock().contains_key(&record.oid) {
            WriteState::Updated
        } else {
            WriteState::New
        };
        let sleeve_state = match state {
            WriteState::New => SleeveState::DirtyNew,
            _ => SleeveState::DirtyUpdated,
        };
        self.sleeves
            .lock()
            .insert(record.oid, Sleeve::new(record.clone(), sleeve_state));
        self.buffer.push(record.oid, Some(record.clone()), state);
        Ok(())
    }

    fn abort_write(&self, oid: Oid) -> Result<()> {
        // Never observable, never scheduled: dropping the staged copy is the
        // whole rollback.
        self.pending.lock().remove(&oid);
        Ok(())
    }

    fn commit_take(&self, oid: Oid) -> Result<()> {
        self.held.lock().remove(&oid);
        self.sleeves.lock().remove(&oid);
        self.buffer.push(oid, None, WriteState::Deleted);
        Ok(())
    }

    fn abort_take(&self, oid: Oid) -> Result<()> {
        let Some(record) = self.held.lock().remove(&oid) else {
            debug!(oid = %oid, "abort_take without a held entry");
            return Ok(());
        };
        // The take itself never touched the buffer; any dirtiness is from an
        // earlier unflushed write.
        let state = if self.buffer.has_pending(oid) {
            SleeveState::DirtyUpdated
        } else {
            SleeveState::Clean
        };
        self.sleeves
            .lock()
            .insert(oid, Sleeve::new(record, state));
        Ok(())
    }

    fn set_expiry(&self, oid: Oid, expiry_ms: u64) -> Result<()> {
        let record = {
            let mut sleeves = self.sleeves.lock();
            let Some(sleeve) = sleeves.get_mut(&oid) else {
                // The entry may have been taken between renewal and apply.
                debug!(oid = %oid, "set_expiry on absent entry");
                return Ok(());
            };
            sleeve.record.expiry_ms = expiry_ms;
            if sleeve.state == SleeveState::Clean {
                sleeve.state = SleeveState::DirtyUpdated;
            } else if sleeve.state == SleeveState::PinnedClean {
                sleeve.state = SleeveState::PinnedDirty;
            }
            sleeve.record.clone()
        };
        self.buffer.push(oid, Some(record), WriteState::Updated);
        Ok(())
    }

    fn restore_write(&self, record: &EntryRecord) -> Result<()> {
        // A prepared transaction's write is staged again, awaiting the
        // replayed or post-recovery outcome.
        self.pending.lock().insert(record.oid, record.clone());
        Ok(())
    }

    fn restore_take(&self, oid: Oid) -> Result<()> {
        if let Some(record) = self.store.load(oid)? {
            self.sleeves.lock().remove(&oid);
            self.held.lock().insert(oid, record);
        } else {
            // The taken entry's own insert never reached disk before the
            // crash; there is nothing to resurrect on abort.
            debug!(oid = %oid, "restore_take found nothing on disk");
        }
        Ok(())
    }
}
