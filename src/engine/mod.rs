mod bookings;
mod compaction;
mod error;
mod holds;
mod ledger;
mod queries;
mod rooms;
mod sweeps;

pub use bookings::{Cancellation, NewBooking, NewDetail, refund_amount};
pub use error::{AllotmentViolation, EngineError, ErrorClass};
pub use holds::HoldReceipt;
pub use queries::{RoomOffer, SearchQuery, SearchResult};
pub use rooms::CheckInReceipt;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard,
};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedPartition = Arc<RwLock<LedgerPartition>>;
pub type SharedBooking = Arc<Mutex<BookingRecord>>;
pub type SharedRoom = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        commits: Vec<Commit>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let written = batch
        .iter()
        .try_for_each(|(commit, _)| wal.append_buffered(commit))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = written {
        // Every caller in the batch hears Err, so none of it may replay.
        if let Err(rollback_err) = wal.rollback() {
            tracing::error!("wal rollback after failed batch: {rollback_err}");
        }
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { commits, response } => {
            let result = Wal::write_compact_file(wal.path(), &commits)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// Owns every piece of mutable hotel state.
///
/// Lock order, always: commit gate (shared) → booking → ledger partitions
/// (ascending room type) → rooms (ascending room id). A mutation builds its
/// events while holding the locks, appends them to the WAL as one commit,
/// and only then applies them.
pub struct Engine {
    pub(super) ledger: DashMap<RoomTypeId, SharedPartition>,
    pub(super) bookings: DashMap<BookingId, SharedBooking>,
    pub(super) rooms: DashMap<RoomId, SharedRoom>,
    pub(super) voucher_usage: DashMap<String, u32>,
    /// Reverse lookups: detail / assignment id → booking id
    pub(super) detail_to_booking: DashMap<Ulid, BookingId>,
    pub(super) assignment_to_booking: DashMap<Ulid, BookingId>,
    /// Held shared by every mutation, exclusively by compaction.
    pub(super) gate: RwLock<()>,
    /// Serializes voucher usage increments.
    pub(super) voucher_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub catalog: Arc<Catalog>,
    pub clock: Arc<dyn Clock>,
}

/// Locks held by one in-flight mutation.
pub(super) struct Txn<'a> {
    _gate: RwLockReadGuard<'a, ()>,
    pub booking: Option<OwnedMutexGuard<BookingRecord>>,
    pub partitions: BTreeMap<RoomTypeId, OwnedRwLockWriteGuard<LedgerPartition>>,
    pub rooms: BTreeMap<RoomId, OwnedRwLockWriteGuard<RoomState>>,
}

impl Txn<'_> {
    pub fn booking(&self) -> Result<&BookingRecord, EngineError> {
        self.booking
            .as_deref()
            .ok_or_else(|| EngineError::Inconsistent("booking not locked".into()))
    }

    pub fn partition(&self, id: RoomTypeId) -> Result<&LedgerPartition, EngineError> {
        self.partitions
            .get(&id)
            .map(|g| &**g)
            .ok_or_else(|| EngineError::Inconsistent(format!("partition {id} not locked")))
    }

    pub fn room(&self, id: RoomId) -> Result<&RoomState, EngineError> {
        self.rooms
            .get(&id)
            .map(|g| &**g)
            .ok_or_else(|| EngineError::not_found("room", id))
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<Catalog>,
        clock: Arc<dyn Clock>,
        notify: Arc<NotifyHub>,
    ) -> io::Result<Self> {
        let commits = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            ledger: DashMap::new(),
            bookings: DashMap::new(),
            rooms: DashMap::new(),
            voucher_usage: DashMap::new(),
            detail_to_booking: DashMap::new(),
            assignment_to_booking: DashMap::new(),
            gate: RwLock::new(()),
            voucher_lock: Mutex::new(()),
            wal_tx,
            notify,
            catalog,
            clock,
        };

        for rt in engine.catalog.room_types.values() {
            let partition = LedgerPartition::new(rt.id, rt.default_allotment);
            engine.ledger.insert(rt.id, Arc::new(RwLock::new(partition)));
        }
        for room in engine.catalog.rooms.values() {
            let state = RoomState::new(room.id, room.number.clone(), room.room_type_id);
            engine.rooms.insert(room.id, Arc::new(RwLock::new(state)));
        }

        // We're the sole owner of these Arcs, so try_write/try_lock always
        // succeed instantly. Never block here: this may run inside an async context.
        let mut replayed = 0usize;
        for commit in &commits {
            for event in commit {
                engine.replay_event(event);
            }
            replayed += 1;
        }
        if replayed > 0 {
            tracing::info!("replayed {replayed} commits from {}", wal_path.display());
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event.target() {
            EventTarget::Partition(id) => match self.partition(id) {
                Some(p) => p.try_write().expect("replay: uncontended write").apply(event),
                None => tracing::warn!("replay: skipping event for unknown room type {id}"),
            },
            EventTarget::Booking(id) => match self.booking_handle(&id) {
                Some(b) => b.try_lock().expect("replay: uncontended lock").apply(event),
                None => {
                    if let Event::BookingCreated { booking } = event {
                        self.insert_booking(booking.clone());
                    }
                }
            },
            EventTarget::Room(id) => match self.room_handle(id) {
                Some(r) => r.try_write().expect("replay: uncontended write").apply(event),
                None => tracing::warn!("replay: skipping event for unknown room {id}"),
            },
            EventTarget::Voucher(_) => self.apply_voucher(event),
        }
        self.index(event);
    }

    fn insert_booking(&self, booking: Booking) {
        let id = booking.id;
        self.bookings
            .insert(id, Arc::new(Mutex::new(BookingRecord::new(booking))));
    }

    fn apply_voucher(&self, event: &Event) {
        if let Event::VoucherUsed { code, used_count } = event {
            self.voucher_usage.insert(code.clone(), *used_count);
        }
    }

    fn index(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                for detail in &booking.details {
                    self.detail_to_booking.insert(detail.id, booking.id);
                }
            }
            Event::AssignmentOpened { assignment } => {
                self.assignment_to_booking
                    .insert(assignment.id, assignment.booking_id);
            }
            _ => {}
        }
    }

    pub fn partition(&self, id: RoomTypeId) -> Option<SharedPartition> {
        self.ledger.get(&id).map(|e| e.value().clone())
    }

    pub fn booking_handle(&self, id: &BookingId) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn room_handle(&self, id: RoomId) -> Option<SharedRoom> {
        self.rooms.get(&id).map(|e| e.value().clone())
    }

    // ── Transactions ─────────────────────────────────────

    pub(super) async fn begin(&self) -> Txn<'_> {
        Txn {
            _gate: self.gate.read().await,
            booking: None,
            partitions: BTreeMap::new(),
            rooms: BTreeMap::new(),
        }
    }

    pub(super) async fn lock_booking(
        &self,
        txn: &mut Txn<'_>,
        id: BookingId,
    ) -> Result<(), EngineError> {
        debug_assert!(txn.booking.is_none() && txn.partitions.is_empty() && txn.rooms.is_empty());
        let handle = self
            .booking_handle(&id)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        txn.booking = Some(handle.lock_owned().await);
        Ok(())
    }

    /// Write-lock partitions in ascending room type order.
    pub(super) async fn lock_partitions(
        &self,
        txn: &mut Txn<'_>,
        ids: impl IntoIterator<Item = RoomTypeId>,
    ) -> Result<(), EngineError> {
        debug_assert!(txn.partitions.is_empty() && txn.rooms.is_empty());
        let mut ids: Vec<RoomTypeId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            let handle = self
                .partition(id)
                .ok_or_else(|| EngineError::not_found("room type", id))?;
            txn.partitions.insert(id, handle.write_owned().await);
        }
        Ok(())
    }

    /// Write-lock rooms in ascending room id order.
    pub(super) async fn lock_rooms(
        &self,
        txn: &mut Txn<'_>,
        ids: impl IntoIterator<Item = RoomId>,
    ) -> Result<(), EngineError> {
        debug_assert!(txn.rooms.is_empty());
        let mut ids: Vec<RoomId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            let handle = self
                .room_handle(id)
                .ok_or_else(|| EngineError::not_found("room", id))?;
            txn.rooms.insert(id, handle.write_owned().await);
        }
        Ok(())
    }

    /// Write commit to WAL via the background group-commit writer.
    async fn wal_append(&self, commit: &Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                commit: commit.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, apply and notify. Nothing is applied unless the append succeeds.
    pub(super) async fn commit(&self, txn: &mut Txn<'_>, commit: Commit) -> Result<(), EngineError> {
        if commit.is_empty() {
            return Ok(());
        }
        self.wal_append(&commit).await?;
        for event in &commit {
            self.apply_locked(txn, event);
            if let EventTarget::Partition(room_type_id) = event.target() {
                self.notify.send(room_type_id, event);
            }
        }
        metrics::counter!(crate::observability::COMMITS_TOTAL).increment(1);
        Ok(())
    }

    fn apply_locked(&self, txn: &mut Txn<'_>, event: &Event) {
        match event.target() {
            EventTarget::Partition(id) => match txn.partitions.get_mut(&id) {
                Some(guard) => guard.apply(event),
                None => tracing::error!("commit touched unlocked partition {id}"),
            },
            EventTarget::Booking(id) => match txn.booking.as_mut() {
                Some(guard) if guard.booking.id == id => guard.apply(event),
                _ => match event {
                    Event::BookingCreated { booking } => self.insert_booking(booking.clone()),
                    _ => tracing::error!("commit touched unlocked booking {id}"),
                },
            },
            EventTarget::Room(id) => match txn.rooms.get_mut(&id) {
                Some(guard) => guard.apply(event),
                None => tracing::error!("commit touched unlocked room {id}"),
            },
            EventTarget::Voucher(_) => self.apply_voucher(event),
        }
        self.index(event);
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
