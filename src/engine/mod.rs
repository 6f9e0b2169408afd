mod admission;
mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{AvailabilityQuery, RoomAvailability};
pub use conflict::find_conflicts;
pub use error::{EngineError, ValidationError};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, warn};

use crate::cache::{AvailabilityCache, PolicyCache};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::policy::{GlobalPolicy, Setting};
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Where an active booking currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BookingLocation {
    pub room_id: RoomId,
    pub date: NaiveDate,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then write
/// the whole batch with a single fsync and answer every sender.
///
/// A failed batch is cut out of the log before its senders hear back. If that
/// cut fails too the log tail is unknown, and the writer refuses everything
/// from then on.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut stopped = false;
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd, stopped);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        let result = if stopped {
            Err(writer_stopped())
        } else {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
            let flush_start = std::time::Instant::now();
            let outcome = flush_batch(&mut wal, &batch);
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            outcome.map_err(|failure| {
                match failure.rollback_error {
                    None => warn!(error = %failure.error, batch = batch.len(), "WAL batch failed, rolled back"),
                    Some(rollback) => {
                        stopped = true;
                        error!(error = %failure.error, %rollback, "WAL rollback failed, refusing further writes");
                    }
                }
                failure.error
            })
        };
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd, stopped);
        }
    }
    debug!("WAL writer stopped");
}

fn writer_stopped() -> io::Error {
    io::Error::other("WAL writer stopped after a failed rollback")
}

#[derive(Debug)]
struct BatchFailure {
    error: io::Error,
    /// Set when the log could not be cut back and may still hold part of the batch.
    rollback_error: Option<io::Error>,
}

/// Write a batch with one fsync. On failure the log is truncated to where the
/// batch began, so replay never sees an event whose sender was told it failed.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> Result<(), BatchFailure> {
    let mark = wal.mark().map_err(|error| BatchFailure {
        error,
        rollback_error: None,
    })?;
    let written = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    let Err(error) = written else {
        return Ok(());
    };
    Err(BatchFailure {
        error,
        rollback_error: wal.rollback_to(mark).err(),
    })
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand, stopped: bool) {
    match cmd {
        WalCommand::Compact { response, .. } if stopped => {
            let _ = response.send(Err(writer_stopped()));
        }
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// The booking admission engine: rooms, bookings, settings and favorites held
/// in memory, every change made durable through the WAL before it is applied.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    /// Reverse lookup: booking id → its room and date.
    pub(super) booking_index: DashMap<BookingId, BookingLocation>,
    pub(super) favorites: DashMap<UserId, HashSet<RoomId>>,
    pub(super) settings: DashMap<String, Setting>,
    pub(super) policy_cache: PolicyCache,
    pub(super) availability_cache: AvailabilityCache<RoomAvailability>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes engine-wide writes (room creation, settings, favorites)
    /// against compaction. Room-scoped writes are covered by the room locks.
    pub(super) meta_lock: Mutex<()>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: EngineConfig,
}

/// Apply a room-scoped event to one room's state (caller holds the write lock).
/// A booking moved between rooms is applied to both: removed from the old, inserted in the new.
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<BookingId, BookingLocation>) {
    match event {
        Event::RoomUpdated { room } => rs.room = room.clone(),
        Event::RoomActiveSet { active, .. } => rs.room.active = *active,
        Event::BookingConfirmed { booking } => {
            index.insert(booking.id, BookingLocation { room_id: booking.room_id, date: booking.date });
            rs.insert_booking(booking.clone());
        }
        Event::BookingUpdated {
            previous_room_id,
            previous_date,
            booking,
        } => {
            if rs.room.id == *previous_room_id {
                rs.remove_booking(booking.id, *previous_date);
            }
            if rs.room.id == booking.room_id {
                index.insert(booking.id, BookingLocation { room_id: booking.room_id, date: booking.date });
                rs.insert_booking(booking.clone());
            }
        }
        Event::BookingCancelled { id, date, .. } => {
            rs.remove_booking(*id, *date);
            index.remove(id);
        }
        // Engine-wide events are applied at the map level, not here.
        Event::RoomCreated { .. }
        | Event::SettingChanged { .. }
        | Event::FavoriteAdded { .. }
        | Event::FavoriteRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            booking_index: DashMap::new(),
            favorites: DashMap::new(),
            settings: DashMap::new(),
            policy_cache: PolicyCache::new(config.policy_cache_ttl),
            availability_cache: AvailabilityCache::new(config.availability_cache_ttl),
            wal_tx,
            meta_lock: Mutex::new(()),
            notify,
            clock,
            config,
        };

        // Sole owner of every Arc during replay: try_write cannot contend.
        // Never block here, this may run inside an async context.
        for event in &events {
            if engine.apply_engine_wide(event) {
                continue;
            }
            for room_id in event.room_ids() {
                if let Some(rs) = engine.room(&room_id) {
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    apply_to_room(&mut guard, event, &engine.booking_index);
                }
            }
        }
        debug!(events = events.len(), rooms = engine.rooms.len(), "WAL replayed");

        Ok(engine)
    }

    /// Apply events that live outside any room. Returns false for room-scoped events.
    pub(super) fn apply_engine_wide(&self, event: &Event) -> bool {
        match event {
            Event::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::SettingChanged { key, setting } => {
                self.settings.insert(key.clone(), setting.clone());
            }
            Event::FavoriteAdded { user_id, room_id } => {
                self.favorites.entry(*user_id).or_default().insert(*room_id);
            }
            Event::FavoriteRemoved { user_id, room_id } => {
                if let Some(mut favs) = self.favorites.get_mut(user_id) {
                    favs.remove(room_id);
                }
            }
            _ => return false,
        }
        true
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub(super) fn locate_booking(&self, id: &BookingId) -> Option<BookingLocation> {
        self.booking_index.get(id).map(|e| *e.value())
    }

    /// Shared lock on a room, waiting at most `lock_timeout`.
    pub(super) async fn read_room(&self, id: RoomId) -> Result<OwnedRwLockReadGuard<RoomState>, EngineError> {
        let rs = self.room(&id).ok_or(EngineError::NotFound(id))?;
        tokio::time::timeout(self.config.lock_timeout, rs.read_owned())
            .await
            .map_err(|_| self.lock_timed_out(id))
    }

    /// Exclusive lock on a room, waiting at most `lock_timeout`.
    pub(super) async fn write_room(&self, id: RoomId) -> Result<OwnedRwLockWriteGuard<RoomState>, EngineError> {
        let rs = self.room(&id).ok_or(EngineError::NotFound(id))?;
        tokio::time::timeout(self.config.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| self.lock_timed_out(id))
    }

    fn lock_timed_out(&self, id: RoomId) -> EngineError {
        metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
        tracing::warn!(room = %id, "room lock wait timed out");
        EngineError::LockTimeout(id)
    }

    /// Apply a durable event to a locked room, then fan out: notify listeners
    /// and drop the room's cached availability answers.
    pub(super) fn apply_committed(&self, rs: &mut RoomState, event: &Event) {
        let room_id = rs.room.id;
        apply_to_room(rs, event, &self.booking_index);
        self.notify.send(room_id, event);
        let dropped = self.availability_cache.invalidate_room(room_id);
        if dropped > 0 {
            metrics::counter!(crate::observability::CACHE_INVALIDATIONS_TOTAL, "cache" => "availability")
                .increment(dropped as u64);
        }
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(&self, rs: &mut RoomState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_committed(rs, event);
        Ok(())
    }

    /// Current site-wide policy, read through the policy cache.
    pub fn policy(&self) -> GlobalPolicy {
        self.policy_cache.get_or_load(|| {
            let snapshot: HashMap<String, Setting> = self
                .settings
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            GlobalPolicy::from_settings(&snapshot)
        })
    }

    /// TTL backstop for entries no write happened to invalidate.
    pub fn purge_expired_caches(&self) -> usize {
        self.policy_cache.purge_expired() + self.availability_cache.purge_expired()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }
}
