use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;

use crate::limits::*;
use crate::model::*;
use crate::observability::CACHE_INVALIDATIONS_TOTAL;
use crate::policy::{namespace_of, validate_setting, Setting, SettingValue, POLICY_NAMESPACE};

use super::conflict::validate_room;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_room(&self, room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let _meta = self.meta_lock.lock().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }

        let id = room.id;
        let event = Event::RoomCreated { room: room.clone() };
        self.wal_append(&event).await?;
        self.rooms.insert(id, Arc::new(RwLock::new(RoomState::new(room))));
        self.notify.send(id, &event);
        info!(room = %id, "room created");
        Ok(())
    }

    /// Replace a room's descriptive fields and constraints. The active flag is
    /// left alone; use `set_room_active` for that.
    pub async fn update_room(&self, mut room: Room) -> Result<(), EngineError> {
        validate_room(&room)?;
        let mut guard = self.write_room(room.id).await?;
        room.active = guard.room.active;
        if guard.room == room {
            return Ok(());
        }
        let event = Event::RoomUpdated { room };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(room = %guard.room.id, "room updated");
        Ok(())
    }

    /// Soft enable/disable. Existing bookings are kept either way.
    pub async fn set_room_active(&self, id: RoomId, active: bool) -> Result<(), EngineError> {
        let mut guard = self.write_room(id).await?;
        if guard.room.active == active {
            return Ok(());
        }
        let event = Event::RoomActiveSet { id, active };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(room = %id, active, "room active flag changed");
        Ok(())
    }

    /// Write one setting. A write under `reservations.` invalidates the policy
    /// snapshot and every cached availability answer.
    pub async fn set_setting(&self, key: &str, value: SettingValue) -> Result<(), EngineError> {
        if key.len() > MAX_SETTING_KEY_LEN {
            return Err(EngineError::LimitExceeded("setting key too long"));
        }
        if value.to_string().len() > MAX_SETTING_VALUE_LEN {
            return Err(EngineError::LimitExceeded("setting value too large"));
        }
        validate_setting(key, &value).map_err(EngineError::InvalidSetting)?;

        let _meta = self.meta_lock.lock().await;
        let event = Event::SettingChanged {
            key: key.to_string(),
            setting: Setting::new(key, value),
        };
        self.wal_append(&event).await?;
        self.apply_engine_wide(&event);

        if self.policy_cache.invalidate_for_key(key) {
            metrics::counter!(CACHE_INVALIDATIONS_TOTAL, "cache" => "policy").increment(1);
        }
        if namespace_of(key) == POLICY_NAMESPACE {
            let dropped = self.availability_cache.len();
            self.availability_cache.clear();
            metrics::counter!(CACHE_INVALIDATIONS_TOTAL, "cache" => "availability").increment(dropped as u64);
        }
        info!(key, "setting changed");
        Ok(())
    }

    /// Returns false if the room was already a favorite.
    pub async fn add_favorite(&self, user_id: UserId, room_id: RoomId) -> Result<bool, EngineError> {
        if !self.rooms.contains_key(&room_id) {
            return Err(EngineError::NotFound(room_id));
        }
        let _meta = self.meta_lock.lock().await;
        if let Some(favs) = self.favorites.get(&user_id) {
            if favs.contains(&room_id) {
                return Ok(false);
            }
            if favs.len() >= MAX_FAVORITES_PER_USER {
                return Err(EngineError::LimitExceeded("too many favorites"));
            }
        }
        let event = Event::FavoriteAdded { user_id, room_id };
        self.wal_append(&event).await?;
        self.apply_engine_wide(&event);
        Ok(true)
    }

    /// Returns false if the room was not a favorite.
    pub async fn remove_favorite(&self, user_id: UserId, room_id: RoomId) -> Result<bool, EngineError> {
        let _meta = self.meta_lock.lock().await;
        let present = self
            .favorites
            .get(&user_id)
            .is_some_and(|favs| favs.contains(&room_id));
        if !present {
            return Ok(false);
        }
        let event = Event::FavoriteRemoved { user_id, room_id };
        self.wal_append(&event).await?;
        self.apply_engine_wide(&event);
        Ok(true)
    }

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    /// Holds the engine-wide lock and a read lock on every room (in id order)
    /// while the snapshot is written, so no acknowledged write is lost.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _meta = self.meta_lock.lock().await;

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort();
        let mut guards = Vec::with_capacity(room_ids.len());
        for id in &room_ids {
            guards.push(self.read_room(*id).await?);
        }

        let mut events = Vec::new();
        for entry in self.settings.iter() {
            events.push(Event::SettingChanged {
                key: entry.key().clone(),
                setting: entry.value().clone(),
            });
        }
        for guard in &guards {
            events.push(Event::RoomCreated { room: guard.room.clone() });
            for booking in guard.iter_bookings() {
                events.push(Event::BookingConfirmed { booking: booking.clone() });
            }
        }
        for entry in self.favorites.iter() {
            for room_id in entry.value() {
                events.push(Event::FavoriteAdded {
                    user_id: *entry.key(),
                    room_id: *room_id,
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        info!(events = count, "WAL compacted");
        Ok(())
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
