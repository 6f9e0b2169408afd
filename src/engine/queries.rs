use chrono::NaiveDate;

use crate::model::*;
use crate::policy::Setting;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_room(&self, id: RoomId) -> Result<Room, EngineError> {
        let guard = self.read_room(id).await?;
        Ok(guard.room.clone())
    }

    /// Rooms ordered by floor, then name. Inactive rooms only on request.
    pub async fn list_rooms(&self, include_inactive: bool) -> Result<Vec<Room>, EngineError> {
        let ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut rooms = Vec::with_capacity(ids.len());
        for id in ids {
            let guard = self.read_room(id).await?;
            if include_inactive || guard.room.active {
                rooms.push(guard.room.clone());
            }
        }
        rooms.sort_by(|a, b| a.floor.cmp(&b.floor).then_with(|| a.name.cmp(&b.name)));
        Ok(rooms)
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let at = self.locate_booking(&id).ok_or(EngineError::NotFound(id))?;
        let guard = self.read_room(at.room_id).await?;
        guard
            .bookings_on(at.date)
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// A room's bookings on one day, ordered by start time.
    pub async fn bookings_for_room(&self, room_id: RoomId, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let guard = self.read_room(room_id).await?;
        Ok(guard.bookings_on(date).to_vec())
    }

    /// Every active booking held by `requester_id`, from `from` onwards,
    /// ordered by date then start time.
    pub async fn bookings_for_requester(
        &self,
        requester_id: UserId,
        from: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        let mut out = Vec::new();
        for id in ids {
            let guard = self.read_room(id).await?;
            out.extend(
                guard
                    .iter_bookings()
                    .filter(|b| b.requester_id == requester_id && from.is_none_or(|d| b.date >= d))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| (b.date, b.span.start));
        Ok(out)
    }

    pub fn get_setting(&self, key: &str) -> Option<Setting> {
        self.settings.get(key).map(|e| e.value().clone())
    }

    /// Settings sorted by key, optionally restricted to one group.
    pub fn list_settings(&self, group: Option<&str>) -> Vec<(String, Setting)> {
        let mut out: Vec<(String, Setting)> = self
            .settings
            .iter()
            .filter(|e| group.is_none_or(|g| e.value().group == g))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn favorites(&self, user_id: UserId) -> Vec<RoomId> {
        let mut out: Vec<RoomId> = self
            .favorites
            .get(&user_id)
            .map(|f| f.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn booking_count(&self) -> usize {
        self.booking_index.len()
    }
}
