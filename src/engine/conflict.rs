use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, ValidationError};

/// Bookings on `date` in this room that overlap `span`, minus the one being edited.
/// Returns the holders, not a flag, so callers can say who has the slot.
pub fn find_conflicts(rs: &RoomState, date: NaiveDate, span: &Span, exclude: Option<BookingId>) -> Vec<Booking> {
    rs.overlapping(date, span)
        .filter(|b| Some(b.id) != exclude)
        .cloned()
        .collect()
}

/// Shape checks that run before any evaluation.
pub(crate) fn validate_candidate(candidate: &Candidate, today: NaiveDate) -> Result<(), EngineError> {
    if candidate.span.end <= candidate.span.start {
        return Err(ValidationError::EndNotAfterStart {
            start: candidate.span.start,
            end: candidate.span.end,
        }
        .into());
    }
    if candidate.date < today && !candidate.requester.is_admin {
        return Err(ValidationError::PastDate(candidate.date).into());
    }
    if candidate.party_size == 0 {
        return Err(ValidationError::ZeroPartySize.into());
    }
    if candidate.party_size > MAX_PARTY_SIZE {
        return Err(EngineError::LimitExceeded("party size too large"));
    }
    if candidate.title.as_ref().is_some_and(|t| t.len() > MAX_TITLE_LEN) {
        return Err(ValidationError::TooLong("title").into());
    }
    if candidate
        .description
        .as_ref()
        .is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN)
    {
        return Err(ValidationError::TooLong("description").into());
    }
    if candidate.participants.len() > MAX_PARTICIPANTS {
        return Err(EngineError::LimitExceeded("too many participants"));
    }
    Ok(())
}

pub(crate) fn ensure_active(room: &Room) -> Result<(), EngineError> {
    if room.active {
        Ok(())
    } else {
        Err(ValidationError::RoomInactive(room.id).into())
    }
}

pub(crate) fn validate_room(room: &Room) -> Result<(), EngineError> {
    if room.name.trim().is_empty() {
        return Err(ValidationError::Invalid("room name must not be empty").into());
    }
    if room.name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong("room name").into());
    }
    if room.capacity == 0 {
        return Err(ValidationError::Invalid("room capacity must be positive").into());
    }
    if room.description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(ValidationError::TooLong("room description").into());
    }
    if room.equipment.len() > MAX_EQUIPMENT_ITEMS {
        return Err(EngineError::LimitExceeded("too many equipment items"));
    }
    if room.equipment.iter().any(|e| e.len() > MAX_EQUIPMENT_LEN) {
        return Err(ValidationError::TooLong("equipment name").into());
    }
    if let Some(c) = &room.constraints {
        validate_constraints(c)?;
    }
    Ok(())
}

fn validate_constraints(c: &ConstraintSet) -> Result<(), EngineError> {
    if let Some(days) = &c.days_allowed {
        if days.is_empty() {
            return Err(ValidationError::Invalid("days_allowed must not be empty").into());
        }
        if days.iter().any(|d| !(1..=7).contains(d)) {
            return Err(ValidationError::Invalid("days_allowed must be ISO weekdays 1-7").into());
        }
    }
    if c.weekly_hours_quota == Some(0) {
        return Err(ValidationError::Invalid("weekly_hours_quota must be positive").into());
    }
    if c.daily_booking_limit == Some(0) {
        return Err(ValidationError::Invalid("daily_booking_limit must be positive").into());
    }
    if c.weekly_hours_quota.is_some_and(|h| h > 24 * 7) {
        return Err(ValidationError::Invalid("weekly_hours_quota exceeds a week").into());
    }
    Ok(())
}
