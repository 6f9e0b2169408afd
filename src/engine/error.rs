use chrono::NaiveDate;

use crate::model::{Booking, BookingId, RoomId, TimeOfDay};
use crate::violation::Violation;

/// Malformed input, rejected before any evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BadTime(String),
    EndNotAfterStart { start: TimeOfDay, end: TimeOfDay },
    PastDate(NaiveDate),
    ZeroPartySize,
    RoomInactive(RoomId),
    TooLong(&'static str),
    Invalid(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::BadTime(s) => write!(f, "invalid time {s:?}, expected HH:MM"),
            ValidationError::EndNotAfterStart { start, end } => {
                write!(f, "end time {end} must be after start time {start}")
            }
            ValidationError::PastDate(d) => write!(f, "cannot book a date in the past: {d}"),
            ValidationError::ZeroPartySize => f.write_str("party size must be at least 1"),
            ValidationError::RoomInactive(id) => write!(f, "room {id} is not active"),
            ValidationError::TooLong(field) => write!(f, "{field} too long"),
            ValidationError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug)]
pub enum EngineError {
    Validation(ValidationError),
    /// Policy and/or constraint violations, in evaluation order.
    Rejected(Vec<Violation>),
    /// The atomic re-check found bookings holding an overlapping slot.
    Conflict { room_id: RoomId, holders: Vec<Booking> },
    /// The room lock could not be taken in time; re-evaluate and retry.
    LockTimeout(RoomId),
    /// The booking moved or was cancelled while its room locks were awaited.
    Moved(BookingId),
    NotFound(ulid::Ulid),
    AlreadyExists(ulid::Ulid),
    Forbidden(BookingId),
    PastBooking(BookingId),
    InvalidSetting(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// True for failures that mean "state changed under you": the caller
    /// should re-run evaluation rather than resubmit the same candidate.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict { .. } | EngineError::LockTimeout(_) | EngineError::Moved(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Rejected(_) => "rejected",
            EngineError::Conflict { .. } | EngineError::LockTimeout(_) | EngineError::Moved(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::PastBooking(_) => "past_booking",
            EngineError::InvalidSetting(_) => "invalid_setting",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "invalid request: {e}"),
            EngineError::Rejected(violations) => {
                let codes: Vec<&str> = violations.iter().map(|v| v.code.as_str()).collect();
                write!(f, "rejected: {}", codes.join(", "))
            }
            EngineError::Conflict { room_id, holders } => {
                write!(f, "room {room_id} already booked")?;
                for (i, b) in holders.iter().enumerate() {
                    let sep = if i == 0 { ": " } else { ", " };
                    write!(f, "{sep}{} {}", b.date, b.span)?;
                }
                Ok(())
            }
            EngineError::LockTimeout(id) => write!(f, "room {id} is busy, re-evaluate and retry"),
            EngineError::Moved(id) => write!(f, "booking {id} changed concurrently, re-read and retry"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Forbidden(id) => write!(f, "not allowed to modify booking {id}"),
            EngineError::PastBooking(id) => write!(f, "booking {id} is in the past and can no longer change"),
            EngineError::InvalidSetting(msg) => write!(f, "invalid setting: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
