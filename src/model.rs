use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

use crate::engine::ValidationError;
use crate::policy::Setting;

pub type RoomId = Ulid;
pub type BookingId = Ulid;
pub type UserId = Ulid;

pub const NOON: TimeOfDay = TimeOfDay(12 * 60);

/// Minutes since midnight, always `< 24:00`. Serialized as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
            .unwrap_or(NaiveTime::MIN)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = ValidationError;

    /// Strict `HH:MM`, 24-hour clock.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ValidationError::BadTime(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(bad)?;
        if h.len() != 2 || m.len() != 2 || !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let hour: u16 = h.parse().map_err(|_| bad())?;
        let minute: u16 = m.parse().map_err(|_| bad())?;
        Self::from_hm(hour, minute).ok_or_else(bad)
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Half-open interval `[start, end)` within one calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl Span {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::EndNotAfterStart { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse two `HH:MM` strings into a non-empty span.
    pub fn parse(start: &str, end: &str) -> Result<Self, ValidationError> {
        Self::try_new(start.parse()?, end.parse()?)
    }

    pub fn duration_minutes(&self) -> u32 {
        u32::from(self.end.minutes() - self.start.minutes())
    }

    /// The one overlap predicate. Touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A span anchored on a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub date: NaiveDate,
    pub span: Span,
}

impl Slot {
    pub fn overlaps(&self, other: &Slot) -> bool {
        self.date == other.date && self.span.overlaps(&other.span)
    }

    /// Local instant at which the slot begins.
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.span.start.to_naive())
    }
}

/// ISO week (Monday..=Sunday) containing `date`.
pub fn iso_week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let offset = i64::from(date.weekday().num_days_from_monday());
    let monday = date - chrono::Duration::days(offset);
    (monday, monday + chrono::Duration::days(6))
}

pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePeriod {
    /// Booking must end at or before noon.
    Morning,
    /// Booking must start at or after noon.
    Afternoon,
    FullDay,
}

/// Optional per-room rules. Every present field is checked independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSet {
    pub time_period: Option<TimePeriod>,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday.
    pub days_allowed: Option<BTreeSet<u8>>,
    pub advance_booking_days: Option<u32>,
    pub weekly_hours_quota: Option<u32>,
    pub daily_booking_limit: Option<u32>,
    pub min_participants: Option<u32>,
}

impl ConstraintSet {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub capacity: u32,
    pub floor: i32,
    pub equipment: BTreeSet<String>,
    pub description: Option<String>,
    pub active: bool,
    pub constraints: Option<ConstraintSet>,
}

impl Room {
    pub fn has_equipment<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|e| self.equipment.contains(e))
    }

    pub fn min_participants(&self) -> Option<u32> {
        self.constraints.as_ref().and_then(|c| c.min_participants)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub room_id: RoomId,
    pub requester_id: UserId,
    pub date: NaiveDate,
    pub span: Span,
    pub title: Option<String>,
    pub description: Option<String>,
    pub party_size: u32,
    pub participants: Vec<UserId>,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot { date: self.date, span: self.span }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requester {
    pub id: UserId,
    #[serde(default)]
    pub is_admin: bool,
}

/// A proposed booking awaiting an admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub room_id: RoomId,
    pub requester: Requester,
    pub date: NaiveDate,
    pub span: Span,
    pub party_size: u32,
    pub title: Option<String>,
    pub description: Option<String>,
    pub participants: Vec<UserId>,
}

impl Candidate {
    pub fn new(room_id: RoomId, requester: Requester, date: NaiveDate, span: Span) -> Self {
        Self {
            room_id,
            requester,
            date,
            span,
            party_size: 1,
            title: None,
            description: None,
            participants: Vec::new(),
        }
    }

    pub fn with_party_size(mut self, party_size: u32) -> Self {
        self.party_size = party_size;
        self
    }

    pub fn slot(&self) -> Slot {
        Slot { date: self.date, span: self.span }
    }

    pub fn into_booking(self, id: BookingId) -> Booking {
        Booking {
            id,
            room_id: self.room_id,
            requester_id: self.requester.id,
            date: self.date,
            span: self.span,
            title: self.title,
            description: self.description,
            party_size: self.party_size,
            participants: self.participants,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EvaluateOptions {
    /// Preview mode: leave `min_participants` out of the decision.
    pub skip_min_participants: bool,
    /// Booking being edited; it never conflicts with itself.
    pub exclude_booking_id: Option<BookingId>,
}

// ── Per-room state ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    /// Active bookings per date, each day sorted by `span.start`.
    pub days: BTreeMap<NaiveDate, Vec<Booking>>,
    booking_count: usize,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            days: BTreeMap::new(),
            booking_count: 0,
        }
    }

    pub fn booking_count(&self) -> usize {
        self.booking_count
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
        self.booking_count += 1;
    }

    pub fn remove_booking(&mut self, id: BookingId, date: NaiveDate) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        self.booking_count -= 1;
        Some(removed)
    }

    pub fn bookings_on(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map_or(&[], Vec::as_slice)
    }

    /// Bookings on `date` whose span overlaps `query`.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Booking> {
        let day = self.bookings_on(date);
        let right_bound = day.partition_point(|b| b.span.start < query.end);
        day[..right_bound]
            .iter()
            .filter(move |b| b.span.overlaps(query))
    }

    /// Bookings dated within `[from, to]`, inclusive.
    pub fn bookings_between(&self, from: NaiveDate, to: NaiveDate) -> impl Iterator<Item = &Booking> {
        self.days.range(from..=to).flat_map(|(_, day)| day.iter())
    }

    pub fn iter_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.days.values().flat_map(|day| day.iter())
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    RoomUpdated {
        room: Room,
    },
    RoomActiveSet {
        id: RoomId,
        active: bool,
    },
    BookingConfirmed {
        booking: Booking,
    },
    BookingUpdated {
        previous_room_id: RoomId,
        previous_date: NaiveDate,
        booking: Booking,
    },
    BookingCancelled {
        id: BookingId,
        room_id: RoomId,
        date: NaiveDate,
    },
    SettingChanged {
        key: String,
        setting: Setting,
    },
    FavoriteAdded {
        user_id: UserId,
        room_id: RoomId,
    },
    FavoriteRemoved {
        user_id: UserId,
        room_id: RoomId,
    },
}

impl Event {
    /// Rooms whose state this event touches.
    pub fn room_ids(&self) -> Vec<RoomId> {
        match self {
            Event::RoomCreated { room } | Event::RoomUpdated { room } => vec![room.id],
            Event::RoomActiveSet { id, .. } => vec![*id],
            Event::BookingConfirmed { booking } => vec![booking.room_id],
            Event::BookingUpdated {
                previous_room_id,
                booking,
                ..
            } if *previous_room_id != booking.room_id => vec![*previous_room_id, booking.room_id],
            Event::BookingUpdated { booking, .. } => vec![booking.room_id],
            Event::BookingCancelled { room_id, .. } => vec![*room_id],
            Event::SettingChanged { .. }
            | Event::FavoriteAdded { .. }
            | Event::FavoriteRemoved { .. } => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub name: String,
    pub capacity: u32,
    pub floor: i32,
    pub equipment: BTreeSet<String>,
    pub active: bool,
    pub constraints: Vec<String>,
}

impl From<&Room> for RoomSummary {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id,
            name: room.name.clone(),
            capacity: room.capacity,
            floor: room.floor,
            equipment: room.equipment.clone(),
            active: room.active,
            constraints: room
                .constraints
                .as_ref()
                .map(ConstraintSet::describe)
                .unwrap_or_default(),
        }
    }
}
