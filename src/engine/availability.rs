use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::debug;

use crate::cache::AvailabilityKey;
use crate::model::*;
use crate::violation::{Violation, ViolationCode};

use super::conflict::validate_candidate;
use super::{Engine, EngineError};

/// "Which rooms can host this?" The candidate part plus hard room filters.
#[derive(Debug, Clone)]
pub struct AvailabilityQuery {
    pub requester: Requester,
    pub date: NaiveDate,
    pub span: Span,
    pub party_size: u32,
    pub min_capacity: Option<u32>,
    pub required_equipment: BTreeSet<String>,
    pub exclude_booking_id: Option<BookingId>,
}

impl AvailabilityQuery {
    pub fn new(requester: Requester, date: NaiveDate, span: Span) -> Self {
        Self {
            requester,
            date,
            span,
            party_size: 1,
            min_capacity: None,
            required_equipment: BTreeSet::new(),
            exclude_booking_id: None,
        }
    }

    fn candidate_for(&self, room_id: RoomId) -> Candidate {
        Candidate::new(room_id, self.requester, self.date, self.span).with_party_size(self.party_size)
    }

    fn cache_key(&self, room_id: RoomId, today: NaiveDate) -> AvailabilityKey {
        AvailabilityKey {
            room_id,
            today,
            requester: self.requester,
            date: self.date,
            span: self.span,
            party_size: self.party_size,
            exclude_booking_id: self.exclude_booking_id,
        }
    }

    /// Hard filters: failing rooms are left out, not marked unavailable.
    /// Checked on the summary so cached answers are filtered the same way.
    fn admits(&self, room: &RoomSummary) -> bool {
        room.active
            && self.min_capacity.is_none_or(|min| room.capacity >= min)
            && self.required_equipment.is_subset(&room.equipment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomAvailability {
    pub room: RoomSummary,
    /// Evaluated with the party-size rule left out.
    pub is_available: bool,
    /// Policy and constraint violations; `OVERLAP` is reported as `has_conflict`.
    pub constraint_violations: Vec<Violation>,
    pub has_conflict: bool,
    /// Surfaced so a party-size shortfall can be flagged beside the room.
    pub min_participants: Option<u32>,
    pub is_favorite: bool,
}

impl Engine {
    /// Run the non-committing checks across every room that passes the hard
    /// filters. Results are ordered by room name.
    pub async fn list_available(&self, query: &AvailabilityQuery) -> Result<Vec<RoomAvailability>, EngineError> {
        let now = self.clock.now();
        // Any room id will do for shape validation.
        validate_candidate(&query.candidate_for(RoomId::nil()), now.date())?;

        let favorites = self
            .favorites
            .get(&query.requester.id)
            .map(|f| f.value().clone())
            .unwrap_or_default();
        let room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();

        let mut results = Vec::new();
        let mut cache_hits = 0usize;
        for room_id in room_ids {
            let key = query.cache_key(room_id, now.date());
            let mut entry = match self.availability_cache.get(&key) {
                Some(hit) => {
                    cache_hits += 1;
                    hit
                }
                None => {
                    let generation = self.availability_cache.generation();
                    let guard = self.read_room(room_id).await?;
                    let summary = RoomSummary::from(&guard.room);
                    if !query.admits(&summary) {
                        continue;
                    }
                    let opts = EvaluateOptions {
                        skip_min_participants: true,
                        exclude_booking_id: query.exclude_booking_id,
                    };
                    let assessment = self.assess(&guard, &query.candidate_for(room_id), opts, now);
                    let constraint_violations: Vec<Violation> = assessment
                        .violations()
                        .into_iter()
                        .filter(|v| v.code != ViolationCode::Overlap)
                        .collect();
                    let fresh = RoomAvailability {
                        room: summary,
                        is_available: constraint_violations.is_empty() && !assessment.has_conflict(),
                        constraint_violations,
                        has_conflict: assessment.has_conflict(),
                        min_participants: guard.room.min_participants(),
                        is_favorite: false,
                    };
                    drop(guard);
                    self.availability_cache.insert_if_current(key, fresh.clone(), generation);
                    fresh
                }
            };
            if !query.admits(&entry.room) {
                continue;
            }
            entry.is_favorite = favorites.contains(&room_id);
            results.push(entry);
        }

        results.sort_by(|a, b| a.room.name.cmp(&b.room.name).then(a.room.id.cmp(&b.room.id)));
        debug!(rooms = results.len(), cache_hits, date = %query.date, span = %query.span, "availability listed");
        Ok(results)
    }
}
