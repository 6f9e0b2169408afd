use std::time::Instant;

use chrono::NaiveDateTime;
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::constraints::{self, EvalContext};
use crate::limits::MAX_BOOKINGS_PER_ROOM;
use crate::model::*;
use crate::observability::{COMMITS_TOTAL, COMMIT_DURATION_SECONDS, EVALUATIONS_TOTAL};
use crate::policy;
use crate::violation::{Decision, Violation, ViolationCode};

use super::conflict::{ensure_active, find_conflicts, validate_candidate};
use super::{Engine, EngineError};

/// Result of running every non-committing check against one room.
pub(super) struct Assessment {
    /// Policy violations followed by constraint violations.
    pub rules: Vec<Violation>,
    pub conflicts: Vec<Booking>,
}

impl Assessment {
    pub fn has_conflict(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// The full ordered violation list, `OVERLAP` last.
    pub fn violations(&self) -> Vec<Violation> {
        let mut out = self.rules.clone();
        if let Some(v) = overlap_violation(&self.conflicts) {
            out.push(v);
        }
        out
    }

    /// Commit outcome: rule violations win over a bare overlap, since the
    /// candidate would be refused even with the slot free.
    fn into_result(self, room_id: RoomId) -> Result<(), EngineError> {
        if !self.rules.is_empty() {
            let violations = self.violations();
            return Err(EngineError::Rejected(violations));
        }
        if !self.conflicts.is_empty() {
            return Err(EngineError::Conflict {
                room_id,
                holders: self.conflicts,
            });
        }
        Ok(())
    }
}

fn overlap_violation(conflicts: &[Booking]) -> Option<Violation> {
    if conflicts.is_empty() {
        return None;
    }
    let slots: Vec<String> = conflicts.iter().map(|b| b.span.to_string()).collect();
    Some(Violation::new(
        ViolationCode::Overlap,
        format!("this room is already booked at {}", slots.join(", ")),
    ))
}

impl Engine {
    /// Policy, then room constraints, then conflicts. Nothing short-circuits.
    pub(super) fn assess(
        &self,
        rs: &RoomState,
        candidate: &Candidate,
        opts: EvaluateOptions,
        now: NaiveDateTime,
    ) -> Assessment {
        let mut rules = policy::evaluate(&self.policy(), candidate, now);

        if let Some(set) = &rs.room.constraints {
            let (monday, sunday) = iso_week_bounds(candidate.date);
            let history: Vec<&Booking> = rs
                .bookings_between(monday, sunday)
                .filter(|b| b.requester_id == candidate.requester.id && Some(b.id) != opts.exclude_booking_id)
                .collect();
            let ctx = EvalContext {
                today: now.date(),
                history: &history,
                skip_min_participants: opts.skip_min_participants,
            };
            rules.extend(constraints::evaluate(set, candidate, &ctx));
        }

        let conflicts = find_conflicts(rs, candidate.date, &candidate.span, opts.exclude_booking_id);
        Assessment { rules, conflicts }
    }

    /// Side-effect-free admission decision.
    pub async fn evaluate(&self, candidate: &Candidate, opts: EvaluateOptions) -> Result<Decision, EngineError> {
        let now = self.clock.now();
        validate_candidate(candidate, now.date())?;
        let guard = self.read_room(candidate.room_id).await?;
        ensure_active(&guard.room)?;
        let decision = Decision::from_violations(self.assess(&guard, candidate, opts, now).violations());
        drop(guard);

        metrics::counter!(EVALUATIONS_TOTAL, "outcome" => decision.outcome_label()).increment(1);
        debug!(room = %candidate.room_id, date = %candidate.date, span = %candidate.span, admitted = decision.is_admitted(), "evaluated");
        Ok(decision)
    }

    /// Re-check and insert under the room's write lock, so two overlapping
    /// commits can never both land.
    pub async fn commit(&self, candidate: Candidate) -> Result<BookingId, EngineError> {
        let start = Instant::now();
        let result = self.commit_inner(candidate).await;
        let outcome = match &result {
            Ok(_) => "committed",
            Err(e) => e.kind(),
        };
        metrics::counter!(COMMITS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(COMMIT_DURATION_SECONDS).record(start.elapsed().as_secs_f64());
        result
    }

    async fn commit_inner(&self, candidate: Candidate) -> Result<BookingId, EngineError> {
        let now = self.clock.now();
        validate_candidate(&candidate, now.date())?;
        let room_id = candidate.room_id;
        let mut guard = self.write_room(room_id).await?;
        ensure_active(&guard.room)?;
        if guard.booking_count() >= MAX_BOOKINGS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }

        if let Err(e) = self.assess(&guard, &candidate, EvaluateOptions::default(), now).into_result(room_id) {
            if e.is_conflict() {
                info!(room = %room_id, date = %candidate.date, span = %candidate.span, "commit lost to an overlapping booking");
            }
            return Err(e);
        }

        let booking = candidate.into_booking(Ulid::new());
        let id = booking.id;
        let event = Event::BookingConfirmed { booking };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %id, room = %room_id, "booking committed");
        Ok(id)
    }

    /// Edit a booking in place (or move it to another room). The stored
    /// booking must belong to the actor, unless the actor is an admin, and
    /// must not be in the past. The owner is kept.
    pub async fn update_booking(&self, booking_id: BookingId, changes: Candidate) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let actor = changes.requester;
        validate_candidate(&changes, now.date())?;
        let from = self.locate_booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let to_room = changes.room_id;

        let (mut old_guard, mut new_guard) = self.write_room_pair(from.room_id, to_room).await?;
        // The index was read unlocked; with both rooms held it can no longer change.
        match self.locate_booking(&booking_id) {
            Some(at) if at == from => {}
            Some(_) => return Err(EngineError::Moved(booking_id)),
            None => return Err(EngineError::NotFound(booking_id)),
        }
        if let Some(guard) = new_guard.as_deref()
            && guard.booking_count() >= MAX_BOOKINGS_PER_ROOM
        {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        let existing = old_guard
            .bookings_on(from.date)
            .iter()
            .find(|b| b.id == booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if existing.requester_id != actor.id && !actor.is_admin {
            return Err(EngineError::Forbidden(booking_id));
        }
        if existing.date < now.date() {
            return Err(EngineError::PastBooking(booking_id));
        }

        let target: &RoomState = new_guard.as_deref().unwrap_or(&*old_guard);
        ensure_active(&target.room)?;
        let mut candidate = changes;
        candidate.requester = Requester {
            id: existing.requester_id,
            is_admin: actor.is_admin,
        };
        let opts = EvaluateOptions {
            skip_min_participants: false,
            exclude_booking_id: Some(booking_id),
        };
        self.assess(target, &candidate, opts, now).into_result(to_room)?;

        let booking = candidate.into_booking(booking_id);
        let event = Event::BookingUpdated {
            previous_room_id: from.room_id,
            previous_date: from.date,
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        self.apply_committed(&mut old_guard, &event);
        if let Some(guard) = new_guard.as_mut() {
            self.apply_committed(guard, &event);
        }
        info!(booking = %booking_id, room = %to_room, "booking updated");
        Ok(booking)
    }

    pub async fn cancel_booking(&self, booking_id: BookingId, actor: Requester) -> Result<Booking, EngineError> {
        let now = self.clock.now();
        let at = self.locate_booking(&booking_id).ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self.write_room(at.room_id).await?;
        let existing = guard
            .bookings_on(at.date)
            .iter()
            .find(|b| b.id == booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if existing.requester_id != actor.id && !actor.is_admin {
            return Err(EngineError::Forbidden(booking_id));
        }
        if existing.date < now.date() {
            return Err(EngineError::PastBooking(booking_id));
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            room_id: at.room_id,
            date: at.date,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        info!(booking = %booking_id, room = %at.room_id, "booking cancelled");
        Ok(existing)
    }

    /// Write-lock `from` and, if different, `to`. Locks are always taken in
    /// room id order so two moves in opposite directions cannot deadlock.
    async fn write_room_pair(
        &self,
        from: RoomId,
        to: RoomId,
    ) -> Result<(OwnedRwLockWriteGuard<RoomState>, Option<OwnedRwLockWriteGuard<RoomState>>), EngineError> {
        if from == to {
            return Ok((self.write_room(from).await?, None));
        }
        if from < to {
            let a = self.write_room(from).await?;
            let b = self.write_room(to).await?;
            Ok((a, Some(b)))
        } else {
            let b = self.write_room(to).await?;
            let a = self.write_room(from).await?;
            Ok((a, Some(b)))
        }
    }
}
