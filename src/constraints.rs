use chrono::{Datelike, NaiveDate};

use crate::model::*;
use crate::violation::{Violation, ViolationCode};

const DAY_NAMES: [&str; 8] = [
    "", "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday",
];

/// Inputs the room rules need besides the candidate itself.
pub struct EvalContext<'a> {
    pub today: NaiveDate,
    /// The requester's active bookings in this room, edited booking excluded.
    pub history: &'a [&'a Booking],
    pub skip_min_participants: bool,
}

/// Check every present rule independently and collect all violations.
pub fn evaluate(constraints: &ConstraintSet, candidate: &Candidate, ctx: &EvalContext<'_>) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(period) = constraints.time_period {
        let ok = match period {
            TimePeriod::Morning => candidate.span.end <= NOON,
            TimePeriod::Afternoon => candidate.span.start >= NOON,
            TimePeriod::FullDay => candidate.span.start < NOON && candidate.span.end > NOON,
        };
        if !ok {
            let msg = match period {
                TimePeriod::Morning => "this room can only be booked in the morning (ending by 12:00)",
                TimePeriod::Afternoon => "this room can only be booked in the afternoon (starting from 12:00)",
                TimePeriod::FullDay => "this room can only be booked for a span covering 12:00",
            };
            violations.push(Violation::new(ViolationCode::TimePeriod, msg));
        }
    }

    if let Some(days) = &constraints.days_allowed
        && !days.is_empty()
    {
        let iso_day = candidate.date.weekday().number_from_monday() as u8;
        if !days.contains(&iso_day) {
            violations.push(Violation::new(
                ViolationCode::DaysAllowed,
                format!("this room can only be booked on {}", day_list(days.iter().copied())),
            ));
        }
    }

    if let Some(max_days) = constraints.advance_booking_days {
        let ahead = (candidate.date - ctx.today).num_days();
        if ahead > i64::from(max_days) {
            violations.push(Violation::new(
                ViolationCode::AdvanceBooking,
                format!("this room can be booked at most {max_days} day(s) in advance"),
            ));
        }
    }

    if let Some(quota_hours) = constraints.weekly_hours_quota {
        let (monday, sunday) = iso_week_bounds(candidate.date);
        let used: u32 = ctx
            .history
            .iter()
            .filter(|b| b.date >= monday && b.date <= sunday)
            .map(|b| b.span.duration_minutes())
            .sum();
        let quota = quota_hours * 60;
        if used + candidate.span.duration_minutes() > quota {
            let remaining = quota.saturating_sub(used);
            violations.push(Violation::new(
                ViolationCode::WeeklyQuota,
                format!(
                    "weekly quota exceeded (max {quota_hours}h per week, {} remaining)",
                    format_hours(remaining)
                ),
            ));
        }
    }

    if let Some(limit) = constraints.daily_booking_limit {
        let today_count = ctx.history.iter().filter(|b| b.date == candidate.date).count();
        if today_count >= limit as usize {
            violations.push(Violation::new(
                ViolationCode::DailyLimit,
                format!("daily limit reached (max {limit} booking(s) per day)"),
            ));
        }
    }

    if !ctx.skip_min_participants
        && let Some(min) = constraints.min_participants
        && candidate.party_size < min
    {
        violations.push(Violation::new(
            ViolationCode::MinParticipants,
            format!("this room requires at least {min} participant(s), requester included"),
        ));
    }

    violations
}

fn day_list(days: impl Iterator<Item = u8>) -> String {
    days.filter_map(|d| DAY_NAMES.get(d as usize).copied())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_hours(minutes: u32) -> String {
    match minutes % 60 {
        0 => format!("{}h", minutes / 60),
        m => format!("{}h{m:02}", minutes / 60),
    }
}

fn plural(n: u32) -> &'static str {
    if n > 1 { "s" } else { "" }
}

impl ConstraintSet {
    /// One readable line per present rule, for room listings.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        match self.time_period {
            Some(TimePeriod::Morning) => lines.push("Mornings only (ending by 12:00)".to_string()),
            Some(TimePeriod::Afternoon) => lines.push("Afternoons only (from 12:00)".to_string()),
            Some(TimePeriod::FullDay) => lines.push("Full-day bookings only (spanning 12:00)".to_string()),
            None => {}
        }
        if let Some(days) = &self.days_allowed
            && !days.is_empty()
        {
            if days.len() >= 5 {
                let blocked: Vec<u8> = (1..=7).filter(|d| !days.contains(d)).collect();
                if !blocked.is_empty() {
                    lines.push(format!("Not bookable on {}", day_list(blocked.into_iter())));
                }
            } else {
                lines.push(format!("Bookable only on {}", day_list(days.iter().copied())));
            }
        }
        if let Some(days) = self.advance_booking_days {
            lines.push(format!("Bookable at most {days} day{} in advance", plural(days)));
        }
        if let Some(hours) = self.weekly_hours_quota {
            lines.push(format!("Limited to {hours}h of bookings per user per week"));
        }
        if let Some(limit) = self.daily_booking_limit {
            lines.push(format!("At most {limit} booking{} per user per day", plural(limit)));
        }
        if let Some(min) = self.min_participants {
            lines.push(format!("Minimum {min} participant{} (requester included)", plural(min)));
        }
        lines
    }
}
