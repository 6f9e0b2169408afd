use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifiers so callers can localize messages independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationCode {
    TimePeriod,
    DaysAllowed,
    AdvanceBooking,
    WeeklyQuota,
    DailyLimit,
    MinParticipants,
    Overlap,
    WeekendBlocked,
    SlotGranularity,
    AdvanceNoticeMin,
    AdvanceNoticeMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationCategory {
    Policy,
    Constraint,
    Conflict,
}

impl ViolationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationCode::TimePeriod => "TIME_PERIOD",
            ViolationCode::DaysAllowed => "DAYS_ALLOWED",
            ViolationCode::AdvanceBooking => "ADVANCE_BOOKING",
            ViolationCode::WeeklyQuota => "WEEKLY_QUOTA",
            ViolationCode::DailyLimit => "DAILY_LIMIT",
            ViolationCode::MinParticipants => "MIN_PARTICIPANTS",
            ViolationCode::Overlap => "OVERLAP",
            ViolationCode::WeekendBlocked => "WEEKEND_BLOCKED",
            ViolationCode::SlotGranularity => "SLOT_GRANULARITY",
            ViolationCode::AdvanceNoticeMin => "ADVANCE_NOTICE_MIN",
            ViolationCode::AdvanceNoticeMax => "ADVANCE_NOTICE_MAX",
        }
    }

    pub fn category(self) -> ViolationCategory {
        match self {
            ViolationCode::WeekendBlocked
            | ViolationCode::SlotGranularity
            | ViolationCode::AdvanceNoticeMin
            | ViolationCode::AdvanceNoticeMax => ViolationCategory::Policy,
            ViolationCode::Overlap => ViolationCategory::Conflict,
            _ => ViolationCategory::Constraint,
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single reason a candidate fails admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
}

impl Violation {
    pub fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ViolationCategory {
        self.code.category()
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Outcome of one evaluation. Terminal: a candidate is either admitted or
/// rejected with the full, ordered list of reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected(Vec<Violation>),
}

impl Decision {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        if violations.is_empty() {
            Decision::Admitted
        } else {
            Decision::Rejected(violations)
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Decision::Admitted => &[],
            Decision::Rejected(v) => v,
        }
    }

    pub fn codes(&self) -> Vec<ViolationCode> {
        self.violations().iter().map(|v| v.code).collect()
    }

    pub fn outcome_label(&self) -> &'static str {
        if self.is_admitted() { "admitted" } else { "rejected" }
    }
}
