use std::collections::HashMap;
use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::model::{is_weekend, Candidate};
use crate::violation::{Violation, ViolationCode};

pub const POLICY_NAMESPACE: &str = "reservations";
pub const KEY_BLOCK_WEEKENDS: &str = "reservations.block_weekends";
pub const KEY_SLOT_DURATION: &str = "reservations.slot_duration";
pub const KEY_MIN_ADVANCE_HOURS: &str = "reservations.min_advance_hours";
pub const KEY_MAX_ADVANCE_DAYS: &str = "reservations.max_advance_days";

/// A typed setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<String>),
}

impl SettingValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Boolean(_) => "boolean",
            SettingValue::Integer(_) => "integer",
            SettingValue::Float(_) => "float",
            SettingValue::String(_) => "string",
            SettingValue::Array(_) => "array",
        }
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Boolean(b) => write!(f, "{b}"),
            SettingValue::Integer(i) => write!(f, "{i}"),
            SettingValue::Float(x) => write!(f, "{x}"),
            SettingValue::String(s) => f.write_str(s),
            SettingValue::Array(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

/// One entry of the site-wide key/value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub value: SettingValue,
    /// Namespace the key belongs to (`reservations` for `reservations.slot_duration`).
    pub group: String,
}

impl Setting {
    pub fn new(key: &str, value: SettingValue) -> Self {
        Self {
            value,
            group: namespace_of(key).to_string(),
        }
    }
}

pub fn namespace_of(key: &str) -> &str {
    key.split_once('.').map_or(key, |(ns, _)| ns)
}

/// Reject values the admission engine could not honour.
pub fn validate_setting(key: &str, value: &SettingValue) -> Result<(), String> {
    if key.is_empty() || key.starts_with('.') || key.ends_with('.') {
        return Err(format!("invalid setting key {key:?}"));
    }
    let expect_int = |min: i64, max: i64| match value {
        SettingValue::Integer(i) if (min..=max).contains(i) => Ok(*i),
        SettingValue::Integer(i) => Err(format!("{key} must be between {min} and {max}, got {i}")),
        other => Err(format!("{key} must be an integer, got {}", other.type_name())),
    };
    match key {
        KEY_BLOCK_WEEKENDS => match value {
            SettingValue::Boolean(_) => Ok(()),
            other => Err(format!("{key} must be a boolean, got {}", other.type_name())),
        },
        KEY_SLOT_DURATION => {
            let minutes = expect_int(1, 60)?;
            if 60 % minutes != 0 {
                return Err(format!("{key} must divide 60, got {minutes}"));
            }
            Ok(())
        }
        KEY_MIN_ADVANCE_HOURS => expect_int(0, 24 * 365).map(|_| ()),
        KEY_MAX_ADVANCE_DAYS => expect_int(0, 3650).map(|_| ()),
        _ => Ok(()),
    }
}

/// Snapshot of the site-wide booking rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPolicy {
    pub block_weekends: bool,
    pub slot_duration_minutes: u32,
    pub min_advance_hours: u32,
    pub max_advance_days: u32,
}

impl Default for GlobalPolicy {
    fn default() -> Self {
        Self {
            block_weekends: false,
            slot_duration_minutes: 30,
            min_advance_hours: 2,
            max_advance_days: 30,
        }
    }
}

impl GlobalPolicy {
    /// Build from stored settings, falling back to defaults for absent or mistyped keys.
    pub fn from_settings(settings: &HashMap<String, Setting>) -> Self {
        let defaults = Self::default();
        let int = |key: &str, fallback: u32| match settings.get(key).map(|s| &s.value) {
            Some(SettingValue::Integer(i)) => u32::try_from(*i).unwrap_or(fallback),
            _ => fallback,
        };
        let block_weekends = match settings.get(KEY_BLOCK_WEEKENDS).map(|s| &s.value) {
            Some(SettingValue::Boolean(b)) => *b,
            _ => defaults.block_weekends,
        };
        let slot = int(KEY_SLOT_DURATION, defaults.slot_duration_minutes);
        Self {
            block_weekends,
            slot_duration_minutes: if slot == 0 { defaults.slot_duration_minutes } else { slot },
            min_advance_hours: int(KEY_MIN_ADVANCE_HOURS, defaults.min_advance_hours),
            max_advance_days: int(KEY_MAX_ADVANCE_DAYS, defaults.max_advance_days),
        }
    }
}

/// Evaluate site-wide policy. Administrators bypass only the minimum notice.
pub fn evaluate(policy: &GlobalPolicy, candidate: &Candidate, now: NaiveDateTime) -> Vec<Violation> {
    let mut violations = Vec::new();

    if policy.block_weekends && is_weekend(candidate.date) {
        violations.push(Violation::new(
            ViolationCode::WeekendBlocked,
            "bookings are not allowed on weekends",
        ));
    }

    let slot = policy.slot_duration_minutes.max(1);
    if u32::from(candidate.span.start.minute()) % slot != 0 {
        violations.push(Violation::new(
            ViolationCode::SlotGranularity,
            format!("start times must fall on {slot}-minute boundaries"),
        ));
    }

    if !candidate.requester.is_admin {
        let earliest = now + Duration::hours(i64::from(policy.min_advance_hours));
        if candidate.slot().starts_at() < earliest {
            violations.push(Violation::new(
                ViolationCode::AdvanceNoticeMin,
                format!("bookings must be made at least {}h in advance", policy.min_advance_hours),
            ));
        }
    }

    let ahead = (candidate.date - now.date()).num_days();
    if ahead > i64::from(policy.max_advance_days) {
        violations.push(Violation::new(
            ViolationCode::AdvanceNoticeMax,
            format!("bookings cannot be made more than {} days ahead", policy.max_advance_days),
        ));
    }

    violations
}
