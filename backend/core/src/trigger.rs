//! Trigger model: scheduled units of work owned by an agent.
//!
//! A recurrence rule is an opaque value with a single capability: compute
//! the next occurrence strictly after a given instant. The scheduler never
//! matches on the concrete rule.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValetError;

pub type TriggerId = i64;

/// How a recurring trigger repeats.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecurrenceRule {
    /// Fixed interval between occurrences.
    Interval { seconds: u64 },
    /// Cron expression evaluated in UTC (e.g. "0 0 9 * * Mon-Fri *").
    Cron { expression: String },
}

impl RecurrenceRule {
    /// Next occurrence strictly after `instant`, or `None` if the rule has
    /// no future occurrences.
    pub fn next_after(&self, instant: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ValetError> {
        match self {
            RecurrenceRule::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(ValetError::validation("interval recurrence must be non-zero"));
                }
                let step = chrono::Duration::from_std(Duration::from_secs(*seconds))
                    .map_err(|e| ValetError::validation(format!("interval out of range: {e}")))?;
                Ok(Some(instant + step))
            }
            RecurrenceRule::Cron { expression } => {
                let schedule = cron::Schedule::from_str(expression).map_err(|e| {
                    ValetError::validation(format!("invalid cron expression '{expression}': {e}"))
                })?;
                Ok(schedule.after(&instant).next())
            }
        }
    }

    /// Validate the rule without computing an occurrence.
    pub fn validate(&self) -> Result<(), ValetError> {
        self.next_after(Utc::now()).map(|_| ())
    }
}

impl std::fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecurrenceRule::Interval { seconds } => write!(f, "every {}s", seconds),
            RecurrenceRule::Cron { expression } => write!(f, "cron({})", expression),
        }
    }
}

/// When a trigger fires: once at a fixed instant, or on a recurrence rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSchedule {
    Once { at: DateTime<Utc> },
    Recurring {
        rule: RecurrenceRule,
        /// First occurrence; defaults to the rule's next occurrence after
        /// creation time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
    },
}

impl TriggerSchedule {
    pub fn is_recurring(&self) -> bool {
        matches!(self, TriggerSchedule::Recurring { .. })
    }

    /// First fire instant for a newly created trigger.
    pub fn initial_fire_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ValetError> {
        match self {
            TriggerSchedule::Once { at } => Ok(Some(*at)),
            TriggerSchedule::Recurring { rule, start } => match start {
                Some(start) => Ok(Some(*start)),
                None => rule.next_after(now),
            },
        }
    }
}

/// Trigger lifecycle state.
///
/// `Scheduled → Running → {Completed | Scheduled | Failed | Cancelled}`.
/// Completed and recurring re-arm both pass through Running; Cancelled and
/// Failed are terminal, as is Completed for one-shots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TriggerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TriggerStatus::Completed | TriggerStatus::Failed | TriggerStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerStatus::Scheduled => "scheduled",
            TriggerStatus::Running => "running",
            TriggerStatus::Completed => "completed",
            TriggerStatus::Failed => "failed",
            TriggerStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TriggerStatus {
    type Err = ValetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerStatus::Scheduled),
            "running" => Ok(TriggerStatus::Running),
            "completed" => Ok(TriggerStatus::Completed),
            "failed" => Ok(TriggerStatus::Failed),
            "cancelled" => Ok(TriggerStatus::Cancelled),
            other => Err(ValetError::validation(format!("unknown trigger status '{other}'"))),
        }
    }
}

/// A scheduled unit of work, one-shot or recurring, owned by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: TriggerId,
    pub agent_id: String,
    pub schedule: TriggerSchedule,
    /// Opaque instruction text passed to the owning agent on fire.
    pub payload: String,
    pub status: TriggerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Creation request; the store assigns the id and initial fire time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrigger {
    pub agent_id: String,
    pub schedule: TriggerSchedule,
    pub payload: String,
}

impl NewTrigger {
    pub fn once(agent_id: impl Into<String>, at: DateTime<Utc>, payload: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            schedule: TriggerSchedule::Once { at },
            payload: payload.into(),
        }
    }

    pub fn recurring(
        agent_id: impl Into<String>,
        rule: RecurrenceRule,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            schedule: TriggerSchedule::Recurring { rule, start: None },
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_next_after_is_strictly_later() {
        let rule = RecurrenceRule::Interval { seconds: 300 };
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = rule.next_after(t).unwrap().unwrap();
        assert_eq!(next, t + chrono::Duration::seconds(300));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let rule = RecurrenceRule::Interval { seconds: 0 };
        assert!(rule.next_after(Utc::now()).is_err());
    }

    #[test]
    fn cron_next_after_is_strictly_later() {
        // Every day at 09:00 UTC.
        let rule = RecurrenceRule::Cron {
            expression: "0 0 9 * * * *".into(),
        };
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let next = rule.next_after(t).unwrap().unwrap();
        assert!(next > t);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn malformed_cron_is_a_validation_error() {
        let rule = RecurrenceRule::Cron {
            expression: "not a cron".into(),
        };
        match rule.next_after(Utc::now()) {
            Err(ValetError::Validation { .. }) => {}
            other => panic!("expected validation error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn one_shot_initial_fire_is_the_fixed_instant() {
        let at = Utc.with_ymd_and_hms(2025, 6, 1, 18, 30, 0).unwrap();
        let schedule = TriggerSchedule::Once { at };
        assert_eq!(schedule.initial_fire_at(Utc::now()).unwrap(), Some(at));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TriggerStatus::Completed.is_terminal());
        assert!(TriggerStatus::Failed.is_terminal());
        assert!(TriggerStatus::Cancelled.is_terminal());
        assert!(!TriggerStatus::Scheduled.is_terminal());
        assert!(!TriggerStatus::Running.is_terminal());
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [
            TriggerStatus::Scheduled,
            TriggerStatus::Running,
            TriggerStatus::Completed,
            TriggerStatus::Failed,
            TriggerStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TriggerStatus>().unwrap(), status);
        }
    }
}
