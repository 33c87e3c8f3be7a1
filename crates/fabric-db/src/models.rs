use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::timefmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplyStatus {
    InProgress,
    Completed,
    Failed,
    Canceling,
    Canceled,
    Suspended,
}

impl ApplyStatus {
    /// Whether the apply has reached a final state.
    ///
    /// Terminal applies do not transition further except through an explicit
    /// resume of a suspended sub-phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ApplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Suspended => "SUSPENDED",
        };
        f.write_str(s)
    }
}

impl FromStr for ApplyStatus {
    type Err = ApplyStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELING" => Ok(Self::Canceling),
            "CANCELED" => Ok(Self::Canceled),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(ApplyStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ApplyStatus`] string.
#[derive(Debug, Clone)]
pub struct ApplyStatusParseError(pub String);

impl fmt::Display for ApplyStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid apply status: {:?}", self.0)
    }
}

impl std::error::Error for ApplyStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of the rollback sub-run of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackStatus {
    InProgress,
    Completed,
    Failed,
    Suspended,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Suspended => "SUSPENDED",
        };
        f.write_str(s)
    }
}

impl FromStr for RollbackStatus {
    type Err = RollbackStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "SUSPENDED" => Ok(Self::Suspended),
            other => Err(RollbackStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RollbackStatus`] string.
#[derive(Debug, Clone)]
pub struct RollbackStatusParseError(pub String);

impl fmt::Display for RollbackStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid rollback status: {:?}", self.0)
    }
}

impl std::error::Error for RollbackStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One apply -- a single execution of a layout-change plan.
///
/// Plans and per-operation results are stored as JSON columns; their typed
/// representations live in `fabric-core`. Wire field names follow the
/// external API (`applyID`, `rollbackStatus`, ...), empty fields are elided.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApplyRecord {
    #[serde(rename = "applyID")]
    pub apply_id: String,
    pub status: ApplyStatus,
    #[serde(rename = "rollbackStatus", skip_serializing_if = "Option::is_none")]
    pub rollback_status: Option<RollbackStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub procedures: Option<serde_json::Value>,
    #[serde(rename = "applyResult", skip_serializing_if = "Option::is_none")]
    pub apply_result: Option<serde_json::Value>,
    #[serde(
        rename = "rollbackProcedures",
        skip_serializing_if = "Option::is_none"
    )]
    pub rollback_procedures: Option<serde_json::Value>,
    #[serde(rename = "rollbackResult", skip_serializing_if = "Option::is_none")]
    pub rollback_result: Option<serde_json::Value>,
    #[serde(rename = "resumeProcedures", skip_serializing_if = "Option::is_none")]
    pub resume_procedures: Option<serde_json::Value>,
    #[serde(rename = "resumeResult", skip_serializing_if = "Option::is_none")]
    pub resume_result: Option<serde_json::Value>,
    #[serde(rename = "executeRollback")]
    pub execute_rollback: bool,
    #[serde(rename = "startedAt", with = "timefmt::utc_seconds")]
    pub started_at: DateTime<Utc>,
    #[serde(
        rename = "endedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "canceledAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "rollbackStartedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub rollback_started_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "rollbackEndedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub rollback_ended_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "suspendedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "resumedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub process_id: Option<i64>,
    #[serde(skip)]
    pub execution_command: Option<String>,
    #[serde(skip)]
    pub process_started_at: Option<String>,
}

/// The slice of an apply row consulted by the cancel state machine.
#[derive(Debug, Clone, FromRow)]
pub struct ControlRow {
    pub apply_id: String,
    pub status: ApplyStatus,
    pub rollback_status: Option<RollbackStatus>,
    pub process_id: Option<i64>,
    pub execution_command: Option<String>,
    pub process_started_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_status_display_roundtrip() {
        let variants = [
            ApplyStatus::InProgress,
            ApplyStatus::Completed,
            ApplyStatus::Failed,
            ApplyStatus::Canceling,
            ApplyStatus::Canceled,
            ApplyStatus::Suspended,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ApplyStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn apply_status_invalid() {
        let result = "bogus".parse::<ApplyStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn apply_status_terminality() {
        assert!(ApplyStatus::Completed.is_terminal());
        assert!(ApplyStatus::Failed.is_terminal());
        assert!(ApplyStatus::Canceled.is_terminal());
        assert!(!ApplyStatus::InProgress.is_terminal());
        assert!(!ApplyStatus::Canceling.is_terminal());
        assert!(!ApplyStatus::Suspended.is_terminal());
    }

    #[test]
    fn rollback_status_display_roundtrip() {
        let variants = [
            RollbackStatus::InProgress,
            RollbackStatus::Completed,
            RollbackStatus::Failed,
            RollbackStatus::Suspended,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RollbackStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn rollback_status_invalid() {
        let result = "nope".parse::<RollbackStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn apply_status_serializes_screaming() {
        let json = serde_json::to_string(&ApplyStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }
}
