//! Per-operation execution results.
//!
//! An [`OpResult`] records what a driver observed for one operation: the
//! request it issued, the final response, and any sub-results from
//! post-condition checks. Fields that were never populated are elided from
//! JSON.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabric_db::timefmt;

/// Terminal status of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpStatus {
    Completed,
    Failed,
    Canceled,
    Skipped,
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

impl FromStr for OpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "SKIPPED" => Ok(Self::Skipped),
            other => Err(format!("invalid operation status: {other:?}")),
        }
    }
}

/// Sub-result of the OS-boot confirmation check run after a boot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OsBootCheck {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(
        rename = "statusCode",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub status_code: Option<u16>,
    #[serde(
        rename = "queryParameter",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub query_parameter: Option<Value>,
    #[serde(
        rename = "responseBody",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub response_body: Option<Value>,
}

/// Sub-result of a device-information read attached to a failed power check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetInformation {
    #[serde(rename = "responseBody")]
    pub response_body: Value,
}

/// Result of one operation as observed by its driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpResult {
    #[serde(rename = "operationID")]
    pub operation_id: u64,
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<String>,
    #[serde(
        rename = "statusCode",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub status_code: Option<u16>,
    #[serde(
        rename = "queryParameter",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub query_parameter: Option<Value>,
    #[serde(
        rename = "requestBody",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub request_body: Option<Value>,
    #[serde(
        rename = "responseBody",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub response_body: Option<Value>,
    #[serde(rename = "isOSBoot", skip_serializing_if = "Option::is_none", default)]
    pub is_os_boot: Option<OsBootCheck>,
    #[serde(
        rename = "getInformation",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub get_information: Option<GetInformation>,
    #[serde(
        rename = "startedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "endedAt",
        with = "timefmt::utc_seconds_opt",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub ended_at: Option<DateTime<Utc>>,
}

impl OpResult {
    /// A bare result for an operation that never issued a request
    /// (canceled or skipped before dispatch).
    pub fn bare(operation_id: u64, status: OpStatus) -> Self {
        Self {
            operation_id,
            status,
            uri: None,
            method: None,
            status_code: None,
            query_parameter: None,
            request_body: None,
            response_body: None,
            is_os_boot: None,
            get_information: None,
            started_at: None,
            ended_at: None,
        }
    }
}
