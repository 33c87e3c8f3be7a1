//! Configuration envelopes for the executor and its drivers.
//!
//! Numeric bounds are enforced by [`ExecutorConfig::validate`] when the
//! configuration is loaded, never at use. Unspecified fields take the
//! documented defaults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation error (code `E40001`).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(String);

impl ConfigError {
    pub fn code(&self) -> &'static str {
        "E40001"
    }
}

fn default_retry_interval() -> u64 {
    5
}

fn default_retry_max_count() -> u32 {
    5
}

fn default_timeout() -> u64 {
    60
}

fn default_polling_count() -> u32 {
    8
}

fn default_polling_interval() -> u64 {
    30
}

fn default_conn_retry_interval() -> u64 {
    2
}

fn default_conn_retry_max_count() -> u32 {
    5
}

fn default_max_workers() -> usize {
    32
}

/// One retry target: a `(statusCode, code)` response class with its own
/// ladder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTarget {
    pub status_code: u16,
    pub code: String,
    #[serde(default = "default_retry_interval")]
    pub interval: u64,
    #[serde(default = "default_retry_max_count")]
    pub max_count: u32,
}

/// Ladder settings used when no retry target matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDefault {
    #[serde(default = "default_retry_interval")]
    pub interval: u64,
    #[serde(default = "default_retry_max_count")]
    pub max_count: u32,
}

impl Default for RetryDefault {
    fn default() -> Self {
        Self {
            interval: default_retry_interval(),
            max_count: default_retry_max_count(),
        }
    }
}

/// Retry configuration for one operation kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEnvelope {
    #[serde(default)]
    pub targets: Vec<RetryTarget>,
    #[serde(default)]
    pub default: RetryDefault,
}

/// Per-kind hardware operation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareOpConfig {
    #[serde(default)]
    pub retry: RetryEnvelope,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for HardwareOpConfig {
    fn default() -> Self {
        Self {
            retry: RetryEnvelope::default(),
            timeout: default_timeout(),
        }
    }
}

/// Post-condition polling envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollingEnvelope {
    #[serde(default = "default_polling_count")]
    pub count: u32,
    /// Poll interval in seconds.
    #[serde(default = "default_polling_interval")]
    pub interval: u64,
}

impl Default for PollingEnvelope {
    fn default() -> Self {
        Self {
            count: default_polling_count(),
            interval: default_polling_interval(),
        }
    }
}

/// A `(statusCode, code)` pair that short-circuits OS-boot confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipTarget {
    pub status_code: u16,
    pub code: String,
}

/// Polling envelope for the OS-boot confirmation check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsBootPolling {
    #[serde(flatten)]
    pub envelope: PollingEnvelope,
    #[serde(default)]
    pub skip: Vec<SkipTarget>,
}

/// Settings forwarded to the confirmation API itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsBootRequest {
    /// Forwarded as the `timeOut` query parameter when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// OS-boot confirmation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsBootConfig {
    #[serde(default)]
    pub polling: OsBootPolling,
    #[serde(default)]
    pub request: OsBootRequest,
    /// Request timeout in seconds for each confirmation call.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for OsBootConfig {
    fn default() -> Self {
        Self {
            polling: OsBootPolling::default(),
            request: OsBootRequest::default(),
            timeout: default_timeout(),
        }
    }
}

/// Hardware-control endpoint plus per-kind settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareControlConfig {
    pub host: String,
    pub port: u16,
    pub uri: String,
    #[serde(default)]
    pub poweron: HardwareOpConfig,
    #[serde(default)]
    pub poweroff: HardwareOpConfig,
    #[serde(default)]
    pub connect: HardwareOpConfig,
    #[serde(default)]
    pub disconnect: HardwareOpConfig,
    #[serde(default)]
    pub isosboot: OsBootConfig,
}

/// Power-state polling envelopes used by the device-info post-conditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoSpecs {
    /// Request timeout in seconds for each device-info call.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub poweroff: PollingEnvelope,
    #[serde(default)]
    pub connect: PollingEnvelope,
    #[serde(default)]
    pub disconnect: PollingEnvelope,
}

impl Default for DeviceInfoSpecs {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            poweroff: PollingEnvelope::default(),
            connect: PollingEnvelope::default(),
            disconnect: PollingEnvelope::default(),
        }
    }
}

/// Device-information endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoConfig {
    pub host: String,
    pub port: u16,
    pub uri: String,
    #[serde(default)]
    pub specs: DeviceInfoSpecs,
}

/// Extended-procedure settings of the workflow manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedProcedureConfig {
    #[serde(default)]
    pub polling: PollingEnvelope,
    #[serde(default)]
    pub retry: RetryEnvelope,
}

/// Workflow-manager endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowManagerConfig {
    pub host: String,
    pub port: u16,
    pub uri: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(rename = "extended-procedure", default)]
    pub extended_procedure: ExtendedProcedureConfig,
}

/// Transport-level connection retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnRetry {
    #[serde(default = "default_conn_retry_interval")]
    pub interval: u64,
    #[serde(default = "default_conn_retry_max_count")]
    pub max_count: u32,
}

impl Default for ConnRetry {
    fn default() -> Self {
        Self {
            interval: default_conn_retry_interval(),
            max_count: default_conn_retry_max_count(),
        }
    }
}

/// Connection retry envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnectionConfig {
    #[serde(default)]
    pub retry: ConnRetry,
}

/// Full executor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub hardware_control: HardwareControlConfig,
    pub get_information: DeviceInfoConfig,
    pub workflow_manager: WorkflowManagerConfig,
    #[serde(default)]
    pub server_connection: ServerConnectionConfig,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl ExecutorConfig {
    /// Enforce all numeric bounds. Called once at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let hw = &self.hardware_control;
        for (name, op) in [
            ("poweron", &hw.poweron),
            ("poweroff", &hw.poweroff),
            ("connect", &hw.connect),
            ("disconnect", &hw.disconnect),
        ] {
            validate_retry(name, &op.retry)?;
            validate_timeout(name, op.timeout)?;
        }

        validate_polling("isosboot", &hw.isosboot.polling.envelope)?;
        validate_timeout("isosboot", hw.isosboot.timeout)?;

        let specs = &self.get_information.specs;
        validate_timeout("get_information.specs", specs.timeout)?;
        validate_polling("get_information.specs.poweroff", &specs.poweroff)?;
        validate_polling("get_information.specs.connect", &specs.connect)?;
        validate_polling("get_information.specs.disconnect", &specs.disconnect)?;

        let wf = &self.workflow_manager;
        validate_timeout("workflow_manager", wf.timeout)?;
        validate_polling(
            "workflow_manager.extended-procedure",
            &wf.extended_procedure.polling,
        )?;
        validate_retry(
            "workflow_manager.extended-procedure",
            &wf.extended_procedure.retry,
        )?;

        if !(1..=128).contains(&self.max_workers) {
            return Err(ConfigError(format!(
                "max_workers must be within 1..=128, got {}",
                self.max_workers
            )));
        }

        Ok(())
    }
}

fn validate_retry(name: &str, retry: &RetryEnvelope) -> Result<(), ConfigError> {
    for target in &retry.targets {
        validate_retry_pair(name, target.interval, target.max_count)?;
    }
    validate_retry_pair(name, retry.default.interval, retry.default.max_count)
}

fn validate_retry_pair(name: &str, interval: u64, max_count: u32) -> Result<(), ConfigError> {
    if interval > 60 {
        return Err(ConfigError(format!(
            "{name}: retry interval must be within 0..=60 seconds, got {interval}"
        )));
    }
    if !(1..=10).contains(&max_count) {
        return Err(ConfigError(format!(
            "{name}: retry max_count must be within 1..=10, got {max_count}"
        )));
    }
    Ok(())
}

fn validate_timeout(name: &str, timeout: u64) -> Result<(), ConfigError> {
    if !(1..=600).contains(&timeout) {
        return Err(ConfigError(format!(
            "{name}: timeout must be within 1..=600 seconds, got {timeout}"
        )));
    }
    Ok(())
}

fn validate_polling(name: &str, polling: &PollingEnvelope) -> Result<(), ConfigError> {
    if !(1..=240).contains(&polling.count) {
        return Err(ConfigError(format!(
            "{name}: polling count must be within 1..=240, got {}",
            polling.count
        )));
    }
    if polling.interval > 240 {
        return Err(ConfigError(format!(
            "{name}: polling interval must be within 0..=240 seconds, got {}",
            polling.interval
        )));
    }
    Ok(())
}
