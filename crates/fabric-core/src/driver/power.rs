//! Power drivers: boot (power-on + OS-boot confirmation), shutdown
//! (power-off + CPU power-state polling), and the shared device-information
//! read.

use chrono::Utc;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, info};

use crate::config::PollingEnvelope;
use crate::plan::Operation;
use crate::plan::result::{GetInformation, OpResult, OpStatus, OsBootCheck};

use super::{
    ApiDrivers, DriverOutcome, LadderEnd, RequestSpec, nonempty, record_failure,
    send_with_retries,
};

/// Observable power states of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
    PoweringOff,
    PoweringOn,
    Paused,
    Unknown,
}

/// Device-information response contract.
///
/// `type` is normalized to upper-case before parsing; unknown power states
/// or a non-boolean `powerCapability` fail the schema.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "powerState", default)]
    pub power_state: Option<PowerState>,
    #[serde(rename = "powerCapability", default)]
    pub power_capability: Option<bool>,
}

impl DeviceInfo {
    /// Whether power operations may be issued against the device.
    pub fn is_powerable(&self) -> bool {
        self.device_type != "CPU" && self.power_capability == Some(true)
    }
}

/// Result of a device-information read.
pub(crate) struct DeviceInfoResult {
    pub status: u16,
    pub body: Value,
    /// Present only when the response was 200 and passed the schema.
    pub info: Option<DeviceInfo>,
}

/// Read device information, validating the response schema.
///
/// A schema violation downgrades the response to a 400 so callers treat it
/// as a failed read.
pub(crate) async fn fetch_device_info(d: &ApiDrivers, device_id: &str) -> DeviceInfoResult {
    let uri = d.device_info_url(device_id);
    let timeout = Duration::from_secs(d.config.get_information.specs.timeout);

    let (status, body) = match d.client.request(Method::GET, &uri, None, None, timeout).await {
        Ok(resp) => (resp.status, resp.body),
        Err(err) => {
            error!(code = err.code(), uri = %uri, "{}", err.message);
            (err.status_code(), err.body())
        }
    };

    let mut body = body;
    // The control plane reports `type` in mixed case; normalize before use.
    if let Some(ty) = body.get_mut("type") {
        if let Value::String(s) = ty {
            *s = s.to_uppercase();
        }
    }

    let info = if status == 200 {
        match serde_json::from_value::<DeviceInfo>(body.clone()) {
            Ok(info) => Some(info),
            Err(err) => {
                error!(code = "E40001", device_id, "invalid device information: {err}");
                None
            }
        }
    } else {
        None
    };

    let status = if status == 200 && info.is_none() {
        400
    } else {
        status
    };

    if status != 200 {
        error!(code = "E40023", device_id, status, "failed to get device information");
    }

    DeviceInfoResult { status, body, info }
}

/// Result of polling for a target power state.
pub(crate) struct PowerPoll {
    pub reached: bool,
    /// Set when a device-info read failed mid-poll; polling stops there.
    pub error_body: Option<Value>,
    pub last_state: Option<PowerState>,
}

/// Poll device information until the target power state is observed.
pub(crate) async fn poll_power_state(
    d: &ApiDrivers,
    device_id: &str,
    target: PowerState,
    envelope: &PollingEnvelope,
) -> PowerPoll {
    let mut count = 0;
    let mut last_state = None;
    while count != envelope.count {
        let info = fetch_device_info(d, device_id).await;
        let Some(info) = info.info else {
            return PowerPoll {
                reached: false,
                error_body: Some(info.body),
                last_state,
            };
        };
        last_state = info.power_state;
        if info.power_state == Some(target) {
            return PowerPoll {
                reached: true,
                error_body: None,
                last_state,
            };
        }
        count += 1;
        tokio::time::sleep(Duration::from_secs(envelope.interval)).await;
    }
    error!(
        code = "E40029",
        device_id,
        target = ?target,
        last = ?last_state,
        "power state was not reached"
    );
    PowerPoll {
        reached: false,
        error_body: None,
        last_state,
    }
}

// -----------------------------------------------------------------------
// Boot
// -----------------------------------------------------------------------

/// Outcome of the OS-boot confirmation check.
pub(crate) enum BootCheckOutcome {
    Passed,
    /// A configured skip target matched; the boot completes unverified.
    Skipped,
    Failed,
}

/// Poll the OS-boot confirmation API until the OS reports booted.
pub(crate) async fn confirm_os_boot(
    d: &ApiDrivers,
    device_id: &str,
) -> (OsBootCheck, BootCheckOutcome) {
    let cfg = &d.config.hardware_control.isosboot;
    let uri = d.is_os_ready_url(device_id);
    let timeout = Duration::from_secs(cfg.timeout);
    let query: Option<Vec<(&'static str, String)>> = cfg
        .request
        .timeout
        .map(|t| vec![("timeOut", t.to_string())]);

    let mut check = OsBootCheck {
        uri: Some(uri.clone()),
        method: Some("GET".into()),
        status_code: None,
        query_parameter: cfg.request.timeout.map(|t| json!({ "timeOut": t })),
        response_body: None,
    };

    let mut count = 0;
    let (status, body, outcome) = loop {
        match d
            .client
            .request(Method::GET, &uri, query.as_deref(), None, timeout)
            .await
        {
            Ok(resp) => {
                let booted = resp.body.get("status").and_then(Value::as_bool);
                if resp.status == 200 && booted == Some(true) {
                    break (resp.status, resp.body, BootCheckOutcome::Passed);
                }
                if resp.status == 200 && booted == Some(false) {
                    count += 1;
                    if count == cfg.polling.envelope.count {
                        error!(code = "E40021", device_id, "OS boot confirmation exhausted");
                        break (resp.status, resp.body, BootCheckOutcome::Failed);
                    }
                    info!(
                        device_id,
                        polling_count = count,
                        limit = cfg.polling.envelope.count,
                        "OS not started yet"
                    );
                    tokio::time::sleep(Duration::from_secs(cfg.polling.envelope.interval)).await;
                    continue;
                }
                let error_code = resp.body.get("code").and_then(Value::as_str);
                let skipped = cfg.polling.skip.iter().any(|s| {
                    s.status_code == resp.status && error_code == Some(s.code.as_str())
                });
                if skipped {
                    info!(device_id, "skip running OS boot confirmation");
                    break (resp.status, resp.body, BootCheckOutcome::Skipped);
                }
                error!(code = "E40021", device_id, status = resp.status, "OS boot check failed");
                break (resp.status, resp.body, BootCheckOutcome::Failed);
            }
            Err(err) => {
                error!(code = err.code(), uri = %uri, "{}", err.message);
                break (err.status_code(), err.body(), BootCheckOutcome::Failed);
            }
        }
    };

    check.status_code = Some(status);
    check.response_body = nonempty(body);
    (check, outcome)
}

/// Boot driver: power the device on, then confirm the OS came up.
pub(crate) async fn boot(d: &ApiDrivers, op: &Operation) -> DriverOutcome {
    let device_id = op.device_id.as_deref().unwrap_or_default();
    let uri = d.power_url(device_id);
    let request_body = json!({ "action": "on" });

    let mut result = OpResult::bare(op.id, OpStatus::Completed);
    result.started_at = Some(Utc::now());
    result.uri = Some(uri.clone());
    result.method = Some("PUT".into());
    result.request_body = Some(request_body.clone());

    let spec = RequestSpec {
        method: Method::PUT,
        uri,
        query: None,
        body: Some(request_body),
        timeout: Duration::from_secs(d.config.hardware_control.poweron.timeout),
        success_status: 200,
    };

    let mut suspended = false;
    match send_with_retries(&d.client, &spec, &d.config.hardware_control.poweron.retry).await {
        LadderEnd::Success(resp) => {
            result.status_code = Some(resp.status);
            result.response_body = nonempty(resp.body);

            let (check, outcome) = confirm_os_boot(d, device_id).await;
            match outcome {
                BootCheckOutcome::Skipped => {}
                BootCheckOutcome::Passed => {
                    result.is_os_boot = Some(check);
                }
                BootCheckOutcome::Failed => {
                    result.is_os_boot = Some(check);
                    result.status = OpStatus::Failed;
                }
            }
        }
        LadderEnd::Failed {
            status_code,
            body,
            suspended: s,
        } => {
            record_failure(&mut result, status_code, body);
            suspended = s;
        }
    }

    result.ended_at = Some(Utc::now());
    DriverOutcome { result, suspended }
}

// -----------------------------------------------------------------------
// Shutdown
// -----------------------------------------------------------------------

/// Shutdown driver: power the device off; for CPUs, poll until the power
/// state reports `Off`.
pub(crate) async fn shutdown(d: &ApiDrivers, op: &Operation) -> DriverOutcome {
    let device_id = op.device_id.as_deref().unwrap_or_default();
    let uri = d.power_url(device_id);
    let request_body = json!({ "action": "off" });

    let mut result = OpResult::bare(op.id, OpStatus::Completed);
    result.started_at = Some(Utc::now());
    result.uri = Some(uri.clone());
    result.method = Some("PUT".into());
    result.request_body = Some(request_body.clone());

    let spec = RequestSpec {
        method: Method::PUT,
        uri,
        query: None,
        body: Some(request_body),
        timeout: Duration::from_secs(d.config.hardware_control.poweroff.timeout),
        success_status: 200,
    };

    let mut suspended = false;
    match send_with_retries(&d.client, &spec, &d.config.hardware_control.poweroff.retry).await {
        LadderEnd::Success(resp) => {
            result.status_code = Some(resp.status);
            result.response_body = nonempty(resp.body);

            let info = fetch_device_info(d, device_id).await;
            match &info.info {
                Some(device) if device.device_type == "CPU" => {
                    let poll = poll_power_state(
                        d,
                        device_id,
                        PowerState::Off,
                        &d.config.get_information.specs.poweroff,
                    )
                    .await;
                    result.get_information = Some(GetInformation {
                        response_body: json!({ "powerState": poll.last_state }),
                    });
                    if !poll.reached {
                        result.status = OpStatus::Failed;
                    }
                }
                Some(_) => {}
                None => {
                    // Could not read device information after the power-off.
                    result.status = OpStatus::Failed;
                    result.status_code = Some(500);
                    result.response_body = None;
                }
            }
        }
        LadderEnd::Failed {
            status_code,
            body,
            suspended: s,
        } => {
            record_failure(&mut result, status_code, body);
            suspended = s;
        }
    }

    result.ended_at = Some(Utc::now());
    DriverOutcome { result, suspended }
}
