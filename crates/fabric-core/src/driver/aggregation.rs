//! Connect/disconnect drivers.
//!
//! Both start with a device-information pre-check to decide whether the
//! device is powerable. Powerable devices are booted (connect) or shut down
//! (disconnect) inline before the aggregation request, and the power state
//! is polled afterwards.

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use std::time::Duration;

use crate::plan::Operation;
use crate::plan::result::{GetInformation, OpResult, OpStatus};

use super::power::{self, PowerState, fetch_device_info, poll_power_state};
use super::{
    ApiDrivers, DriverOutcome, LadderEnd, RequestSpec, nonempty, record_failure,
    send_with_retries,
};

/// Pre-check outcome: whether power operations apply to the device.
enum Powerability {
    Powerable,
    NotPowerable,
    /// The device-information read failed; its body is recorded.
    Unavailable(serde_json::Value),
}

async fn check_powerability(d: &ApiDrivers, device_id: &str) -> Powerability {
    let info = fetch_device_info(d, device_id).await;
    match info.info {
        Some(device) if device.is_powerable() => Powerability::Powerable,
        Some(_) => Powerability::NotPowerable,
        None => Powerability::Unavailable(info.body),
    }
}

/// A minimal FAILED result for an operation that never got past its
/// pre-check; the failed device-information body is attached.
fn precheck_failure(op: &Operation, body: serde_json::Value) -> OpResult {
    let mut result = OpResult::bare(op.id, OpStatus::Failed);
    result.get_information = Some(GetInformation {
        response_body: body,
    });
    result
}

/// Connect driver.
///
/// Powerable devices are booted first (including OS-boot verification) and
/// polled until the power state reports `On`; only then is the aggregation
/// request issued. Non-powerable devices are connected directly.
pub(crate) async fn connect(d: &ApiDrivers, op: &Operation) -> DriverOutcome {
    let started_at = Utc::now();
    let device_id = op.device_id.as_deref().unwrap_or_default();
    let cpu_id = op.cpu_id.as_deref().unwrap_or_default();

    let powerable = match check_powerability(d, device_id).await {
        Powerability::Powerable => true,
        Powerability::NotPowerable => false,
        Powerability::Unavailable(body) => {
            let mut result = precheck_failure(op, body);
            result.started_at = Some(started_at);
            result.ended_at = Some(Utc::now());
            return DriverOutcome::new(result);
        }
    };

    if powerable {
        let boot = power::boot(d, op).await;
        if boot.result.status == OpStatus::Failed {
            return boot;
        }

        let poll = poll_power_state(
            d,
            device_id,
            PowerState::On,
            &d.config.get_information.specs.connect,
        )
        .await;
        if !poll.reached {
            let body = poll
                .error_body
                .unwrap_or_else(|| json!({ "powerState": poll.last_state }));
            let mut result = precheck_failure(op, body);
            result.started_at = Some(started_at);
            result.ended_at = Some(Utc::now());
            return DriverOutcome::new(result);
        }
    }

    let uri = d.aggregations_url(cpu_id);
    let request_body = json!({ "action": "connect", "deviceID": device_id });

    let mut result = OpResult::bare(op.id, OpStatus::Completed);
    result.started_at = Some(started_at);
    result.uri = Some(uri.clone());
    result.method = Some("PUT".into());
    result.request_body = Some(request_body.clone());

    let spec = RequestSpec {
        method: Method::PUT,
        uri,
        query: None,
        body: Some(request_body),
        timeout: Duration::from_secs(d.config.hardware_control.connect.timeout),
        success_status: 200,
    };

    let mut suspended = false;
    match send_with_retries(&d.client, &spec, &d.config.hardware_control.connect.retry).await {
        LadderEnd::Success(resp) => {
            result.status_code = Some(resp.status);
            result.response_body = nonempty(resp.body);
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

/// Disconnect driver.
///
/// Powerable devices are shut down first; the aggregation request follows,
/// and the power state is polled until `Off`. Non-powerable devices are
/// disconnected directly with no power-off and no post-poll.
pub(crate) async fn disconnect(d: &ApiDrivers, op: &Operation) -> DriverOutcome {
    let started_at = Utc::now();
    let device_id = op.device_id.as_deref().unwrap_or_default();
    let cpu_id = op.cpu_id.as_deref().unwrap_or_default();

    let powerable = match check_powerability(d, device_id).await {
        Powerability::Powerable => true,
        Powerability::NotPowerable => false,
        Powerability::Unavailable(body) => {
            let mut result = precheck_failure(op, body);
            result.started_at = Some(started_at);
            result.ended_at = Some(Utc::now());
            return DriverOutcome::new(result);
        }
    };

    if powerable {
        let off = power::shutdown(d, op).await;
        if off.result.status == OpStatus::Failed {
            return off;
        }
    }

    let uri = d.aggregations_url(cpu_id);
    let request_body = json!({ "action": "disconnect", "deviceID": device_id });

    let mut result = OpResult::bare(op.id, OpStatus::Completed);
    result.started_at = Some(started_at);
    result.uri = Some(uri.clone());
    result.method = Some("PUT".into());
    result.request_body = Some(request_body.clone());

    let spec = RequestSpec {
        method: Method::PUT,
        uri,
        query: None,
        body: Some(request_body),
        timeout: Duration::from_secs(d.config.hardware_control.disconnect.timeout),
        success_status: 200,
    };

    let mut suspended = false;
    match send_with_retries(&d.client, &spec, &d.config.hardware_control.disconnect.retry).await {
        LadderEnd::Success(resp) => {
            result.status_code = Some(resp.status);
            result.response_body = nonempty(resp.body);

            if powerable {
                let poll = poll_power_state(
                    d,
                    device_id,
                    PowerState::Off,
                    &d.config.get_information.specs.disconnect,
                )
                .await;
                if !poll.reached {
                    let body = poll
                        .error_body
                        .unwrap_or_else(|| json!({ "powerState": poll.last_state }));
                    result.status = OpStatus::Failed;
                    result.get_information = Some(GetInformation {
                        response_body: body,
                    });
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
