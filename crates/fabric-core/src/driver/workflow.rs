//! Start/stop drivers: extended procedures of the workflow manager.
//!
//! The POST is accepted with 202 and an `extendedProcedureID`; the driver
//! then polls the status endpoint until the procedure reaches a terminal
//! state or the polling budget runs out.

use chrono::Utc;
use reqwest::Method;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{error, info};

use crate::plan::Operation;
use crate::plan::result::{OpResult, OpStatus};

use super::{
    ApiDrivers, DriverOutcome, LadderEnd, RequestSpec, nonempty, record_failure,
    send_with_retries,
};

const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";
const STATUS_COMPLETED: &str = "COMPLETED";
const STATUS_FAILED: &str = "FAILED";

/// Start/stop driver.
pub(crate) async fn extended_procedure(d: &ApiDrivers, op: &Operation) -> DriverOutcome {
    let uri = d.extended_procedure_url();
    let request_body = json!({
        "applyID": d.apply_id,
        "targetCPUID": op.cpu_id,
        "targetRequestInstanceID": op.request_instance_id,
        "operation": op.kind,
    });

    let mut result = OpResult::bare(op.id, OpStatus::Completed);
    result.started_at = Some(Utc::now());
    result.uri = Some(uri.clone());
    result.method = Some("POST".into());
    result.request_body = Some(request_body.clone());

    let wf = &d.config.workflow_manager;
    let spec = RequestSpec {
        method: Method::POST,
        uri,
        query: None,
        body: Some(request_body),
        timeout: Duration::from_secs(wf.timeout),
        success_status: 202,
    };

    let mut suspended = false;
    match send_with_retries(&d.client, &spec, &wf.extended_procedure.retry).await {
        LadderEnd::Success(resp) => {
            result.status_code = Some(resp.status);
            result.response_body = nonempty(resp.body.clone());

            match procedure_id(&resp.body) {
                Some(procedure_id) => {
                    info!(
                        operation_id = op.id,
                        extended_procedure_id = %procedure_id,
                        "extended procedure accepted"
                    );
                    if !poll_until_complete(d, &procedure_id).await {
                        let message = format!(
                            "extended procedure for {} did not complete",
                            op.request_instance_id.as_deref().unwrap_or_default()
                        );
                        error!(code = "E40033", operation_id = op.id, "{message}");
                        result.status = OpStatus::Failed;
                        result.response_body = Some(json!({
                            "code": "E40033",
                            "message": message,
                        }));
                    }
                }
                None => {
                    // Without an id there is nothing to poll; the accept is
                    // not enough to call the operation done.
                    error!(
                        operation_id = op.id,
                        "extended procedure response did not carry an extendedProcedureID"
                    );
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

fn procedure_id(body: &Value) -> Option<String> {
    match body.get("extendedProcedureID")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Poll the extended-procedure status endpoint.
///
/// Returns `true` only when the procedure reports COMPLETED. A response that
/// fails the status schema ends polling immediately.
async fn poll_until_complete(d: &ApiDrivers, procedure_id: &str) -> bool {
    let wf = &d.config.workflow_manager;
    let envelope = &wf.extended_procedure.polling;
    let uri = d.extended_procedure_status_url(procedure_id);
    let timeout = Duration::from_secs(wf.timeout);

    let mut count = 0;
    while count != envelope.count {
        let response = d
            .client
            .request(Method::GET, &uri, None, None, timeout)
            .await;
        match response {
            Ok(resp) if resp.status == 200 => {
                match resp.body.get("status").and_then(Value::as_str) {
                    Some(STATUS_COMPLETED) => return true,
                    Some(STATUS_FAILED) => return false,
                    Some(STATUS_IN_PROGRESS) => {
                        count += 1;
                        tokio::time::sleep(Duration::from_secs(envelope.interval)).await;
                    }
                    other => {
                        error!(
                            code = "E40001",
                            extended_procedure_id = procedure_id,
                            status = ?other,
                            "invalid extended procedure status"
                        );
                        error!(
                            code = "E40034",
                            extended_procedure_id = procedure_id,
                            "failed to read extended procedure information"
                        );
                        return false;
                    }
                }
            }
            Ok(resp) => {
                error!(
                    code = "E40034",
                    extended_procedure_id = procedure_id,
                    status = resp.status,
                    "failed to read extended procedure information"
                );
                return false;
            }
            Err(err) => {
                error!(code = err.code(), uri = %uri, "{}", err.message);
                error!(
                    code = "E40034",
                    extended_procedure_id = procedure_id,
                    "failed to read extended procedure information"
                );
                return false;
            }
        }
    }
    false
}
