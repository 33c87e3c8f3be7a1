//! Per-kind operation drivers.
//!
//! Each driver wraps one external API call with its retry ladder and
//! post-condition polling. A driver never returns an error from `execute`;
//! failure is a data value in the [`OpResult`] so the scheduler only ever
//! sees typed outcomes.

pub mod aggregation;
pub mod power;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::client::{ApiClient, ApiResponse};
use crate::config::{ExecutorConfig, RetryEnvelope};
use crate::plan::result::{OpResult, OpStatus};
use crate::plan::{OpKind, Operation};

/// What a driver hands back to the scheduler.
#[derive(Debug, Clone)]
pub struct DriverOutcome {
    pub result: OpResult,
    /// Set when a retry ladder was exhausted: the apply should suspend so an
    /// operator can inspect and resume.
    pub suspended: bool,
}

impl DriverOutcome {
    pub fn new(result: OpResult) -> Self {
        Self {
            result,
            suspended: false,
        }
    }
}

/// The seam between the scheduler and the operation drivers.
#[async_trait]
pub trait OperationDriver: Send + Sync {
    async fn execute(&self, op: &Operation) -> DriverOutcome;
}

/// The production driver set: dispatches each operation kind to its driver,
/// sharing one HTTP client and the executor configuration.
pub struct ApiDrivers {
    pub(crate) client: ApiClient,
    pub(crate) config: Arc<ExecutorConfig>,
    pub(crate) apply_id: String,
}

impl ApiDrivers {
    pub fn new(config: Arc<ExecutorConfig>, apply_id: impl Into<String>) -> Self {
        let client = ApiClient::new(&config.server_connection.retry);
        Self {
            client,
            config,
            apply_id: apply_id.into(),
        }
    }

    pub(crate) fn power_url(&self, device_id: &str) -> String {
        let hw = &self.config.hardware_control;
        format!(
            "http://{}:{}/{}/devices/{}/power",
            hw.host, hw.port, hw.uri, device_id
        )
    }

    pub(crate) fn aggregations_url(&self, cpu_id: &str) -> String {
        let hw = &self.config.hardware_control;
        format!(
            "http://{}:{}/{}/cpu/{}/aggregations",
            hw.host, hw.port, hw.uri, cpu_id
        )
    }

    pub(crate) fn is_os_ready_url(&self, device_id: &str) -> String {
        let hw = &self.config.hardware_control;
        format!(
            "http://{}:{}/{}/cpu/{}/is-os-ready",
            hw.host, hw.port, hw.uri, device_id
        )
    }

    pub(crate) fn device_info_url(&self, device_id: &str) -> String {
        let info = &self.config.get_information;
        format!(
            "http://{}:{}/{}/devices/{}/specs",
            info.host, info.port, info.uri, device_id
        )
    }

    pub(crate) fn extended_procedure_url(&self) -> String {
        let wf = &self.config.workflow_manager;
        format!("http://{}:{}/{}/extended-procedure", wf.host, wf.port, wf.uri)
    }

    pub(crate) fn extended_procedure_status_url(&self, procedure_id: &str) -> String {
        let wf = &self.config.workflow_manager;
        format!(
            "http://{}:{}/{}/extended-procedure/{}",
            wf.host, wf.port, wf.uri, procedure_id
        )
    }
}

#[async_trait]
impl OperationDriver for ApiDrivers {
    async fn execute(&self, op: &Operation) -> DriverOutcome {
        info!(operation_id = op.id, kind = %op.kind, "start operation");
        let outcome = match op.kind {
            OpKind::Boot => power::boot(self, op).await,
            OpKind::Shutdown => power::shutdown(self, op).await,
            OpKind::Connect => aggregation::connect(self, op).await,
            OpKind::Disconnect => aggregation::disconnect(self, op).await,
            OpKind::Start | OpKind::Stop => workflow::extended_procedure(self, op).await,
        };
        info!(
            operation_id = op.id,
            status = %outcome.result.status,
            suspended = outcome.suspended,
            "end operation"
        );
        outcome
    }
}

// -----------------------------------------------------------------------
// Shared retry ladder
// -----------------------------------------------------------------------

/// One request as a driver issues it, reissued verbatim on retry.
pub(crate) struct RequestSpec {
    pub method: Method,
    pub uri: String,
    pub query: Option<Vec<(&'static str, String)>>,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub success_status: u16,
}

/// Where a retry ladder ended up.
pub(crate) enum LadderEnd {
    Success(ApiResponse),
    Failed {
        status_code: u16,
        body: Value,
        suspended: bool,
    },
}

async fn issue(client: &ApiClient, spec: &RequestSpec) -> Result<ApiResponse, crate::client::TransportError> {
    client
        .request(
            spec.method.clone(),
            &spec.uri,
            spec.query.as_deref(),
            spec.body.as_ref(),
            spec.timeout,
        )
        .await
}

/// Issue a request and walk its retry ladder.
///
/// The first non-success response selects a ladder: the matching retry
/// target's `(interval, max_count)` when the `(statusCode, code)` tuple
/// matches one, the default envelope otherwise. The identical request is
/// reissued until success, a transport error, or exhaustion. A transport
/// error on the first attempt is terminal without suspension; once the
/// ladder has been entered, any non-success end suspends the apply.
pub(crate) async fn send_with_retries(
    client: &ApiClient,
    spec: &RequestSpec,
    retry: &RetryEnvelope,
) -> LadderEnd {
    let (mut status, mut body) = match issue(client, spec).await {
        Ok(resp) if resp.status == spec.success_status => return LadderEnd::Success(resp),
        Ok(resp) => (resp.status, resp.body),
        Err(err) => {
            error!(code = err.code(), uri = %spec.uri, "{}", err.message);
            return LadderEnd::Failed {
                status_code: err.status_code(),
                body: err.body(),
                suspended: false,
            };
        }
    };

    let error_code = body.get("code").and_then(Value::as_str);
    let target = retry
        .targets
        .iter()
        .find(|t| t.status_code == status && error_code == Some(t.code.as_str()));
    let (interval, max_count) = match target {
        Some(t) => (t.interval, t.max_count),
        None => (retry.default.interval, retry.default.max_count),
    };

    let mut count: u32 = 0;
    while count != max_count {
        warn!(
            uri = %spec.uri,
            status,
            retry_count = count,
            "request failed, retrying"
        );
        tokio::time::sleep(Duration::from_secs(interval)).await;
        match issue(client, spec).await {
            Ok(resp) if resp.status == spec.success_status => return LadderEnd::Success(resp),
            Ok(resp) => {
                status = resp.status;
                body = resp.body;
                count += 1;
            }
            Err(err) => {
                error!(code = err.code(), uri = %spec.uri, "{}", err.message);
                status = err.status_code();
                body = err.body();
                break;
            }
        }
    }

    // E40025: a response class kept failing through its whole ladder. This
    // is treated as serious enough to suspend the apply for inspection.
    error!(
        code = "E40025",
        uri = %spec.uri,
        status,
        "retries exhausted, suspending apply"
    );
    LadderEnd::Failed {
        status_code: status,
        body,
        suspended: true,
    }
}

/// Elide empty response bodies from results.
pub(crate) fn nonempty(body: Value) -> Option<Value> {
    match body {
        Value::Null => None,
        other => Some(other),
    }
}

/// Record a ladder failure into a result.
pub(crate) fn record_failure(result: &mut OpResult, status_code: u16, body: Value) {
    result.status = OpStatus::Failed;
    result.status_code = Some(status_code);
    result.response_body = nonempty(body);
}
