//! Built-in simulated executors.
//!
//! One per domain. They do no real inference: after an optional delay they
//! report a fixed success message. Two payload flags let callers exercise the
//! failure paths end to end:
//!
//! - `"forceTransientFail": true` → [`ExecutionError::Transient`]
//! - `"forceFail": true` → [`ExecutionError::Failed`]

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use taskforge_core::{CapabilityType, DomainType, ExecutionMetrics};
use tokio_util::sync::CancellationToken;

use crate::executor::TaskExecutor;
use crate::result::{ExecutionError, ExecutionOutput};

pub const SIMULATED_MODEL: &str = "mock-executor";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailureFlags {
    #[serde(default)]
    force_transient_fail: bool,
    #[serde(default)]
    force_fail: bool,
}

impl FailureFlags {
    /// Non-object or non-JSON payloads carry no flags.
    fn from_payload(payload: &str) -> Self {
        serde_json::from_str(payload).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    domain: DomainType,
    name: String,
    latency: Duration,
}

impl SimulatedExecutor {
    pub fn new(domain: DomainType) -> Self {
        Self {
            domain,
            name: format!("simulated-{}", domain.as_str()),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait::async_trait]
impl TaskExecutor for SimulatedExecutor {
    fn domain(&self) -> DomainType {
        self.domain
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        capability: CapabilityType,
        payload: &str,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::cancelled("cancelled before start"));
        }
        if !self.latency.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(ExecutionError::cancelled("cancelled during execution"));
                }
                _ = tokio::time::sleep(self.latency) => {}
            }
        }

        let flags = FailureFlags::from_payload(payload);
        if flags.force_transient_fail {
            return Err(ExecutionError::transient("Temporary AI provider error."));
        }
        if flags.force_fail {
            return Err(ExecutionError::failed(
                "Execution failed by forceFail payload flag.",
            ));
        }

        let content = format!(
            "Domain {} processed task type {} successfully at {}.",
            self.domain,
            capability,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let metrics = ExecutionMetrics::default()
            .with_model(SIMULATED_MODEL)
            .with_tokens(0, 0)
            .with_cost(0.0);

        Ok(ExecutionOutput::new(content).with_metrics(metrics))
    }
}
