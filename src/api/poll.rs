//! Polling and retry primitives.
//!
//! Every wait in the crate (operation status, resource settling, the
//! repository create backoff) runs through [`poll_until`] with an explicit
//! [`RetryPolicy`].

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::{DevOpsApi, parse_body, remote_error};
use super::org_url::ApiFamily;
use super::transport::{ApiRequest, ApiResponse};
use crate::error::{ReconcileError, ReconcileResult};

/// API version for the operations endpoint.
pub const OPERATIONS_API_VERSION: &str = "7.1-preview.1";

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Every delay equals the base interval.
    Fixed,
    /// The delay doubles after each attempt, capped at `max`.
    Exponential { max: Duration },
}

/// How often, and for how long, to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub backoff: Backoff,
    /// Total number of probe attempts; `None` is unbounded.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the first attempt; `None` is unbounded.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub const fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff: Backoff::Fixed,
            max_attempts: None,
            timeout: None,
        }
    }

    pub const fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            interval: initial,
            backoff: Backoff::Exponential { max },
            max_attempts: None,
            timeout: None,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay to wait after the given (1-based) attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential { max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.interval.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Result of a single probe.
#[derive(Debug)]
pub enum Step<T, E> {
    Done(T),
    /// Not ready yet; carries the reason for diagnostics.
    Retry(E),
}

/// Result of [`poll_until`].
#[derive(Debug)]
pub enum PollOutcome<T, E> {
    Ready(T),
    /// Attempts or time ran out; carries the last retry reason.
    Exhausted(Option<E>),
}

/// Runs `probe` until it reports [`Step::Done`], the policy is exhausted, or
/// `cancel` fires.
///
/// The probe receives the 1-based attempt number. Probe errors abort polling
/// immediately.
pub async fn poll_until<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> ReconcileResult<PollOutcome<T, E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ReconcileResult<Step<T, E>>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        attempt += 1;

        let last = match probe(attempt).await? {
            Step::Done(value) => return Ok(PollOutcome::Ready(value)),
            Step::Retry(reason) => Some(reason),
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Ok(PollOutcome::Exhausted(last));
        }

        let mut delay = policy.delay_after(attempt);
        if let Some(timeout) = policy.timeout {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Ok(PollOutcome::Exhausted(last));
            }
            delay = delay.min(timeout - elapsed);
        }

        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before next attempt");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Outcome of waiting for a resource to settle.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome<T> {
    Settled(T),
    TimedOut,
}

/// Polls `probe` until it reports [`Step::Done`] or the policy runs out.
///
/// Running out is not an error: it is logged and reported as
/// [`SettleOutcome::TimedOut`].
pub async fn wait_for_state<T, E, F, Fut>(
    api: &DevOpsApi,
    what: &str,
    policy: &RetryPolicy,
    probe: F,
) -> ReconcileResult<SettleOutcome<T>>
where
    E: std::fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ReconcileResult<Step<T, E>>>,
{
    match poll_until(policy, api.cancel_token(), probe).await? {
        PollOutcome::Ready(value) => Ok(SettleOutcome::Settled(value)),
        PollOutcome::Exhausted(last) => {
            warn!(resource = what, last_seen = ?last, "Timed out waiting for resource to settle; continuing");
            Ok(SettleOutcome::TimedOut)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    status: String,
    result_message: Option<String>,
}

/// Polling interval for long-running operations.
pub const OPERATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Waits for a long-running operation to reach a terminal status.
///
/// `succeeded` returns; `failed` or `cancelled` is an
/// [`ReconcileError::OperationFailed`]. There is no overall timeout.
pub async fn wait_for_operation(api: &DevOpsApi, operation_id: &str) -> ReconcileResult<()> {
    let url = api.url(
        ApiFamily::Core,
        &format!(
            "_apis/operations/{}?api-version={OPERATIONS_API_VERSION}",
            urlencoding::encode(operation_id)
        ),
    )?;
    let policy = RetryPolicy::fixed(OPERATION_POLL_INTERVAL);

    let outcome = poll_until(&policy, api.cancel_token(), |_| {
        let url = url.clone();
        async move {
            let response = api.send(ApiRequest::get(url)).await?;
            if !response.is_success() {
                return Err(remote_error(
                    response,
                    &format!("read status of operation {operation_id}"),
                ));
            }
            let status: OperationStatus =
                parse_body(&response, &format!("operation {operation_id}"))?;
            match status.status.to_ascii_lowercase().as_str() {
                "succeeded" => Ok(Step::Done(())),
                "failed" | "cancelled" => Err(ReconcileError::OperationFailed {
                    operation_id: operation_id.to_string(),
                    status: status.status,
                    message: status.result_message.unwrap_or_default(),
                }),
                _ => Ok(Step::Retry(status.status)),
            }
        }
    })
    .await?;

    match outcome {
        PollOutcome::Ready(()) => Ok(()),
        // Unreachable with an unbounded policy, reported for completeness.
        PollOutcome::Exhausted(last) => Err(ReconcileError::OperationFailed {
            operation_id: operation_id.to_string(),
            status: last.unwrap_or_default(),
            message: "stopped polling before a terminal status".to_string(),
        }),
    }
}

/// Extracts an operation id from a create response: the body's `id`, or the
/// last path segment of the `Location` header.
pub fn operation_id(response: &ApiResponse) -> Option<String> {
    let from_body = serde_json::from_str::<serde_json::Value>(&response.body)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .filter(|id| !id.is_empty());
    if from_body.is_some() {
        return from_body;
    }

    response.header("location").and_then(|location| {
        let path = location.split(['?', '#']).next().unwrap_or(location);
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::mocks::api_for;
    use crate::api::transport::Method;
    use crate::api::transport::mocks::MockTransport;
    use crate::config::LookupPolicy;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (1..=8).map(|a| policy.delay_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        let fixed = RetryPolicy::fixed(Duration::from_secs(2));
        assert_eq!(fixed.delay_after(7), Duration::from_secs(2));
    }

    /// # Attempt Limit
    ///
    /// Tests that polling stops after exactly max_attempts probes.
    ///
    /// ## Test Scenario
    /// - Probe always asks for a retry, policy allows 4 attempts
    ///
    /// ## Expected Outcome
    /// - Exhausted with the last reason after 4 probes
    #[tokio::test(start_paused = true)]
    async fn test_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(Duration::from_secs(1)).with_max_attempts(4);

        let outcome = poll_until(&policy, &CancellationToken::new(), |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Step<(), u32>, ReconcileError>(Step::Retry(attempt))
            }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Exhausted(Some(4))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_reported() {
        let policy = RetryPolicy::fixed(Duration::from_secs(2)).with_timeout(Duration::from_secs(10));
        let started = Instant::now();

        let outcome = poll_until(&policy, &CancellationToken::new(), |_| async {
            Ok::<Step<(), &str>, ReconcileError>(Step::Retry("creating"))
        })
        .await
        .unwrap();

        assert!(matches!(outcome, PollOutcome::Exhausted(Some("creating"))));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::fixed(Duration::from_secs(3600));
        let trigger = cancel.clone();

        let result = poll_until(&policy, &cancel, |_| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok::<Step<(), ()>, ReconcileError>(Step::Retry(()))
            }
        })
        .await;

        assert!(matches!(result, Err(ReconcileError::Cancelled)));
    }

    /// # Operation Polling
    ///
    /// Tests that an operation is polled until it succeeds.
    ///
    /// ## Test Scenario
    /// - Operation reports inProgress twice, then succeeded
    ///
    /// ## Expected Outcome
    /// - Returns Ok after three status reads
    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operation_succeeds() {
        let mock = MockTransport::new();
        mock.on(Method::Get, "/_apis/operations/op-1", ApiResponse::json(200, json!({"status": "inProgress"})))
            .on(Method::Get, "/_apis/operations/op-1", ApiResponse::json(200, json!({"status": "inProgress"})))
            .on(Method::Get, "/_apis/operations/op-1", ApiResponse::json(200, json!({"status": "succeeded"})));
        let api = api_for(&mock, LookupPolicy::Strict);

        wait_for_operation(&api, "op-1").await.unwrap();
        assert_eq!(mock.count(Method::Get, "/_apis/operations/op-1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operation_failed() {
        let mock = MockTransport::new();
        mock.on(
            Method::Get,
            "/_apis/operations/op-2",
            ApiResponse::json(200, json!({"status": "failed", "resultMessage": "quota exceeded"})),
        );
        let api = api_for(&mock, LookupPolicy::Strict);

        match wait_for_operation(&api, "op-2").await.unwrap_err() {
            ReconcileError::OperationFailed { status, message, .. } => {
                assert_eq!(status, "failed");
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_operation_status_read_failure() {
        let mock = MockTransport::new();
        mock.on(Method::Get, "/_apis/operations/op-3", ApiResponse::new(500, "boom"));
        let api = api_for(&mock, LookupPolicy::Strict);

        let err = wait_for_operation(&api, "op-3").await.unwrap_err();
        assert!(matches!(err, ReconcileError::RemoteOperation { status: 500, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_state_times_out_without_error() {
        let mock = MockTransport::new();
        let api = api_for(&mock, LookupPolicy::Strict);
        let policy = RetryPolicy::fixed(Duration::from_secs(2)).with_timeout(Duration::from_secs(300));

        let outcome: SettleOutcome<()> = wait_for_state(&api, "project 'p'", &policy, |_| async {
            Ok::<Step<(), String>, ReconcileError>(Step::Retry("new".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(outcome, SettleOutcome::TimedOut);
    }

    #[test]
    fn test_operation_id_sources() {
        let body = ApiResponse::json(202, json!({"id": "op-body", "status": "notSet"}));
        assert_eq!(operation_id(&body).as_deref(), Some("op-body"));

        let header = ApiResponse::new(202, "").with_header(
            "Location",
            "https://dev.azure.com/org/_apis/operations/op-loc?api-version=7.1",
        );
        assert_eq!(operation_id(&header).as_deref(), Some("op-loc"));

        assert_eq!(operation_id(&ApiResponse::new(202, "")), None);
    }
}
