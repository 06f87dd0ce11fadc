//! Strategy-chain error classification and a bounded ring buffer of
//! recent [`UploadError`]s for diagnosis.
//!
//! Classification strategies are tried in descending priority; the
//! first one whose `can_handle` matches owns the error, the same way
//! `ApiError::from_response` maps a response code to a specific
//! variant before falling back to the generic case.

use crate::error::{ErrorKind, TransportError, UploadError};
use crate::network::NetworkQuality;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Filter predicate for [`ErrorCenter::query_errors`]; every field left
/// `None` is unconstrained.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorQuery {
    pub kind: Option<ErrorKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub recoverable: Option<bool>,
}

/// Diagnostic context attached to a raw failure at classification time.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub network_quality: Option<NetworkQuality>,
    pub chunk_index: Option<usize>,
    pub retry_count: u32,
}

/// A single classification rule. Strategies never throw; an
/// unmatched raw error simply falls through to the next one.
pub trait ClassifyStrategy: Send + Sync {
    fn priority(&self) -> i32;
    fn can_handle(&self, raw: &TransportError) -> bool;
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError;
}

struct TimeoutStrategy;
impl ClassifyStrategy for TimeoutStrategy {
    fn priority(&self) -> i32 {
        100
    }
    fn can_handle(&self, raw: &TransportError) -> bool {
        matches!(raw, TransportError::Timeout(_))
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Timeout, raw, ctx)
    }
}

struct AbortStrategy;
impl ClassifyStrategy for AbortStrategy {
    fn priority(&self) -> i32 {
        95
    }
    fn can_handle(&self, raw: &TransportError) -> bool {
        matches!(raw, TransportError::Aborted)
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Abort, raw, ctx)
    }
}

struct ServerStatusStrategy;
impl ClassifyStrategy for ServerStatusStrategy {
    fn priority(&self) -> i32 {
        90
    }
    fn can_handle(&self, raw: &TransportError) -> bool {
        matches!(raw, TransportError::Status { status, .. } if (500..600).contains(status) || *status == 429)
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Server, raw, ctx)
    }
}

struct ValidationStatusStrategy;
impl ClassifyStrategy for ValidationStatusStrategy {
    fn priority(&self) -> i32 {
        85
    }
    fn can_handle(&self, raw: &TransportError) -> bool {
        matches!(raw, TransportError::Status { status, .. } if (400..500).contains(status) && *status != 429 && *status != 408 && *status != 409)
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Validation, raw, ctx)
    }
}

struct NetworkStrategy;
impl ClassifyStrategy for NetworkStrategy {
    fn priority(&self) -> i32 {
        80
    }
    fn can_handle(&self, raw: &TransportError) -> bool {
        match raw {
            TransportError::Request(e) => e.is_connect() || e.is_request(),
            TransportError::Status { status, .. } if *status == 408 || *status == 409 => true,
            _ => false,
        }
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Network, raw, ctx)
    }
}

fn build(kind: ErrorKind, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
    let mut err = UploadError::new(kind, raw.to_string());
    err.retry_count = ctx.retry_count;
    if let Some(index) = ctx.chunk_index {
        err = err.with_chunk(index, ctx.retry_count);
    }
    err
}

/// Catch-all, always matches, lowest priority.
struct FallbackStrategy;
impl ClassifyStrategy for FallbackStrategy {
    fn priority(&self) -> i32 {
        i32::MIN
    }
    fn can_handle(&self, _raw: &TransportError) -> bool {
        true
    }
    fn handle(&self, raw: &TransportError, ctx: &ErrorContext) -> UploadError {
        build(ErrorKind::Unknown, raw, ctx)
    }
}

/// Signature of a recovery policy: may sleep/poll, returns whether the
/// caller should retry. It never re-executes the failed work itself.
pub type RecoveryFn = Box<dyn Fn(&UploadError) -> bool + Send + Sync>;

/// Classifies raw transport failures, stores a bounded history, and
/// holds the per-kind recovery policy table.
pub struct ErrorCenter {
    strategies: Vec<Box<dyn ClassifyStrategy>>,
    recent: Mutex<VecDeque<UploadError>>,
    capacity: usize,
}

impl Default for ErrorCenter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl ErrorCenter {
    pub fn new(capacity: usize) -> Self {
        let mut strategies: Vec<Box<dyn ClassifyStrategy>> = vec![
            Box::new(TimeoutStrategy),
            Box::new(AbortStrategy),
            Box::new(ServerStatusStrategy),
            Box::new(ValidationStatusStrategy),
            Box::new(NetworkStrategy),
            Box::new(FallbackStrategy),
        ];
        strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        Self {
            strategies,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Register an additional strategy ahead of the built-ins if its
    /// priority is higher than theirs.
    pub fn register_custom_handler(&mut self, strategy: Box<dyn ClassifyStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    pub fn handle_error(&self, raw: TransportError, ctx: ErrorContext) -> UploadError {
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.can_handle(&raw))
            .expect("fallback strategy always matches");
        let err = strategy.handle(&raw, &ctx);
        debug!(target: "error_center", kind = %err.kind, error_id = %err.error_id, "classified error");
        self.record(err.clone());
        err
    }

    fn record(&self, err: UploadError) {
        let mut recent = self.recent.lock().expect("error_center lock poisoned");
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(err);
    }

    /// Filters the recent-error ring buffer by type, a `[since, until)`
    /// time range, and/or recovery status. Any filter left `None` is not
    /// applied.
    pub fn query_errors(&self, query: ErrorQuery) -> Vec<UploadError> {
        let recent = self.recent.lock().expect("error_center lock poisoned");
        recent
            .iter()
            .filter(|e| query.kind.map(|k| k == e.kind).unwrap_or(true))
            .filter(|e| query.since.map(|since| e.created_at >= since).unwrap_or(true))
            .filter(|e| query.until.map(|until| e.created_at < until).unwrap_or(true))
            .filter(|e| query.recoverable.map(|r| r == e.is_recoverable).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Run the recovery disposition for an error's kind. Sleeps for
    /// backoff-style strategies; never re-executes the failed work.
    pub async fn attempt_recovery(&self, err: &mut UploadError) -> bool {
        if !err.is_recoverable {
            warn!(target: "error_center", kind = %err.kind, "error kind is terminal, no recovery attempted");
            err.record_attempt("terminal", false);
            return false;
        }
        let should_retry = match err.kind {
            ErrorKind::Network => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                true
            }
            ErrorKind::Timeout | ErrorKind::ConnectionReset | ErrorKind::Server => true,
            ErrorKind::Dns => err.retry_count < 2,
            ErrorKind::Memory => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                true
            }
            ErrorKind::Worker => err.retry_count < 1,
            ErrorKind::Unknown => err.retry_count < 1,
            _ => false,
        };
        err.record_attempt(format!("{:?}", err.kind), should_retry);
        should_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> TransportError {
        TransportError::Status {
            status,
            body: "{}".to_string(),
        }
    }

    #[test]
    fn classifies_server_and_client_status_codes() {
        let center = ErrorCenter::default();
        let server = center.handle_error(status_error(503), ErrorContext::default());
        assert_eq!(server.kind, ErrorKind::Server);
        let client = center.handle_error(status_error(404), ErrorContext::default());
        assert_eq!(client.kind, ErrorKind::Validation);
        let rate_limited = center.handle_error(status_error(429), ErrorContext::default());
        assert_eq!(rate_limited.kind, ErrorKind::Server);
    }

    #[test]
    fn timeout_takes_priority_over_fallback() {
        let center = ErrorCenter::default();
        let err = center.handle_error(TransportError::Timeout(Duration::from_secs(5)), ErrorContext::default());
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn quota_exceeded_is_never_retried() {
        let mut err = UploadError::new(ErrorKind::QuotaExceeded, "quota exceeded");
        assert!(err.is_recoverable);
        let center = ErrorCenter::default();
        let should_retry = center.attempt_recovery(&mut err).await;
        assert!(!should_retry);
    }

    #[tokio::test]
    async fn network_errors_retry_after_a_short_wait() {
        let mut err = UploadError::new(ErrorKind::Network, "connection reset");
        let center = ErrorCenter::default();
        let should_retry = center.attempt_recovery(&mut err).await;
        assert!(should_retry);
    }

    #[test]
    fn query_filters_by_kind_and_recoverability() {
        let center = ErrorCenter::default();
        center.handle_error(status_error(503), ErrorContext::default());
        center.handle_error(status_error(404), ErrorContext::default());

        let server_only = center.query_errors(ErrorQuery {
            kind: Some(ErrorKind::Server),
            ..Default::default()
        });
        assert_eq!(server_only.len(), 1);
        assert_eq!(server_only[0].kind, ErrorKind::Server);

        let recoverable = center.query_errors(ErrorQuery {
            recoverable: Some(true),
            ..Default::default()
        });
        assert!(recoverable.iter().all(|e| e.is_recoverable));
    }

    #[test]
    fn query_filters_by_time_range() {
        let center = ErrorCenter::default();
        center.handle_error(status_error(503), ErrorContext::default());
        let future_only = center.query_errors(ErrorQuery {
            since: Some(Utc::now() + chrono::Duration::seconds(60)),
            ..Default::default()
        });
        assert!(future_only.is_empty());
    }
}
