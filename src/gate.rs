//! Readiness gate
//!
//! Sends one readiness check to the control service and turns its reply into
//! what the proxy does with the inbound request: forward it internally, or
//! answer with the control service's reply.

use crate::error::GateError;
use crate::extractor::GateConfig;
use crate::pool::ConnectionPool;
use crate::strategy::build_check_request;
use http_body_util::{BodyExt, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Reply header carrying the session status
pub const SESSION_STATUS_HEADER: &str = "x-sablier-session-status";
/// Session status value that opens the gate
pub const STATUS_READY: &str = "ready";
/// Largest control service reply the gate will buffer
pub const DEFAULT_MAX_REPLY_BYTES: usize = 4 * 1024 * 1024;

/// What the control service said about the backends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready,
    /// Anything other than an explicit `ready`, including a missing status header
    NotReady {
        payload: Bytes,
        content_type: Option<HeaderValue>,
    },
}

impl ReadinessOutcome {
    pub fn from_reply(headers: &HeaderMap, body: Bytes) -> Self {
        let ready = headers
            .get(SESSION_STATUS_HEADER)
            .is_some_and(|v| v.as_bytes() == STATUS_READY.as_bytes());

        if ready {
            ReadinessOutcome::Ready
        } else {
            ReadinessOutcome::NotReady {
                payload: body,
                content_type: headers.get(CONTENT_TYPE).cloned(),
            }
        }
    }
}

/// What the proxy must do with the inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Serve the original request from `target`
    ForwardInternally { target: String },
    /// Return the control service's reply to the client
    RespondWith {
        status: StatusCode,
        body: Bytes,
        content_type: Option<HeaderValue>,
        content_length: u64,
    },
}

impl Action {
    pub fn from_outcome(outcome: ReadinessOutcome, internal_redirect_target: &str) -> Self {
        match outcome {
            ReadinessOutcome::Ready => Action::ForwardInternally {
                target: internal_redirect_target.to_string(),
            },
            ReadinessOutcome::NotReady {
                payload,
                content_type,
            } => Action::RespondWith {
                status: StatusCode::OK,
                content_length: payload.len() as u64,
                body: payload,
                content_type,
            },
        }
    }
}

/// Issues readiness checks through the shared connection pool
#[derive(Clone)]
pub struct ReadinessGate {
    pool: Arc<ConnectionPool>,
    /// Transport-level bound on a check; `None` leaves waiting to the control service
    timeout: Option<Duration>,
    max_reply_bytes: usize,
}

impl ReadinessGate {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            timeout: None,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_reply_bytes(mut self, max_reply_bytes: usize) -> Self {
        self.max_reply_bytes = max_reply_bytes;
        self
    }

    /// Run the check for one inbound request and decide its fate.
    ///
    /// Exactly one sub-request is sent. Dropping the returned future cancels it.
    pub async fn handle(&self, config: &GateConfig) -> Result<Action, GateError> {
        let check = build_check_request(config)?;
        let uri = check.uri()?;

        debug!(
            strategy = check.strategy.name(),
            url = %check.url,
            query = %check.query,
            "Sending readiness check"
        );

        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.check(uri))
                .await
                .map_err(|_| GateError::Timeout(timeout))??,
            None => self.check(uri).await?,
        };

        let action = Action::from_outcome(outcome, &config.internal_redirect_target);
        match &action {
            Action::ForwardInternally { target } => {
                debug!(strategy = check.strategy.name(), target = %target, "Backends ready");
            }
            Action::RespondWith { content_length, .. } => {
                info!(
                    strategy = check.strategy.name(),
                    target = ?check.target,
                    content_length,
                    "Backends not ready, returning control service reply"
                );
            }
        }

        Ok(action)
    }

    async fn check(&self, uri: hyper::Uri) -> Result<ReadinessOutcome, GateError> {
        let response = self.pool.check(uri).await?;
        let (parts, body) = response.into_parts();

        debug!(
            status = %parts.status,
            session_status = ?parts.headers.get(SESSION_STATUS_HEADER),
            "Readiness check replied"
        );

        let body = Limited::new(body, self.max_reply_bytes)
            .collect()
            .await
            .map_err(GateError::UpstreamBody)?
            .to_bytes();

        Ok(ReadinessOutcome::from_reply(&parts.headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn test_ready_ignores_body() {
        let outcome = ReadinessOutcome::from_reply(
            &headers(&[("x-sablier-session-status", "ready")]),
            Bytes::from_static(b"<html>waiting</html>"),
        );
        assert_eq!(outcome, ReadinessOutcome::Ready);

        let action = Action::from_outcome(outcome, "@app");
        assert_eq!(
            action,
            Action::ForwardInternally {
                target: "@app".to_string()
            }
        );
    }

    #[test]
    fn test_starting_passes_reply_through() {
        let outcome = ReadinessOutcome::from_reply(
            &headers(&[
                ("x-sablier-session-status", "starting"),
                ("content-type", "text/html; charset=utf-8"),
            ]),
            Bytes::from_static(b"<html>starting</html>"),
        );

        let action = Action::from_outcome(outcome, "@app");
        assert_eq!(
            action,
            Action::RespondWith {
                status: StatusCode::OK,
                body: Bytes::from_static(b"<html>starting</html>"),
                content_type: Some(HeaderValue::from_static("text/html; charset=utf-8")),
                content_length: 21,
            }
        );
    }

    #[test]
    fn test_missing_status_is_not_ready() {
        let outcome = ReadinessOutcome::from_reply(&HeaderMap::new(), Bytes::from_static(b"oops"));
        assert_eq!(
            outcome,
            ReadinessOutcome::NotReady {
                payload: Bytes::from_static(b"oops"),
                content_type: None,
            }
        );
    }

    #[test]
    fn test_status_match_is_exact() {
        for value in ["Ready", "ready ", "not-ready", ""] {
            let mut map = HeaderMap::new();
            map.insert(SESSION_STATUS_HEADER, HeaderValue::from_str(value).unwrap());
            assert!(
                matches!(
                    ReadinessOutcome::from_reply(&map, Bytes::new()),
                    ReadinessOutcome::NotReady { .. }
                ),
                "{value:?} must not open the gate"
            );
        }
    }
}
