//! Axum middleware applying a strategy's decision to HTTP traffic.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::SecondsFormat;
use tracing::{debug, error, field, instrument, warn, Span};

use super::extractor::KeyExtractor;
use crate::ratelimit::{self, Context, Outcome, Strategy};

/// Units consumed, or tokens left for the token bucket.
pub const TOTAL_REQUESTS_HEADER: HeaderName = HeaderName::from_static("rate-limiting-total-requests");
/// `Allow` or `Deny`.
pub const STATE_HEADER: HeaderName = HeaderName::from_static("rate-limiting-state");
/// RFC 3339 instant at which capacity returns.
pub const EXPIRES_AT_HEADER: HeaderName = HeaderName::from_static("rate-limiting-expires-at");

/// Middleware state: one strategy applied with one limit.
#[derive(Clone)]
pub struct AdmissionLayer {
    strategy: Arc<dyn Strategy>,
    extractor: Arc<dyn KeyExtractor>,
    limit: u64,
    window: Duration,
    check_timeout: Option<Duration>,
    key_prefix: Option<String>,
}

impl AdmissionLayer {
    /// Admit at most `limit` requests per `window` for each extracted key.
    pub fn new(
        strategy: Arc<dyn Strategy>,
        extractor: Arc<dyn KeyExtractor>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            strategy,
            extractor,
            limit,
            window,
            check_timeout: None,
            key_prefix: None,
        }
    }

    /// Fail a check that has not finished within `timeout`.
    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = Some(timeout);
        self
    }

    /// Namespace every extracted key as `<prefix>:<key>`.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    fn store_key(&self, key: String) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}:{}", prefix, key),
            None => key,
        }
    }

    fn context(&self) -> Context {
        match self.check_timeout {
            Some(timeout) => Context::background().with_timeout(timeout),
            None => Context::background(),
        }
    }
}

fn outcome_headers(outcome: &Outcome) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(3);
    headers.insert(TOTAL_REQUESTS_HEADER, HeaderValue::from(outcome.observed_count));
    headers.insert(STATE_HEADER, HeaderValue::from_static(outcome.decision.as_str()));
    let expires_at = outcome.reset_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Ok(value) = HeaderValue::from_str(&expires_at) {
        headers.insert(EXPIRES_AT_HEADER, value);
    }
    headers
}

/// Check the request against the configured strategy before forwarding it.
///
/// Install with `axum::middleware::from_fn_with_state`.
#[instrument(skip_all, fields(strategy = field::Empty, key = field::Empty))]
pub async fn admission_middleware(
    State(layer): State<AdmissionLayer>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let span = Span::current();
    span.record("strategy", layer.strategy.name());

    let key = match layer.extractor.extract(&request) {
        Ok(key) => key,
        Err(e) => {
            warn!(error = %e, "Request carries no rate limiting key");
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to extract rate limiting key from request: {}", e),
            )
                .into_response();
        }
    };
    let key = layer.store_key(key);
    span.record("key", key.as_str());

    let check = ratelimit::Request::new(key, layer.limit, layer.window);
    let outcome = match layer.strategy.execute(&layer.context(), &check).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(error = %e, "Rate limit check failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to run rate limiting for request: {}", e),
            )
                .into_response();
        }
    };

    let headers = outcome_headers(&outcome);

    if !outcome.is_allowed() {
        debug!(count = outcome.observed_count, limit = layer.limit, "Request throttled");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            "you have sent too many requests to this service, slow down please",
        )
            .into_response();
        response.headers_mut().extend(headers);
        return response;
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}
