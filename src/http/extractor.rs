//! Client identity extraction.

use axum::body::Body;
use axum::http::Request;

use crate::error::{Result, TurnstileError};

/// Derives the rate limiting key from an incoming request.
pub trait KeyExtractor: Send + Sync {
    /// Build the key, or fail if the request carries no usable identity.
    fn extract(&self, request: &Request<Body>) -> Result<String>;
}

/// Keys requests by the values of one or more headers, joined with `-`.
#[derive(Debug, Clone)]
pub struct HeaderKeyExtractor {
    headers: Vec<String>,
}

impl HeaderKeyExtractor {
    /// Create an extractor reading `headers` in order.
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyExtractor for HeaderKeyExtractor {
    fn extract(&self, request: &Request<Body>) -> Result<String> {
        let mut values = Vec::with_capacity(self.headers.len());

        for name in &self.headers {
            let value = request
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    TurnstileError::KeyExtraction(format!("header {} must have a value set", name))
                })?;
            values.push(value);
        }

        Ok(values.join("-"))
    }
}
