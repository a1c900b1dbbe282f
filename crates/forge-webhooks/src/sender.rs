// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP transport for deliveries.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::retry::AttemptResult;

/// Event name header.
pub const EVENT_HEADER: &str = "X-Hub-Event";
/// Delivery correlation header.
pub const DELIVERY_HEADER: &str = "X-Hub-Delivery";

/// Response bodies are stored up to this many bytes.
pub const MAX_RESPONSE_BODY: usize = 4 * 1024;

/// What came back from one POST.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Classification for the retry policy.
    pub result: AttemptResult,
    /// Wall-clock duration of the request.
    pub duration: Duration,
    /// Response headers, when a response arrived.
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Truncated response body.
    pub response_body: Option<String>,
    /// Error text for failures.
    pub error: Option<String>,
}

impl SendOutcome {
    /// HTTP status, when a response arrived.
    pub fn status_code(&self) -> Option<u16> {
        match self.result {
            AttemptResult::Response(status) => Some(status),
            _ => None,
        }
    }
}

/// Posts delivery bodies with a per-request timeout.
#[derive(Clone)]
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    /// Build a sender.
    pub fn new(timeout: Duration, user_agent: &str) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// POST `body` to `url` with `headers`. Never fails; failures are
    /// described in the outcome.
    pub async fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: String,
    ) -> SendOutcome {
        let started = Instant::now();

        let mut request = self.client.post(url).body(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let result = if e.is_timeout() || e.is_connect() || e.is_request() {
                    AttemptResult::NetworkFailure
                } else {
                    AttemptResult::RequestError
                };
                debug!(url = %url, error = %e, "Delivery request failed");
                return SendOutcome {
                    result,
                    duration: started.elapsed(),
                    response_headers: None,
                    response_body: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let status = response.status();
        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                response_headers.insert(name.to_string(), v.to_string());
            }
        }

        let (body, read_error) = match response.bytes().await {
            Ok(bytes) => (Some(truncate_utf8(&bytes, MAX_RESPONSE_BODY)), None),
            Err(e) => (None, Some(format!("failed to read response body: {}", e))),
        };

        let error = if status.is_success() {
            None
        } else {
            Some(format!("endpoint responded with {}", status))
        };

        SendOutcome {
            result: AttemptResult::Response(status.as_u16()),
            duration: started.elapsed(),
            response_headers: Some(response_headers),
            response_body: body,
            error: error.or(read_error),
        }
    }
}

/// Lossy UTF-8 of at most `max` bytes of `bytes`, cut on a char boundary.
fn truncate_utf8(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        return text.into_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_utf8(b"hello", 10), "hello");
        assert_eq!(truncate_utf8(b"hello", 3), "hel");
        // "é" is two bytes; cutting in the middle backs off.
        assert_eq!(truncate_utf8("aé".as_bytes(), 2), "a");

        let long = vec![b'x'; MAX_RESPONSE_BODY * 2];
        assert_eq!(truncate_utf8(&long, MAX_RESPONSE_BODY).len(), MAX_RESPONSE_BODY);
    }
}
