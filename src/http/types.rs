// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use bytes::Bytes;
use reqwest::Method;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::DeliveryError;

pub const APP_SECRET_HEADER: &str = "App-Secret";
pub const API_KEY_HEADER: &str = "apikey";
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Everything the client needs to make one call
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Headers safe to write to logs
    pub fn obfuscated_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), obfuscate_header_value(k, v)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub type CallResult = Result<HttpResponse, DeliveryError>;

/// Completion callback for `HttpClient::send_with_completion`
pub type Completion = Box<dyn FnOnce(CallResult) + Send + 'static>;

/// How the channel should react to a call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Delivered,
    Retryable,
    NonRetryable,
    /// Client was disabled; records go back to storage untouched
    Withheld,
}

/// 5xx, request timeout and throttling are worth another attempt
pub fn is_recoverable_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

pub fn classify(result: &CallResult) -> CallOutcome {
    match result {
        Ok(response) if response.is_success() => CallOutcome::Delivered,
        Ok(response) if is_recoverable_status(response.status) => CallOutcome::Retryable,
        Ok(_) => CallOutcome::NonRetryable,
        Err(e) if e.is_client_state() => CallOutcome::Withheld,
        Err(e) if e.is_retryable() => CallOutcome::Retryable,
        Err(_) => CallOutcome::NonRetryable,
    }
}

/// Keep secrets out of logs: only the last few characters survive
pub fn obfuscate_header_value(key: &str, value: &str) -> String {
    if key.eq_ignore_ascii_case(APP_SECRET_HEADER) {
        obfuscate_tail(value, 8)
    } else if key.eq_ignore_ascii_case(API_KEY_HEADER) {
        value
            .split(',')
            .map(|k| obfuscate_tail(k, 8))
            .collect::<Vec<_>>()
            .join(",")
    } else if key.eq_ignore_ascii_case(AUTHORIZATION_HEADER) {
        match value.split_once(' ') {
            Some((scheme, _)) => format!("{} ***", scheme),
            None => "***".to_string(),
        }
    } else {
        value.to_string()
    }
}

fn obfuscate_tail(value: &str, visible: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible {
        return "*".repeat(chars.len());
    }
    let hidden = chars.len() - visible;
    let tail: String = chars[hidden..].iter().collect();
    format!("{}{}", "*".repeat(hidden), tail)
}

/// Handle on one outstanding call.
///
/// Resolves exactly once. The result only becomes observable by awaiting,
/// so it can never arrive before `send_async` has returned.
pub struct PendingCall {
    rx: oneshot::Receiver<CallResult>,
    cancel: CancellationToken,
}

impl PendingCall {
    pub fn new(rx: oneshot::Receiver<CallResult>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Abort this call; it completes with `Disabled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Future for PendingCall {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            // Sender gone without a result: the client was torn down
            .map(|result| result.unwrap_or(Err(DeliveryError::Disabled)))
    }
}
