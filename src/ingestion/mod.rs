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

// Wire formats of the ingestion endpoints

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::DeliveryError;
use crate::http::types::{HttpRequest, API_KEY_HEADER, APP_SECRET_HEADER, AUTHORIZATION_HEADER};
use crate::model::Record;

pub const INSTALL_ID_HEADER: &str = "Install-ID";
pub const CLIENT_VERSION_HEADER: &str = "Client-Version";
pub const UPLOAD_TIME_HEADER: &str = "Upload-Time";

const APP_CENTER_PATH: &str = "/logs?api-version=1.0.0";
const ONE_COLLECTOR_PATH: &str = "/OneCollector/1.0/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// JSON document `{"logs":[...]}`
    AppCenter,
    /// Newline-delimited JSON, one envelope per line
    OneCollector,
}

/// Where a batch goes and how it is encoded
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub name: String,
    pub base_url: String,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn app_center(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            protocol: Protocol::AppCenter,
        }
    }

    pub fn one_collector(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            protocol: Protocol::OneCollector,
        }
    }

    pub fn url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.protocol {
            Protocol::AppCenter => format!("{}{}", base, APP_CENTER_PATH),
            Protocol::OneCollector => format!("{}{}", base, ONE_COLLECTOR_PATH),
        }
    }
}

#[derive(Serialize)]
struct LogContainer<'a> {
    logs: Vec<WireLog<'a>>,
}

#[derive(Serialize)]
struct WireLog<'a> {
    #[serde(rename = "type")]
    category: &'a str,
    id: String,
    timestamp: String,
    #[serde(skip_serializing_if = "no_properties")]
    properties: &'a BTreeMap<String, String>,
    payload: &'a serde_json::Value,
}

fn no_properties(properties: &&BTreeMap<String, String>) -> bool {
    properties.is_empty()
}

/// Application credentials attached to every request
#[derive(Debug, Clone)]
pub struct IngestionContext {
    pub app_secret: Option<String>,
    pub install_id: String,
}

impl IngestionContext {
    pub fn new(app_secret: Option<String>, install_id: impl Into<String>) -> Self {
        Self {
            app_secret,
            install_id: install_id.into(),
        }
    }

    /// Encode `records` for `endpoint`. All records must share one auth token.
    pub fn build_request(
        &self,
        endpoint: &Endpoint,
        records: &[Record],
    ) -> Result<HttpRequest, DeliveryError> {
        if records.is_empty() {
            return Err(DeliveryError::InvalidRequest("empty batch".to_string()));
        }

        let request = match endpoint.protocol {
            Protocol::AppCenter => self.app_center_request(endpoint, records)?,
            Protocol::OneCollector => one_collector_request(endpoint, records)?,
        };

        Ok(match records[0].auth_token.as_deref() {
            Some(token) => request.header(AUTHORIZATION_HEADER, format!("Bearer {}", token)),
            None => request,
        })
    }

    fn app_center_request(
        &self,
        endpoint: &Endpoint,
        records: &[Record],
    ) -> Result<HttpRequest, DeliveryError> {
        let container = LogContainer {
            logs: records
                .iter()
                .map(|r| WireLog {
                    category: &r.category,
                    id: r.id.to_string(),
                    timestamp: r.created_at.to_rfc3339(),
                    properties: &r.metadata,
                    payload: &r.payload,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&container).map_err(invalid)?;

        let mut request = HttpRequest::post(endpoint.url())
            .header("Content-Type", "application/json")
            .header(INSTALL_ID_HEADER, self.install_id.as_str())
            .body(body);
        if let Some(secret) = &self.app_secret {
            request = request.header(APP_SECRET_HEADER, secret.as_str());
        }
        Ok(request)
    }
}

fn one_collector_request(endpoint: &Endpoint, records: &[Record]) -> Result<HttpRequest, DeliveryError> {
    let mut body = Vec::new();
    for record in records {
        serde_json::to_writer(&mut body, &record.payload).map_err(invalid)?;
        body.push(b'\n');
    }

    let keys: BTreeSet<&str> = records.iter().filter_map(|r| r.target_key.as_deref()).collect();

    let mut request = HttpRequest::post(endpoint.url())
        .header("Content-Type", "application/x-json-stream; charset=utf-8")
        .header(
            CLIENT_VERSION_HEADER,
            format!("ACS-Rust-{}", env!("CARGO_PKG_VERSION")),
        )
        .header(UPLOAD_TIME_HEADER, Utc::now().timestamp_millis().to_string())
        .body(body);
    if !keys.is_empty() {
        request = request.header(API_KEY_HEADER, keys.into_iter().collect::<Vec<_>>().join(","));
    }
    Ok(request)
}

fn invalid(e: serde_json::Error) -> DeliveryError {
    DeliveryError::InvalidRequest(format!("failed to encode batch: {}", e))
}
