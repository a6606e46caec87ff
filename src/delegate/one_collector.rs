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

// Redirect selected categories to the alternate collector

use serde_json::json;
use std::collections::HashSet;
use std::sync::RwLock;
use tracing::{debug, info};

use super::{ChannelDelegate, Decision};
use crate::ingestion::Endpoint;
use crate::model::{Record, RecordId};

pub const ONE_COLLECTOR_ENDPOINT: &str = "one-collector";
const SCHEMA_VERSION: &str = "3.0";

/// Stamps matching records with the install id and a Common Schema envelope,
/// then redirects them to the alternate collector.
///
/// The install id is fixed for the delegate's lifetime. The log URL may be
/// changed at any time; each decision captures the URL current at that moment.
pub struct OneCollectorDelegate {
    categories: HashSet<String>,
    install_id: String,
    log_url: RwLock<String>,
}

impl OneCollectorDelegate {
    pub fn new<I, S>(categories: I, install_id: impl Into<String>, log_url: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            install_id: install_id.into(),
            log_url: RwLock::new(log_url.into()),
        }
    }

    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    pub fn log_url(&self) -> String {
        self.log_url
            .read()
            .map(|url| url.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Affects records decided after this call only
    pub fn set_log_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!("Alternate collector URL set to {}", url);
        match self.log_url.write() {
            Ok(mut current) => *current = url,
            Err(poisoned) => *poisoned.into_inner() = url,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.categories.contains(&record.category)
    }

    /// `seq` is the store id, so a retried record carries the same value
    fn envelope(&self, id: RecordId, record: &Record) -> serde_json::Value {
        let mut envelope = json!({
            "ver": SCHEMA_VERSION,
            "name": record.category,
            "time": record.created_at.to_rfc3339(),
            "ext": {
                "sdk": {
                    "installId": self.install_id,
                    "libVer": format!("rust-{}", env!("CARGO_PKG_VERSION")),
                    "seq": id.0,
                }
            },
            "data": record.payload,
        });
        if let Some(key) = &record.target_key {
            envelope["iKey"] = json!(format!("o:{}", tenant_of(key)));
        }
        envelope
    }
}

/// Tenant part of a target key (`<tenant>-<rest>`)
fn tenant_of(key: &str) -> &str {
    key.split_once('-').map(|(tenant, _)| tenant).unwrap_or(key)
}

impl ChannelDelegate for OneCollectorDelegate {
    fn name(&self) -> &str {
        "one-collector"
    }

    fn decide(&self, id: RecordId, record: &Record, _default: &Endpoint) -> Decision {
        if !self.matches(record) {
            return Decision::PassThrough;
        }

        let mut redirected = record.clone();
        redirected.payload = self.envelope(id, record);
        redirected
            .metadata
            .insert("installId".to_string(), self.install_id.clone());

        let endpoint = Endpoint::one_collector(ONE_COLLECTOR_ENDPOINT, self.log_url());
        debug!(
            "Redirecting {} record {} to {}",
            record.category, record.id, endpoint.base_url
        );
        Decision::Redirect {
            endpoint,
            record: redirected,
        }
    }
}
