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

use dashmap::DashSet;
use tracing::{debug, info};

use super::{ChannelDelegate, Decision};
use crate::ingestion::Endpoint;
use crate::model::{Record, RecordId};

/// Drops records of blocked categories; togglable at runtime
#[derive(Default)]
pub struct EventFilterDelegate {
    blocked: DashSet<String>,
}

impl EventFilterDelegate {
    pub fn new<I, S>(blocked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = Self::default();
        for category in blocked {
            filter.blocked.insert(category.into());
        }
        filter
    }

    pub fn block(&self, category: impl Into<String>) {
        let category = category.into();
        info!("Event filter: blocking category '{}'", category);
        self.blocked.insert(category);
    }

    pub fn unblock(&self, category: &str) {
        info!("Event filter: unblocking category '{}'", category);
        self.blocked.remove(category);
    }

    pub fn is_blocked(&self, category: &str) -> bool {
        self.blocked.contains(category)
    }
}

impl ChannelDelegate for EventFilterDelegate {
    fn name(&self) -> &str {
        "event-filter"
    }

    fn decide(&self, _id: RecordId, record: &Record, _default: &Endpoint) -> Decision {
        if self.is_blocked(&record.category) {
            debug!("Event filter dropped {} record {}", record.category, record.id);
            Decision::Drop
        } else {
            Decision::PassThrough
        }
    }
}
