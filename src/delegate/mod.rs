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

// Per-record routing decisions applied before a batch leaves the channel

pub mod filter;
pub mod one_collector;

pub use filter::EventFilterDelegate;
pub use one_collector::OneCollectorDelegate;

use std::sync::Arc;

use crate::ingestion::Endpoint;
use crate::model::{Record, RecordId};

/// What happens to one record on its way out
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Send to the channel's default endpoint unchanged
    PassThrough,
    /// Send `record` (a transformed copy) to `endpoint` instead
    Redirect { endpoint: Endpoint, record: Record },
    /// Do not send; the record is removed from the store
    Drop,
}

/// Interceptor consulted for every record in a candidate batch
pub trait ChannelDelegate: Send + Sync {
    fn name(&self) -> &str;

    /// # Arguments
    /// * `id` - Store id of the record; stable across retries
    /// * `record` - Record as persisted
    /// * `default` - Endpoint the channel would use without this delegate
    fn decide(&self, id: RecordId, record: &Record, default: &Endpoint) -> Decision;
}

/// Delegates in registration order; the first non-pass-through decision wins
#[derive(Clone, Default)]
pub struct DelegateChain {
    delegates: Vec<Arc<dyn ChannelDelegate>>,
}

impl DelegateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, delegate: Arc<dyn ChannelDelegate>) {
        self.delegates.push(delegate);
    }

    pub fn with(mut self, delegate: Arc<dyn ChannelDelegate>) -> Self {
        self.register(delegate);
        self
    }

    pub fn len(&self) -> usize {
        self.delegates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delegates.is_empty()
    }

    pub fn decide(&self, id: RecordId, record: &Record, default: &Endpoint) -> Decision {
        self.delegates
            .iter()
            .map(|delegate| delegate.decide(id, record, default))
            .find(|decision| *decision != Decision::PassThrough)
            .unwrap_or(Decision::PassThrough)
    }
}
