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

// Per-destination enabled/paused flags and base URL

use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DestinationState {
    enabled: bool,
    paused: bool,
    base_url: String,
}

/// Shared by the channels and the connectivity/lifecycle hooks.
///
/// Readers must expect any flag to change between a check and the action
/// taken on it. Destinations that were never configured are disabled.
#[derive(Debug, Default)]
pub struct Enablement {
    destinations: DashMap<String, DestinationState>,
}

impl Enablement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a destination; it starts not paused
    pub fn configure(&self, destination: &str, base_url: impl Into<String>, enabled: bool) {
        self.destinations.insert(
            destination.to_string(),
            DestinationState {
                enabled,
                paused: false,
                base_url: base_url.into(),
            },
        );
    }

    pub fn is_enabled(&self, destination: &str) -> bool {
        self.destinations
            .get(destination)
            .map(|s| s.enabled)
            .unwrap_or(false)
    }

    pub fn is_paused(&self, destination: &str) -> bool {
        self.destinations
            .get(destination)
            .map(|s| s.paused)
            .unwrap_or(false)
    }

    /// Enabled and not paused
    pub fn can_send(&self, destination: &str) -> bool {
        self.destinations
            .get(destination)
            .map(|s| s.enabled && !s.paused)
            .unwrap_or(false)
    }

    /// Returns false for an unknown destination
    pub fn set_enabled(&self, destination: &str, enabled: bool) -> bool {
        self.update(destination, |s| s.enabled = enabled)
    }

    pub fn pause(&self, destination: &str) -> bool {
        self.update(destination, |s| s.paused = true)
    }

    pub fn resume(&self, destination: &str) -> bool {
        self.update(destination, |s| s.paused = false)
    }

    pub fn set_base_url(&self, destination: &str, base_url: impl Into<String>) -> bool {
        let base_url = base_url.into();
        self.update(destination, move |s| s.base_url = base_url)
    }

    pub fn base_url(&self, destination: &str) -> Option<String> {
        self.destinations.get(destination).map(|s| s.base_url.clone())
    }

    fn update(&self, destination: &str, f: impl FnOnce(&mut DestinationState)) -> bool {
        match self.destinations.get_mut(destination) {
            Some(mut state) => {
                f(&mut state);
                true
            }
            None => false,
        }
    }
}
