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

// Record store factory

use super::backend::LogStore;
use super::sqlite::SqliteLogStore;
use crate::config::StoreConfig;
use crate::observer::PipelineObserver;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;

pub struct StoreFactory;

impl StoreFactory {
    /// Create the record store from configuration
    pub fn create(
        config: &StoreConfig,
        observer: Arc<dyn PipelineObserver>,
    ) -> Result<Arc<dyn LogStore>> {
        match config.backend.as_str() {
            "sqlite" => {
                let path = Path::new(&config.path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create store directory {}", parent.display())
                    })?;
                }
                let store = SqliteLogStore::open(path, config.max_records, observer)
                    .context("Failed to open SQLite record store")?;
                Ok(Arc::new(store))
            }

            "memory" => {
                let store = SqliteLogStore::open_in_memory(config.max_records, observer)
                    .context("Failed to open in-memory record store")?;
                Ok(Arc::new(store))
            }

            unknown => bail!(
                "Unknown store backend: '{}'. Supported: sqlite, memory",
                unknown
            ),
        }
    }
}
