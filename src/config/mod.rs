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

pub mod types;
mod loader;

pub use types::*;
pub use loader::ConfigLoader;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a YAML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    ConfigLoader::load(path).context("Failed to load configuration")
}

/// Load configuration with environment variable overrides
pub fn load_config_with_env<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
    let mut config = load_config(path)?;

    // Allow environment variables to override config values
    if let Ok(app_secret) = std::env::var("TELEMETRY_APP_SECRET") {
        config.ingestion.app_secret = Some(app_secret);
    }

    if let Ok(url) = std::env::var("TELEMETRY_ONE_COLLECTOR_URL") {
        if let Some(one_collector) = config.one_collector.as_mut() {
            one_collector.base_url = url;
        }
    }

    ConfigLoader::validate(&config)?;
    Ok(config)
}
