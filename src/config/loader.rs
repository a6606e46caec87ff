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

use super::types::*;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PipelineConfig> {
        let content = std::fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        Self::parse(&content)
    }

    /// Parse YAML content, substituting environment variables first
    pub fn parse(content: &str) -> Result<PipelineConfig> {
        let content = Self::substitute_env_vars(content)?;

        let config: PipelineConfig = serde_yaml::from_str(&content)
            .context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${APP_SECRET:-dev-secret} -> dev-secret (if APP_SECRET not set)
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}")
            .context("Invalid substitution pattern")?;

        Ok(re
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match std::env::var(var_name) {
                    Ok(value) => value,
                    Err(_) => match default_value {
                        Some(default) => default.to_string(),
                        // Keep original if no default and var not found
                        None => format!("${{{}}}", var_name),
                    },
                }
            })
            .to_string())
    }

    /// Validate configuration
    pub fn validate(config: &PipelineConfig) -> Result<()> {
        match config.store.backend.as_str() {
            "sqlite" => {
                if config.store.path.is_empty() {
                    bail!("store.path cannot be empty for the sqlite backend");
                }
            }
            "memory" => {}
            unknown => bail!("Unknown store backend: '{}'. Supported: sqlite, memory", unknown),
        }

        if config.store.max_records == 0 {
            bail!("store.max_records must be > 0");
        }

        if config.http.timeout_seconds == 0 {
            bail!("http.timeout_seconds must be > 0");
        }

        if config.channels.is_empty() {
            bail!("at least one channel must be configured");
        }

        let mut seen = HashSet::new();
        for channel in &config.channels {
            if channel.destination.is_empty() {
                bail!("channels[].destination cannot be empty");
            }
            if !seen.insert(channel.destination.as_str()) {
                bail!("duplicate channel destination '{}'", channel.destination);
            }
            if !is_http_url(&channel.base_url) {
                bail!(
                    "channel '{}': base_url must start with http:// or https://",
                    channel.destination
                );
            }
            if channel.batch.max_count == 0 {
                bail!("channel '{}': batch.max_count must be > 0", channel.destination);
            }
            if channel.batch.max_bytes == 0 {
                bail!("channel '{}': batch.max_bytes must be > 0", channel.destination);
            }
            if channel.batch.flush_interval_ms == 0 {
                bail!("channel '{}': batch.flush_interval_ms must be > 0", channel.destination);
            }
            if channel.retry.base_delay_ms == 0 {
                bail!("channel '{}': retry.base_delay_ms must be > 0", channel.destination);
            }
            if channel.retry.max_delay_ms < channel.retry.base_delay_ms {
                bail!(
                    "channel '{}': retry.max_delay_ms must be >= retry.base_delay_ms",
                    channel.destination
                );
            }
        }

        if let Some(one_collector) = &config.one_collector {
            if !is_http_url(&one_collector.base_url) {
                bail!("one_collector.base_url must start with http:// or https://");
            }
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
