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

// Stable per-install identifier

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const INSTALL_ID_FILE: &str = "install_id";

pub trait InstallIdProvider: Send + Sync {
    fn install_id(&self) -> String;
}

/// Identifier supplied by the host (configuration or tests)
#[derive(Debug, Clone)]
pub struct StaticInstallId(String);

impl StaticInstallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl InstallIdProvider for StaticInstallId {
    fn install_id(&self) -> String {
        self.0.clone()
    }
}

/// Identifier generated on first use and kept in a file
#[derive(Debug, Clone)]
pub struct FileInstallId {
    id: Uuid,
    path: PathBuf,
}

impl FileInstallId {
    /// Read the id stored at `path`, or create one. An unreadable file is
    /// replaced with a fresh id.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Ok(content) = std::fs::read_to_string(&path) {
            match Uuid::parse_str(content.trim()) {
                Ok(id) => return Ok(Self { id, path }),
                Err(e) => warn!("Replacing invalid install id in {}: {}", path.display(), e),
            }
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let id = Uuid::new_v4();
        std::fs::write(&path, id.to_string())
            .with_context(|| format!("Failed to write install id to {}", path.display()))?;
        info!("Generated install id {} ({})", id, path.display());

        Ok(Self { id, path })
    }

    /// File next to the record store
    pub fn beside_store<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let dir = store_path
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::load_or_create(dir.join(INSTALL_ID_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InstallIdProvider for FileInstallId {
    fn install_id(&self) -> String {
        self.id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_install_id_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(INSTALL_ID_FILE);

        let first = FileInstallId::load_or_create(&path).unwrap();
        let second = FileInstallId::load_or_create(&path).unwrap();
        assert_eq!(first.install_id(), second.install_id());
    }

    #[test]
    fn test_invalid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(INSTALL_ID_FILE);
        std::fs::write(&path, "not-a-uuid").unwrap();

        let provider = FileInstallId::load_or_create(&path).unwrap();
        assert!(Uuid::parse_str(&provider.install_id()).is_ok());
    }

    #[test]
    fn test_beside_store() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FileInstallId::beside_store(temp_dir.path().join("telemetry.db")).unwrap();
        assert_eq!(provider.path(), temp_dir.path().join(INSTALL_ID_FILE));
    }
}
