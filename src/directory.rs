//! App Directory — application metadata lookup and caching.
//!
//! The directory is a secondary source: platforms report candidates,
//! the directory fills in names and type tags they left out. A failing
//! directory only reduces metadata, never fails a resolution.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};

use crate::model::Application;
use crate::platform::{AppDefinition, DeclaredIntent, LaunchCommand};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid directory file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("directory lookup failed: {0}")]
    Lookup(String),
}

#[async_trait]
pub trait AppDirectory: Send + Sync {
    /// Find an application by directory id or name.
    async fn lookup(&self, name_or_id: &str) -> Result<Option<Application>, DirectoryError>;
}

/// One application in a directory file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    /// Owning platform. Entries without one are served by the broker itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchCommand>,
    #[serde(default)]
    pub intents: Vec<DeclaredIntent>,
}

impl DirectoryEntry {
    fn application(&self, platform: &str) -> Application {
        Application {
            app_id: Some(self.app_id.clone()),
            name: self.name.clone(),
            platform_name: platform.to_string(),
            app_type: self.app_type.clone(),
        }
    }

    fn matches(&self, name_or_id: &str) -> bool {
        self.app_id == name_or_id || self.name.as_deref() == Some(name_or_id)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    applications: Vec<DirectoryEntry>,
}

/// Directory backed by a fixed list of entries, usually a JSON file:
///
/// ```json
/// { "applications": [
///     { "app_id": "chart", "name": "Chart", "launch": { "program": "/usr/bin/chart" },
///       "intents": [ { "name": "ViewChart", "context_types": ["fdc3.instrument"] } ] }
/// ] }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<DirectoryEntry>,
}

impl StaticDirectory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self { entries }
    }

    pub async fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DirectoryError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let file: DirectoryFile = serde_json::from_str(&raw).map_err(|source| DirectoryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), apps = file.applications.len(), "app directory loaded");
        Ok(Self::new(file.applications))
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    /// Catalog entries for the broker's own platform.
    pub fn hosted_definitions(&self, platform: &str) -> Vec<AppDefinition> {
        self.entries
            .iter()
            .filter(|e| e.platform.as_deref().is_none_or(|p| p == platform))
            .map(|e| AppDefinition {
                app: e.application(platform),
                intents: e.intents.clone(),
            })
            .collect()
    }

    /// Launch commands keyed by app id.
    pub fn launch_commands(&self) -> HashMap<String, LaunchCommand> {
        self.entries
            .iter()
            .filter_map(|e| e.launch.clone().map(|cmd| (e.app_id.clone(), cmd)))
            .collect()
    }
}

#[async_trait]
impl AppDirectory for StaticDirectory {
    async fn lookup(&self, name_or_id: &str) -> Result<Option<Application>, DirectoryError> {
        Ok(self
            .entries
            .iter()
            .find(|e| e.matches(name_or_id))
            .map(|e| e.application(e.platform.as_deref().unwrap_or_default())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    app_id: String,
    platform: String,
    generation: u64,
}

impl CacheKey {
    fn slot(&self) -> (String, String) {
        (self.app_id.clone(), self.platform.clone())
    }
}

struct CachedApp {
    app: Option<Application>,
    generation: u64,
}

/// Directory results cached per `(app_id, platform)`.
///
/// An entry is valid only for the platform generation it was fetched
/// under; any registration or health change makes it stale.
pub struct ApplicationCache {
    directory: Option<Arc<dyn AppDirectory>>,
    entries: Mutex<HashMap<(String, String), CachedApp>>,
}

impl ApplicationCache {
    pub fn new(directory: Option<Arc<dyn AppDirectory>>) -> Self {
        Self {
            directory,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), CachedApp>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fill in missing names and type tags for a batch of applications.
    ///
    /// Each distinct `(app_id, platform)` is looked up at most once per
    /// platform generation. Lookups run concurrently, each bounded by
    /// `timeout`, so a stalled directory costs one `timeout` per batch.
    /// Failed and timed-out lookups are cached as misses.
    pub async fn enrich(&self, apps: Vec<(&mut Application, u64)>, timeout: Duration) {
        let Some(directory) = &self.directory else {
            return;
        };
        let wanted: Vec<(&mut Application, CacheKey)> = apps
            .into_iter()
            .filter(|(app, _)| app.name.is_none() || app.app_type.is_none())
            .filter_map(|(app, generation)| {
                let key = CacheKey {
                    app_id: app.app_id.clone()?,
                    platform: app.platform_name.clone(),
                    generation,
                };
                Some((app, key))
            })
            .collect();
        if wanted.is_empty() {
            return;
        }

        let missing: HashSet<CacheKey> = {
            let entries = self.lock();
            wanted
                .iter()
                .map(|(_, key)| key)
                .filter(|key| {
                    entries
                        .get(&key.slot())
                        .is_none_or(|c| c.generation != key.generation)
                })
                .cloned()
                .collect()
        };

        let mut lookups: FuturesUnordered<_> = missing
            .into_iter()
            .map(|key| {
                let directory = Arc::clone(directory);
                async move {
                    let found = match tokio::time::timeout(timeout, directory.lookup(&key.app_id)).await {
                        Ok(Ok(found)) => found,
                        Ok(Err(e)) => {
                            tracing::warn!(app_id = %key.app_id, platform = %key.platform, error = %e, "directory lookup failed");
                            None
                        }
                        Err(_) => {
                            tracing::warn!(app_id = %key.app_id, platform = %key.platform, ?timeout, "directory lookup timed out");
                            None
                        }
                    };
                    (key, found)
                }
            })
            .collect();
        while let Some((key, found)) = lookups.next().await {
            self.lock().insert(
                key.slot(),
                CachedApp {
                    app: found,
                    generation: key.generation,
                },
            );
        }

        let entries = self.lock();
        for (app, key) in wanted {
            let Some(found) = entries.get(&key.slot()).and_then(|c| c.app.as_ref()) else {
                continue;
            };
            if app.name.is_none() {
                app.name = found.name.clone();
            }
            if app.app_type.is_none() {
                app.app_type = found.app_type.clone();
            }
        }
    }

    /// Drop every entry cached for `platform`.
    pub fn invalidate(&self, platform: &str) {
        self.lock().retain(|(_, p), _| p != platform);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
