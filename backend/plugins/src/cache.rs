//! On-disk cache of the functions each plugin advertises, so that plugins can
//! be registered lazily without starting them.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tether_core::protocol::PluginFunction;
use tether_core::{HostError, HostResult};
use tracing::{debug, warn};

/// One cache file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Creation time of the plugin file in 100ns ticks since the Unix epoch.
    pub created_at_ticks: i64,
    pub functions: Vec<PluginFunction>,
}

/// Creation time of `path` in ticks, falling back to the modification time
/// where the file system does not record creation.
pub async fn file_ticks(path: &Path) -> HostResult<i64> {
    let metadata = tokio::fs::metadata(path).await?;
    let time = metadata.created().or_else(|_| metadata.modified())?;
    Ok(ticks(time))
}

fn ticks(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_nanos() / 100).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_nanos() / 100).unwrap_or(i64::MAX),
    }
}

pub struct FunctionsCache {
    dir: PathBuf,
}

impl FunctionsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, plugin_file: &Path) -> PathBuf {
        let name = plugin_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir.join(format!("{name}.json"))
    }

    /// Raw entry for `plugin_file`, if one exists and parses.
    pub async fn load(&self, plugin_file: &Path) -> Option<CacheEntry> {
        let path = self.entry_path(plugin_file);
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(cache = %path.display(), error = %e, "Ignoring unreadable functions cache");
                None
            }
        }
    }

    /// Cached functions, only if the plugin file is unchanged since caching.
    pub async fn load_valid(&self, plugin_file: &Path) -> Option<Vec<PluginFunction>> {
        let entry = self.load(plugin_file).await?;
        let current = file_ticks(plugin_file).await.ok()?;
        if entry.created_at_ticks != current {
            debug!(file = %plugin_file.display(), "Functions cache is stale");
            return None;
        }
        Some(entry.functions)
    }

    /// Write the entry atomically (temp file + rename).
    pub async fn store(&self, plugin_file: &Path, functions: &[PluginFunction]) -> HostResult<()> {
        let entry = CacheEntry {
            created_at_ticks: file_ticks(plugin_file).await?,
            functions: functions.to_vec(),
        };
        let content = serde_json::to_string_pretty(&entry)
            .map_err(|e| HostError::Internal(format!("cannot encode functions cache: {e}")))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.entry_path(plugin_file);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(cache = %path.display(), functions = functions.len(), "Stored functions cache");
        Ok(())
    }
}
