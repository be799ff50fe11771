//! Gather configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::GatherError;

/// Settings read once at startup and shared by the discovery and gather engines.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate", error = "GatherError"))]
pub struct GatherSettings {
    /// Directory holding the persisted caches.
    pub cache_dir: PathBuf,

    /// Run discovery and gathering on dedicated background threads.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub async_enabled: bool,

    /// Threads used for parallel directory enumeration (0 = auto-detect).
    #[builder(default = "0")]
    #[serde(default)]
    pub discover_threads: usize,

    /// Minimum number of directories handed to one enumeration worker.
    #[builder(default = "4")]
    #[serde(default = "default_discover_min_batch_size")]
    pub discover_min_batch_size: usize,

    /// Threads used for parallel file reads (0 = auto-detect).
    #[builder(default = "0")]
    #[serde(default)]
    pub gather_threads: usize,

    /// Files handed to each read thread per batch.
    #[builder(default = "3")]
    #[serde(default = "default_single_thread_files_per_batch")]
    pub single_thread_files_per_batch: usize,

    /// Load previously gathered results from the asset cache.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub cache_read_enabled: bool,

    /// Write gathered results to the asset cache.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub cache_write_enabled: bool,

    /// Gather dependency data alongside asset data.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub gather_dependency_data: bool,

    /// Minimum time between two incremental cache writes.
    #[builder(default = "60")]
    #[serde(default = "default_min_seconds_before_cache_write")]
    pub min_seconds_before_cache_write: u64,

    /// Minimum number of uncached reads before an incremental cache write.
    #[builder(default = "50_000")]
    #[serde(default = "default_min_asset_reads_before_cache_write")]
    pub min_asset_reads_before_cache_write: usize,

    /// Entries not seen for this many days are dropped from the saved cache.
    #[builder(default = "30")]
    #[serde(default = "default_cache_prune_age_days")]
    pub cache_prune_age_days: u32,

    /// Reuse persisted directory listings when the directory is unchanged.
    #[builder(default = "false")]
    #[serde(default)]
    pub discovery_cache_enabled: bool,

    /// Do not report directories that contain no gatherable files.
    #[builder(default = "false")]
    #[serde(default)]
    pub ignore_empty_directories: bool,

    /// Report files downloaded from untrusted sources as blocked instead of reading them.
    #[builder(default = "false")]
    #[serde(default)]
    pub block_files_with_mark_of_the_web: bool,

    /// Recognized package file extensions, without the leading dot.
    #[builder(default = "default_package_extensions()")]
    #[serde(default = "default_package_extensions")]
    pub package_extensions: Vec<String>,

    /// Long package names excluded from scanning, e.g. `/Game/Developers`.
    #[builder(default)]
    #[serde(default)]
    pub deny_list_package_paths: Vec<String>,

    /// Mount-relative paths excluded under every mount, e.g. `Collections`.
    #[builder(default)]
    #[serde(default)]
    pub deny_list_mount_relative_paths: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_discover_min_batch_size() -> usize {
    4
}

fn default_single_thread_files_per_batch() -> usize {
    3
}

fn default_min_seconds_before_cache_write() -> u64 {
    60
}

fn default_min_asset_reads_before_cache_write() -> usize {
    50_000
}

fn default_cache_prune_age_days() -> u32 {
    30
}

fn default_package_extensions() -> Vec<String> {
    vec!["uasset".to_string(), "umap".to_string(), "pkg".to_string()]
}

impl GatherSettingsBuilder {
    fn validate(&self) -> Result<(), GatherError> {
        let Some(ref cache_dir) = self.cache_dir else {
            return Err(GatherError::invalid_config("Cache directory is required"));
        };
        let cache_used = self.cache_read_enabled.unwrap_or(true) || self.cache_write_enabled.unwrap_or(true);
        check_settings(self.package_extensions.as_deref(), cache_dir, cache_used)
    }
}

fn check_settings(
    package_extensions: Option<&[String]>,
    cache_dir: &Path,
    cache_used: bool,
) -> Result<(), GatherError> {
    if let Some(extensions) = package_extensions {
        if extensions.is_empty() {
            return Err(GatherError::invalid_config("At least one package extension is required"));
        }
        if extensions.iter().any(|ext| ext.is_empty() || ext.starts_with('.')) {
            return Err(GatherError::invalid_config(
                "Package extensions must be non-empty and have no leading dot",
            ));
        }
    }
    if cache_used && cache_dir.as_os_str().is_empty() {
        return Err(GatherError::invalid_config(
            "Cache directory cannot be empty when the cache is enabled",
        ));
    }
    Ok(())
}

impl GatherSettings {
    /// Create a new settings builder.
    pub fn builder() -> GatherSettingsBuilder {
        GatherSettingsBuilder::default()
    }

    /// Create default settings writing caches under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            async_enabled: true,
            discover_threads: 0,
            discover_min_batch_size: default_discover_min_batch_size(),
            gather_threads: 0,
            single_thread_files_per_batch: default_single_thread_files_per_batch(),
            cache_read_enabled: true,
            cache_write_enabled: true,
            gather_dependency_data: true,
            min_seconds_before_cache_write: default_min_seconds_before_cache_write(),
            min_asset_reads_before_cache_write: default_min_asset_reads_before_cache_write(),
            cache_prune_age_days: default_cache_prune_age_days(),
            discovery_cache_enabled: false,
            ignore_empty_directories: false,
            block_files_with_mark_of_the_web: false,
            package_extensions: default_package_extensions(),
            deny_list_package_paths: Vec::new(),
            deny_list_mount_relative_paths: Vec::new(),
        }
    }

    /// Check settings built outside the builder, such as a deserialized config.
    pub fn validate(&self) -> Result<(), GatherError> {
        check_settings(
            Some(&self.package_extensions),
            &self.cache_dir,
            self.cache_read_enabled || self.cache_write_enabled,
        )
    }

    /// Effective number of enumeration threads.
    pub fn effective_discover_threads(&self) -> usize {
        resolve_threads(self.discover_threads)
    }

    /// Effective number of read threads.
    pub fn effective_gather_threads(&self) -> usize {
        resolve_threads(self.gather_threads)
    }

    /// Number of files popped per gather batch: every read thread gets
    /// `single_thread_files_per_batch` files.
    pub fn files_per_batch(&self) -> usize {
        self.effective_gather_threads() * self.single_thread_files_per_batch.max(1)
    }

    /// Minimum interval between incremental cache writes.
    pub fn min_time_before_cache_write(&self) -> Duration {
        Duration::from_secs(self.min_seconds_before_cache_write)
    }

    /// Age after which unseen cache entries are pruned.
    pub fn cache_prune_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_prune_age_days))
    }

    /// Check whether an extension (without the dot) names a package file.
    pub fn is_package_extension(&self, extension: &str) -> bool {
        self.package_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(extension))
    }
}

impl Default for GatherSettings {
    fn default() -> Self {
        Self::new("Saved/Cache")
    }
}

fn resolve_threads(configured: usize) -> usize {
    match configured {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
        n => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_builder() {
        let settings = GatherSettings::builder()
            .cache_dir("/tmp/cache")
            .gather_threads(4usize)
            .async_enabled(false)
            .build()
            .unwrap();

        assert_eq!(settings.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(settings.gather_threads, 4);
        assert_eq!(settings.files_per_batch(), 12);
        assert!(!settings.async_enabled);
        assert!(settings.cache_read_enabled);
    }

    #[test]
    fn test_settings_validation() {
        assert!(GatherSettings::builder().build().is_err());
        assert!(
            GatherSettings::builder()
                .cache_dir("/tmp/cache")
                .package_extensions(Vec::<String>::new())
                .build()
                .is_err()
        );
        assert!(
            GatherSettings::builder()
                .cache_dir("/tmp/cache")
                .package_extensions(vec![".pkg".to_string()])
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_validation_errors_are_config_errors() {
        let err = GatherSettings::builder().build().unwrap_err();
        assert!(matches!(err, GatherError::InvalidConfig { .. }));

        let mut settings = GatherSettings::new("/tmp/cache");
        assert!(settings.validate().is_ok());
        settings.package_extensions.clear();
        assert!(matches!(settings.validate(), Err(GatherError::InvalidConfig { .. })));

        settings.package_extensions = vec!["pkg".to_string()];
        settings.cache_dir = PathBuf::new();
        assert!(settings.validate().is_err());
        settings.cache_read_enabled = false;
        settings.cache_write_enabled = false;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_single_thread_batch() {
        let mut settings = GatherSettings::new("/tmp/cache");
        settings.gather_threads = 1;
        assert_eq!(settings.files_per_batch(), 3);
    }

    #[test]
    fn test_package_extension_case_insensitive() {
        let settings = GatherSettings::new("/tmp/cache");
        assert!(settings.is_package_extension("UASSET"));
        assert!(settings.is_package_extension("pkg"));
        assert!(!settings.is_package_extension("txt"));
    }

    #[test]
    fn test_settings_serde_defaults() {
        let settings: GatherSettings = serde_json::from_str(r#"{"cache_dir": "/tmp/c"}"#).unwrap();
        assert!(settings.async_enabled);
        assert_eq!(settings.single_thread_files_per_batch, 3);
        assert_eq!(settings.package_extensions.len(), 3);
    }
}
