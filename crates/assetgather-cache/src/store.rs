//! Sharded asset cache.
//!
//! Entries are spread over `N` shard files named `{base}_{index}.bin`, where
//! `N` is a power of two chosen from the entry count and the number of cores.
//! The shard of an entry is the lowercase hash of its key masked by `N - 1`,
//! so differently-cased runs agree on where a key lives.

use std::borrow::Borrow;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use humansize::{BINARY, format_size};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use assetgather_core::DiskCachedAssetData;

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::error::CacheError;
use crate::file::{read_cache_file, supports_memory_mapped_files, write_cache_file};

/// Version tag of the asset cache format.
pub const ASSET_CACHE_VERSION: u64 = 0x4147_4352_0000_0003;

/// Target number of entries per shard.
pub const CACHE_SHARD_ASSET_COUNT: usize = 32_768;

/// Base file name when dependency data is gathered.
pub const CACHE_BASE_NAME: &str = "CachedAssetRegistry";

/// Base file name when dependency data is not gathered.
pub const CACHE_BASE_NAME_NO_DEPS: &str = "CachedAssetRegistryNoDeps";

/// Hash of a cache key, ignoring ASCII case.
pub fn key_hash(key: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    let mut lowered = [0u8; 256];
    for chunk in key.as_bytes().chunks(lowered.len()) {
        let lowered = &mut lowered[..chunk.len()];
        for (dst, src) in lowered.iter_mut().zip(chunk) {
            *dst = src.to_ascii_lowercase();
        }
        hasher.update(lowered);
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Outcome of loading one shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// All entries were loaded.
    Loaded,
    /// The file was written by another format version.
    VersionMismatch,
    /// The file failed validation and was discarded.
    Corrupt,
}

/// Entries loaded from one shard file.
#[derive(Debug)]
pub struct LoadedShard {
    /// Shard file.
    pub path: PathBuf,
    /// Shard index taken from the file name.
    pub index: usize,
    /// Load outcome.
    pub status: ShardStatus,
    /// Entries of the shard; empty unless the status is `Loaded`.
    pub entries: Vec<(String, DiskCachedAssetData)>,
}

/// Summary of a completed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSummary {
    /// Number of shard files written.
    pub shards: usize,
    /// Number of entries written.
    pub entries: usize,
    /// Total bytes written.
    pub bytes: u64,
}

/// Location and layout of the sharded asset cache.
#[derive(Debug, Clone)]
pub struct AssetCacheStore {
    dir: PathBuf,
    base_name: &'static str,
    block_size: usize,
    shard_asset_count: usize,
    max_shards: usize,
    memory_map: bool,
}

impl AssetCacheStore {
    /// Create a store in `dir` for the given cache mode.
    pub fn new(dir: impl Into<PathBuf>, gather_dependency_data: bool) -> Self {
        Self {
            dir: dir.into(),
            base_name: if gather_dependency_data {
                CACHE_BASE_NAME
            } else {
                CACHE_BASE_NAME_NO_DEPS
            },
            block_size: DEFAULT_BLOCK_SIZE,
            shard_asset_count: CACHE_SHARD_ASSET_COUNT,
            max_shards: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            memory_map: supports_memory_mapped_files(),
        }
    }

    /// Override the checksummed block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    /// Override the target number of entries per shard.
    pub fn with_shard_asset_count(mut self, count: usize) -> Self {
        self.shard_asset_count = count.max(1);
        self
    }

    /// Override the shard cap, normally the number of cores.
    pub fn with_max_shards(mut self, max_shards: usize) -> Self {
        self.max_shards = max_shards.max(1);
        self
    }

    /// Choose between memory-mapped and buffered loading.
    pub fn with_memory_map(mut self, memory_map: bool) -> Self {
        self.memory_map = memory_map && supports_memory_mapped_files();
        self
    }

    /// Directory holding the cache files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Base file name for the current cache mode.
    pub fn base_name(&self) -> &str {
        self.base_name
    }

    /// Path of one shard file.
    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{index}.bin", self.base_name))
    }

    /// Path of the unsharded cache file written by older versions.
    pub fn legacy_path(&self) -> PathBuf {
        self.dir.join(format!("{}.bin", self.base_name))
    }

    /// Number of shards used for `entry_count` entries.
    pub fn shard_count_for(&self, entry_count: usize) -> usize {
        entry_count
            .div_ceil(self.shard_asset_count)
            .min(self.max_shards)
            .max(1)
            .next_power_of_two()
    }

    /// Shard files currently on disk, sorted by index.
    pub fn find_shard_files(&self) -> Vec<(usize, PathBuf)> {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let prefix = format!("{}_", self.base_name);
        let mut shards: Vec<(usize, PathBuf)> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                let index = name.strip_prefix(&prefix)?.strip_suffix(".bin")?;
                let index = index.parse::<usize>().ok()?;
                Some((index, entry.path()))
            })
            .collect();
        shards.sort_by_key(|(index, _)| *index);
        shards
    }

    /// Write all entries, replacing the previous cache.
    ///
    /// Each shard is written to a temporary file and renamed into place.
    /// After every shard succeeds, the legacy monolithic file and shards with
    /// an index at or above the new shard count are deleted.
    pub fn save<K, V>(&self, entries: &[(K, V)]) -> Result<SaveSummary, CacheError>
    where
        K: AsRef<str> + Sync,
        V: Borrow<DiskCachedAssetData> + Sync,
    {
        let start = Instant::now();
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;

        let shard_count = self.shard_count_for(entries.len());
        let mask = (shard_count - 1) as u64;
        let mut shards: Vec<Vec<(&str, &DiskCachedAssetData)>> = vec![Vec::new(); shard_count];
        for (key, value) in entries {
            let key = key.as_ref();
            shards[(key_hash(key) & mask) as usize].push((key, value.borrow()));
        }

        let written: Vec<Result<u64, CacheError>> = shards
            .par_iter()
            .enumerate()
            .map(|(index, shard)| {
                write_cache_file(
                    &self.shard_path(index),
                    ASSET_CACHE_VERSION,
                    self.block_size,
                    shard.iter(),
                )
            })
            .collect();

        let mut bytes = 0;
        for result in written {
            match result {
                Ok(size) => bytes += size,
                Err(err) => {
                    error!(%err, "Failed to save asset cache shard");
                    return Err(err);
                }
            }
        }

        self.delete_stale_files(shard_count);

        info!(
            entries = entries.len(),
            shards = shard_count,
            size = %format_size(bytes, BINARY),
            seconds = start.elapsed().as_secs_f64(),
            "Saved asset cache"
        );
        Ok(SaveSummary {
            shards: shard_count,
            entries: entries.len(),
            bytes,
        })
    }

    fn delete_stale_files(&self, shard_count: usize) {
        let legacy = self.legacy_path();
        if legacy.exists() {
            if let Err(err) = fs::remove_file(&legacy) {
                warn!(path = %legacy.display(), %err, "Could not delete legacy cache file");
            }
        }
        for (index, path) in self.find_shard_files() {
            if index >= shard_count {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(path = %path.display(), %err, "Could not delete stale cache shard");
                }
            }
        }
    }

    /// Load every shard file in parallel.
    ///
    /// A shard that fails validation or has another version contributes no
    /// entries; the other shards are unaffected.
    pub fn load(&self) -> Vec<LoadedShard> {
        let start = Instant::now();
        let shards: Vec<LoadedShard> = self
            .find_shard_files()
            .into_par_iter()
            .map(|(index, path)| self.load_shard(index, path))
            .collect();

        let entries: usize = shards.iter().map(|shard| shard.entries.len()).sum();
        debug!(
            shards = shards.len(),
            entries,
            seconds = start.elapsed().as_secs_f64(),
            "Loaded asset cache"
        );
        shards
    }

    fn load_shard(&self, index: usize, path: PathBuf) -> LoadedShard {
        match read_cache_file(&path, ASSET_CACHE_VERSION, self.memory_map) {
            Ok(entries) => LoadedShard {
                path,
                index,
                status: ShardStatus::Loaded,
                entries,
            },
            Err(CacheError::VersionMismatch { found, .. }) => {
                info!(path = %path.display(), found, "Asset cache version changed, shard ignored");
                LoadedShard {
                    path,
                    index,
                    status: ShardStatus::VersionMismatch,
                    entries: Vec::new(),
                }
            }
            Err(err) => {
                error!(%err, "Integrity check failed, '{}' cache will be discarded", path.display());
                LoadedShard {
                    path,
                    index,
                    status: ShardStatus::Corrupt,
                    entries: Vec::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_shard_count_is_power_of_two() {
        let store = AssetCacheStore::new("/tmp", true)
            .with_shard_asset_count(10)
            .with_max_shards(6);
        assert_eq!(store.shard_count_for(0), 1);
        assert_eq!(store.shard_count_for(10), 1);
        assert_eq!(store.shard_count_for(11), 2);
        assert_eq!(store.shard_count_for(25), 4);
        // Capped at six, rounded up to eight
        assert_eq!(store.shard_count_for(1000), 8);
    }

    #[test]
    fn test_key_hash_ignores_case() {
        assert_eq!(key_hash("/Game/Maps/Entry"), key_hash("/game/maps/ENTRY"));
        assert_ne!(key_hash("/Game/A"), key_hash("/Game/B"));
    }

    #[test]
    fn test_file_names_follow_cache_mode() {
        let store = AssetCacheStore::new("/cache", false);
        assert_eq!(store.shard_path(2), PathBuf::from("/cache/CachedAssetRegistryNoDeps_2.bin"));
        assert_eq!(store.legacy_path(), PathBuf::from("/cache/CachedAssetRegistryNoDeps.bin"));
    }

    #[test]
    fn test_find_shard_files_ignores_other_files() {
        let temp = TempDir::new().unwrap();
        let store = AssetCacheStore::new(temp.path(), true);
        fs::write(store.shard_path(1), b"x").unwrap();
        fs::write(store.shard_path(0), b"x").unwrap();
        fs::write(temp.path().join("CachedAssetRegistry_x.bin"), b"x").unwrap();
        fs::write(temp.path().join("CachedAssetRegistryNoDeps_0.bin"), b"x").unwrap();

        let found: Vec<usize> = store.find_shard_files().into_iter().map(|(i, _)| i).collect();
        assert_eq!(found, vec![0, 1]);
    }
}
