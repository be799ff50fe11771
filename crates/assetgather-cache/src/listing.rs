//! Persisted directory listings used to skip enumeration of unchanged directories.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::error::CacheError;
use crate::file::{read_cache_file, supports_memory_mapped_files, write_cache_file};

/// Version tag of the directory listing cache format.
pub const LISTING_CACHE_VERSION: u64 = 0x4147_444c_0000_0001;

/// File name of the directory listing cache.
pub const LISTING_CACHE_FILE_NAME: &str = "CachedAssetRegistryDiscovery.bin";

/// A file recorded in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedFile {
    /// Leaf name including extension.
    pub name: String,
    /// Modification time at listing time.
    pub modification_time: DateTime<Utc>,
}

/// Contents of one directory at the time it was enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryListing {
    /// Modification time of the directory itself.
    pub modification_time: DateTime<Utc>,
    /// Leaf names of sub-directories.
    pub sub_dirs: Vec<String>,
    /// Files in the directory.
    pub files: Vec<ListedFile>,
}

/// Location of the directory listing cache.
#[derive(Debug, Clone)]
pub struct DirectoryListingStore {
    path: PathBuf,
}

impl DirectoryListingStore {
    /// Create a store in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(LISTING_CACHE_FILE_NAME),
        }
    }

    /// Path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all listings keyed by normalized directory path.
    ///
    /// A missing or invalid file yields no listings.
    pub fn load(&self) -> Vec<(String, DirectoryListing)> {
        if !self.path.exists() {
            return Vec::new();
        }
        match read_cache_file(&self.path, LISTING_CACHE_VERSION, supports_memory_mapped_files()) {
            Ok(listings) => listings,
            Err(CacheError::VersionMismatch { .. }) => {
                info!(path = %self.path.display(), "Directory listing cache version changed, ignored");
                Vec::new()
            }
            Err(err) => {
                error!(%err, "Integrity check failed, '{}' cache will be discarded", self.path.display());
                Vec::new()
            }
        }
    }

    /// Replace the cache file with `listings`.
    pub fn save<'a, I>(&self, listings: I) -> Result<u64, CacheError>
    where
        I: ExactSizeIterator<Item = (&'a str, &'a DirectoryListing)>,
    {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
        }
        write_cache_file(&self.path, LISTING_CACHE_VERSION, DEFAULT_BLOCK_SIZE, listings)
    }
}
