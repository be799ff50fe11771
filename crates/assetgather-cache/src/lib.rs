//! Cache persistence for assetgather.
//!
//! # Overview
//!
//! Gathered asset data is persisted so that later runs can skip reading
//! files that have not changed. Key features:
//!
//! - **Sharded** files (`{base}_{N}.bin`) loaded and saved in parallel
//! - **Checksummed** blocks; a damaged shard is discarded, never half-loaded
//! - **Memory-mapped** loading with a buffered fallback behind one reader
//! - **Atomic** saves through a temporary file and a rename
//!
//! # Example
//!
//! ```rust,no_run
//! use assetgather_cache::AssetCacheStore;
//!
//! let store = AssetCacheStore::new("Saved/Cache", true);
//! for shard in store.load() {
//!     println!("{}: {} entries", shard.path.display(), shard.entries.len());
//! }
//! ```

mod block;
mod error;
mod file;
mod listing;
mod store;

pub use block::{
    BLOCK_HEADER_SIZE, BLOCK_MAGIC, BlockSource, BufferedBlocks, ChecksumReader, ChecksumWriter,
    DEFAULT_BLOCK_SIZE, MappedBlocks, block_checksum,
};
pub use error::CacheError;
pub use file::{read_cache_file, supports_memory_mapped_files, temp_path, write_cache_file};
pub use listing::{
    DirectoryListing, DirectoryListingStore, LISTING_CACHE_FILE_NAME, LISTING_CACHE_VERSION,
    ListedFile,
};
pub use store::{
    ASSET_CACHE_VERSION, AssetCacheStore, CACHE_BASE_NAME, CACHE_BASE_NAME_NO_DEPS,
    CACHE_SHARD_ASSET_COUNT, LoadedShard, SaveSummary, ShardStatus, key_hash,
};
