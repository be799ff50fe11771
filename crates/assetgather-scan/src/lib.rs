//! Discovery and gathering engines for assetgather.
//!
//! # Overview
//!
//! `assetgather-scan` finds package files under mounted content directories
//! and reads the asset records stored in them. Key features:
//!
//! - **Mount points** mapping local directories onto long package names
//! - **Allow and deny lists** controlling which directories are searched
//! - **Prioritized** discovery and gathering for paths a caller waits on
//! - **Parallel reads** on a bounded rayon pool
//! - **Persistent cache** so unchanged files are never read twice
//! - **Progress updates** via broadcast channels
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use assetgather_core::{AssetFileContents, GatherSettings, ReadError};
//! use assetgather_scan::{Collaborators, GatherResults, Gatherer};
//!
//! let reader = |_path: &str, _package: &str, _deps: bool| -> Result<AssetFileContents, ReadError> {
//!     Ok(AssetFileContents::default())
//! };
//! let gatherer = Gatherer::new(
//!     GatherSettings::new("Saved/Cache"),
//!     Collaborators::new(Arc::new(reader)),
//! )
//! .unwrap();
//!
//! gatherer.set_startup_complete();
//! gatherer.add_mount_point("/project/Content", "/Game");
//! gatherer.scan_paths_synchronous(&["/project/Content"], false, false);
//!
//! let mut results = GatherResults::default();
//! gatherer.get_and_trim_search_results(&mut results);
//! println!("Found {} assets", results.assets.len());
//! ```
//!
//! # Progress Monitoring
//!
//! Subscribe to progress updates:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use assetgather_core::{AssetFileContents, GatherSettings, ReadError};
//! # use assetgather_scan::{Collaborators, Gatherer};
//! # let reader = |_: &str, _: &str, _: bool| -> Result<AssetFileContents, ReadError> { Ok(Default::default()) };
//! # let gatherer = Gatherer::new(GatherSettings::new("Saved/Cache"), Collaborators::new(Arc::new(reader))).unwrap();
//! let mut progress_rx = gatherer.subscribe();
//!
//! // Handle progress in a separate task
//! tokio::spawn(async move {
//!     while let Ok(progress) = progress_rx.recv().await {
//!         println!("Gathered {} files", progress.files_processed());
//!     }
//! });
//! ```

mod discovery;
mod existence;
mod files_to_search;
mod gatherer;
mod mount_dir;
mod path_data;
mod progress;
mod reader;
mod scan_dir;
mod tick;

pub use discovery::{Discovery, DiscoveryBatch, DiscoveryDiagnostics, DiscoveryPause, ScanDirHandle};
pub use existence::{FileStat, PathExistence, PathType, stat_path};
pub use files_to_search::FilesToSearch;
pub use gatherer::{
    Collaborators, GatherDiagnostics, GatherPause, GatherResults, Gatherer, ResultContext,
};
pub use mount_dir::{DenyLists, MountDir, MountId};
pub use path_data::{DiscoveredPathData, GatheredPathData, Priority};
pub use progress::GatherProgress;
pub use reader::{
    AssetFileReader, DirEntry, DirectoryEnumerator, JwalkEnumerator, MarkOfTheWebProbe,
    NoMarkOfTheWeb,
};
pub use scan_dir::{Inherited, ScanCounters, ScanDirId, ScanTree, SetPathProperties};

// Re-export core types for convenience
pub use assetgather_core::{
    AssetData, AssetFileContents, DependencyData, DiskCachedAssetData, GatherError,
    GatherSettings, GatherWarning, GatherableFileType, OptionalBool, ReadError, WarningKind,
};
