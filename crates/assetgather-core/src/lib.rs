//! Core types for assetgather.
//!
//! This crate provides the data structures shared by the cache and scan
//! crates: gather settings, error and warning types, the asset records
//! produced by gathering, the cache entry format, and the string path
//! helpers used to map local directories onto long package names.

mod config;
mod error;
pub mod paths;
mod record;

pub use config::{GatherSettings, GatherSettingsBuilder};
pub use error::{GatherError, GatherWarning, ReadError, WarningKind};
pub use paths::GatherableFileType;
pub use record::{
    AssetData, AssetFileContents, DependencyData, DiskCachedAssetData, OptionalBool,
};
