//! Asset records produced by gathering and the cache entry that stores them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Tri-state flag for values that may not have been queried yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionalBool {
    /// Not queried.
    #[default]
    Unset,
    /// Queried and false.
    False,
    /// Queried and true.
    True,
}

impl OptionalBool {
    /// Whether the value has been queried.
    pub fn is_set(self) -> bool {
        self != Self::Unset
    }

    /// Whether the value has been queried and is true.
    pub fn is_true(self) -> bool {
        self == Self::True
    }
}

impl From<bool> for OptionalBool {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// Lightweight description of one asset inside a package file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetData {
    /// Long package name, e.g. `/Game/Maps/Entry`.
    pub package_name: String,
    /// Package path, e.g. `/Game/Maps`.
    pub package_path: String,
    /// Name of the asset within the package.
    pub asset_name: CompactString,
    /// Class of the asset.
    pub asset_class: CompactString,
    /// Searchable tag values.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Package was saved with editor-only data stripped.
    #[serde(default)]
    pub editor_only_filtered: bool,
}

impl AssetData {
    /// Create a new asset record without tags.
    pub fn new(
        package_name: impl Into<String>,
        asset_name: impl Into<CompactString>,
        asset_class: impl Into<CompactString>,
    ) -> Self {
        let package_name = package_name.into();
        let package_path = match package_name.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => package_name[..pos].to_string(),
        };
        Self {
            package_name,
            package_path,
            asset_name: asset_name.into(),
            asset_class: asset_class.into(),
            tags: BTreeMap::new(),
            editor_only_filtered: false,
        }
    }

    /// Add a tag value.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

/// Dependencies declared by a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyData {
    /// Long package name of the package declaring the dependencies.
    pub package_name: String,
    /// Long package names this package depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Package data was gathered for this record.
    #[serde(skip)]
    pub has_package_data: bool,
    /// Dependency data was gathered for this record.
    #[serde(skip)]
    pub has_dependency_data: bool,
}

impl DependencyData {
    /// Create dependency data for a package.
    pub fn new(package_name: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            package_name: package_name.into(),
            dependencies,
            has_package_data: false,
            has_dependency_data: false,
        }
    }
}

/// Result of reading one package file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetFileContents {
    /// Assets found in the package.
    #[serde(default)]
    pub assets: Vec<AssetData>,
    /// Dependencies of the package.
    #[serde(default)]
    pub dependency_data: DependencyData,
    /// Package was cooked without asset metadata.
    #[serde(default)]
    pub cooked_without_metadata: bool,
}

impl AssetFileContents {
    /// Whether any asset was saved with editor-only data stripped.
    pub fn is_editor_only_filtered(&self) -> bool {
        self.assets.iter().any(|asset| asset.editor_only_filtered)
    }
}

/// Cache entry for one package file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCachedAssetData {
    /// Modification time of the file when it was read.
    pub modification_time: DateTime<Utc>,
    /// Last time this entry was produced or confirmed.
    pub last_gathered_time: DateTime<Utc>,
    /// Extension of the file, without the dot.
    pub extension: CompactString,
    /// Whether the file carried the mark of the web when it was read.
    pub has_mark_of_the_web: OptionalBool,
    /// Assets read from the file.
    pub asset_data_list: Vec<AssetData>,
    /// Dependencies read from the file.
    pub dependency_data: DependencyData,
}

impl DiskCachedAssetData {
    /// Create an entry stamped with the current time.
    pub fn new(
        modification_time: DateTime<Utc>,
        last_gathered_time: DateTime<Utc>,
        extension: impl Into<CompactString>,
    ) -> Self {
        Self {
            modification_time,
            last_gathered_time,
            extension: extension.into(),
            has_mark_of_the_web: OptionalBool::Unset,
            asset_data_list: Vec::new(),
            dependency_data: DependencyData::default(),
        }
    }

    /// An entry may be reused only for an unchanged file with the same extension.
    pub fn is_valid_for(&self, modification_time: DateTime<Utc>, extension: &str) -> bool {
        self.modification_time == modification_time && self.extension.eq_ignore_ascii_case(extension)
    }
}
