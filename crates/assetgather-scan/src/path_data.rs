//! Records passed from discovery to gathering.

use chrono::{DateTime, Utc};

use assetgather_core::{GatherableFileType, paths};

/// Priority of a request to resolve a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// The caller is waiting on the path.
    Blocking,
    /// Resolve before ordinary work.
    High,
    /// Ordinary background work.
    Normal,
}

/// A file or directory found by discovery, relative to the directory that listed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPathData {
    /// Normalized local absolute path.
    pub local_abs_path: String,
    /// Long package name, without extension for package files.
    pub long_package_name: String,
    /// Path relative to the listed directory.
    pub rel_path: String,
    /// Modification time of the entry.
    pub package_timestamp: DateTime<Utc>,
    /// Kind of entry.
    pub file_type: GatherableFileType,
}

impl DiscoveredPathData {
    /// Build the record for an entry found while listing a directory.
    pub fn new(
        dir_local_abs_path: &str,
        dir_long_package_name: &str,
        rel_path: &str,
        package_timestamp: DateTime<Utc>,
        file_type: GatherableFileType,
    ) -> Self {
        let mut data = Self {
            local_abs_path: String::new(),
            long_package_name: String::new(),
            rel_path: String::new(),
            package_timestamp,
            file_type,
        };
        data.assign(dir_local_abs_path, dir_long_package_name, rel_path);
        data
    }

    /// Recompute the absolute path and package name for a new relative path.
    pub fn assign(&mut self, dir_local_abs_path: &str, dir_long_package_name: &str, rel_path: &str) {
        self.rel_path = rel_path.to_string();
        self.local_abs_path = paths::join_path(dir_local_abs_path, rel_path);
        let package_rel = match self.file_type {
            GatherableFileType::PackageFile => paths::base_filename_with_path(rel_path),
            _ => rel_path,
        };
        self.long_package_name = paths::join_path(dir_long_package_name, package_rel);
    }
}

/// A file queued for gathering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatheredPathData {
    /// Normalized local absolute path.
    pub local_abs_path: String,
    /// Long package name, without extension.
    pub long_package_name: String,
    /// Modification time of the file when it was discovered.
    pub package_timestamp: DateTime<Utc>,
    /// Kind of entry.
    pub file_type: GatherableFileType,
}

impl GatheredPathData {
    /// Create a record.
    pub fn new(
        local_abs_path: impl Into<String>,
        long_package_name: impl Into<String>,
        package_timestamp: DateTime<Utc>,
        file_type: GatherableFileType,
    ) -> Self {
        Self {
            local_abs_path: local_abs_path.into(),
            long_package_name: long_package_name.into(),
            package_timestamp,
            file_type,
        }
    }
}

impl From<DiscoveredPathData> for GatheredPathData {
    fn from(data: DiscoveredPathData) -> Self {
        Self {
            local_abs_path: data.local_abs_path,
            long_package_name: data.long_package_name,
            package_timestamp: data.package_timestamp,
            file_type: data.file_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovered_package_name_drops_extension() {
        let data = DiscoveredPathData::new(
            "/project/Content",
            "/Game",
            "Maps/Entry.umap",
            Utc::now(),
            GatherableFileType::PackageFile,
        );
        assert_eq!(data.local_abs_path, "/project/Content/Maps/Entry.umap");
        assert_eq!(data.long_package_name, "/Game/Maps/Entry");
    }

    #[test]
    fn test_discovered_directory_keeps_name() {
        let data = DiscoveredPathData::new(
            "/project/Content",
            "/Game",
            "Maps",
            Utc::now(),
            GatherableFileType::Directory,
        );
        assert_eq!(data.long_package_name, "/Game/Maps");
        let gathered = GatheredPathData::from(data);
        assert_eq!(gathered.local_abs_path, "/project/Content/Maps");
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Blocking < Priority::High);
        assert!(Priority::High < Priority::Normal);
    }
}
