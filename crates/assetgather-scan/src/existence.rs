//! Lazily loaded existence information for a queried path.

use std::path::Path;

use chrono::{DateTime, Utc};

use assetgather_core::paths;

/// Result of a single `stat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Whether the path is a directory.
    pub is_directory: bool,
    /// Last modification time.
    pub modification_time: DateTime<Utc>,
}

/// Stat a path, following symlinks.
pub fn stat_path(path: impl AsRef<Path>) -> Option<FileStat> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
    Some(FileStat {
        is_directory: metadata.is_dir(),
        modification_time: DateTime::<Utc>::from(modified),
    })
}

/// What is known about a queried path on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    /// The path is an existing directory.
    Directory,
    /// The path is an existing file.
    File,
    /// The path is missing but its parent directory exists.
    MissingButDirExists,
    /// Neither the path nor its parent directory exists.
    MissingParentDir,
}

/// A path whose disk state is queried at most once, and only when needed.
#[derive(Debug, Clone)]
pub struct PathExistence {
    local_abs_path: String,
    path_type: PathType,
    modification_time: Option<DateTime<Utc>>,
    has_existence_data: bool,
}

impl PathExistence {
    /// Create an entry for a normalized local path without touching the disk.
    pub fn new(local_abs_path: impl Into<String>) -> Self {
        Self {
            local_abs_path: local_abs_path.into(),
            path_type: PathType::MissingParentDir,
            modification_time: None,
            has_existence_data: false,
        }
    }

    /// Create an entry for a path the caller already knows to be a directory.
    pub fn confirmed_directory(local_abs_path: impl Into<String>) -> Self {
        Self {
            path_type: PathType::Directory,
            has_existence_data: true,
            ..Self::new(local_abs_path)
        }
    }

    /// The queried path.
    pub fn local_abs_path(&self) -> &str {
        &self.local_abs_path
    }

    /// Whether the disk has been queried yet.
    pub fn has_existence_data(&self) -> bool {
        self.has_existence_data
    }

    /// Query the disk if that has not happened yet.
    pub fn load_existence_data(&mut self) {
        if self.has_existence_data {
            return;
        }
        self.has_existence_data = true;

        match stat_path(&self.local_abs_path) {
            Some(stat) => {
                self.path_type = if stat.is_directory {
                    PathType::Directory
                } else {
                    PathType::File
                };
                self.modification_time = Some(stat.modification_time);
            }
            None => {
                let parent = paths::parent_path(&self.local_abs_path);
                let parent_is_dir = !parent.is_empty()
                    && stat_path(parent).is_some_and(|stat| stat.is_directory);
                self.path_type = if parent_is_dir {
                    PathType::MissingButDirExists
                } else {
                    PathType::MissingParentDir
                };
            }
        }
    }

    /// Kind of the path, querying the disk on first use.
    pub fn path_type(&mut self) -> PathType {
        self.load_existence_data();
        self.path_type
    }

    /// Modification time of an existing path, querying the disk on first use.
    pub fn modification_time(&mut self) -> Option<DateTime<Utc>> {
        self.load_existence_data();
        self.modification_time
    }

    /// The deepest path known to exist: the path itself, its parent, or nothing.
    pub fn lowest_existing_path(&mut self) -> &str {
        match self.path_type() {
            PathType::Directory | PathType::File => &self.local_abs_path,
            PathType::MissingButDirExists => paths::parent_path(&self.local_abs_path),
            PathType::MissingParentDir => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgather_core::paths::normalize_local_path;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_existing_paths() {
        let temp = TempDir::new().unwrap();
        let root = normalize_local_path(temp.path());
        fs::write(temp.path().join("A.pkg"), "x").unwrap();

        let mut dir = PathExistence::new(root.clone());
        assert!(!dir.has_existence_data());
        assert_eq!(dir.path_type(), PathType::Directory);
        assert!(dir.has_existence_data());

        let mut file = PathExistence::new(format!("{root}/A.pkg"));
        assert_eq!(file.path_type(), PathType::File);
        assert!(file.modification_time().is_some());
        assert_eq!(file.lowest_existing_path(), format!("{root}/A.pkg"));
    }

    #[test]
    fn test_missing_paths() {
        let temp = TempDir::new().unwrap();
        let root = normalize_local_path(temp.path());

        let mut missing = PathExistence::new(format!("{root}/Missing.pkg"));
        assert_eq!(missing.path_type(), PathType::MissingButDirExists);
        assert_eq!(missing.lowest_existing_path(), root);
        assert!(missing.modification_time().is_none());

        let mut orphan = PathExistence::new(format!("{root}/NoDir/Missing.pkg"));
        assert_eq!(orphan.path_type(), PathType::MissingParentDir);
        assert_eq!(orphan.lowest_existing_path(), "");
    }
}
