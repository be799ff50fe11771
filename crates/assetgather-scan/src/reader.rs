//! Collaborator interfaces: asset file reading, mark-of-the-web probing and
//! directory enumeration.

use std::path::Path;

use chrono::{DateTime, Utc};
use jwalk::{Parallelism, WalkDir};
use tracing::debug;

use assetgather_core::{AssetFileContents, GatherError, ReadError};

/// Reads the asset records of one package file.
pub trait AssetFileReader: Send + Sync {
    /// Read the assets of `local_abs_path`, whose long package name is `long_package_name`.
    ///
    /// Dependency data is only requested when `gather_dependency_data` is set.
    fn read_asset_file(
        &self,
        local_abs_path: &str,
        long_package_name: &str,
        gather_dependency_data: bool,
    ) -> Result<AssetFileContents, ReadError>;
}

impl<F> AssetFileReader for F
where
    F: Fn(&str, &str, bool) -> Result<AssetFileContents, ReadError> + Send + Sync,
{
    fn read_asset_file(
        &self,
        local_abs_path: &str,
        long_package_name: &str,
        gather_dependency_data: bool,
    ) -> Result<AssetFileContents, ReadError> {
        self(local_abs_path, long_package_name, gather_dependency_data)
    }
}

/// Reports whether a file was downloaded from an untrusted source.
pub trait MarkOfTheWebProbe: Send + Sync {
    fn has_mark_of_the_web(&self, local_abs_path: &str) -> bool;
}

/// Probe for platforms without the marker.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMarkOfTheWeb;

impl MarkOfTheWebProbe for NoMarkOfTheWeb {
    fn has_mark_of_the_web(&self, _local_abs_path: &str) -> bool {
        false
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Leaf name of the entry.
    pub name: String,
    pub is_directory: bool,
    pub modification_time: DateTime<Utc>,
    /// Entry is a symlink or other reparse point.
    pub is_reparse_point: bool,
}

/// Lists the direct children of a directory.
pub trait DirectoryEnumerator: Send + Sync {
    /// Whether a change-journal listing is available for the volume of `dir`.
    fn journal_is_available(&self, _dir: &str) -> bool {
        false
    }

    /// List `dir` through the change journal.
    fn enumerate_journal(&self, dir: &str) -> Result<Vec<DirEntry>, GatherError> {
        Err(GatherError::Unsupported {
            message: format!("no change journal for {dir}"),
        })
    }

    /// List `dir` by reading the directory.
    fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, GatherError>;
}

/// Directory enumerator backed by jwalk.
#[derive(Debug, Clone, Copy, Default)]
pub struct JwalkEnumerator;

impl JwalkEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl DirectoryEnumerator for JwalkEnumerator {
    fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, GatherError> {
        let root = Path::new(dir);
        let metadata = std::fs::metadata(root).map_err(|e| GatherError::io(root, e))?;
        if !metadata.is_dir() {
            return Err(GatherError::NotADirectory {
                path: root.to_path_buf(),
            });
        }

        // Directories are listed one level at a time and already run on a pool
        let walker = WalkDir::new(root)
            .parallelism(Parallelism::Serial)
            .skip_hidden(false)
            .follow_links(false)
            .min_depth(1)
            .max_depth(1);

        let mut entries = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|err| {
                let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                match err.into_io_error() {
                    Some(source) => GatherError::io(path, source),
                    None => GatherError::Unsupported {
                        message: format!("loop while listing {}", path.display()),
                    },
                }
            })?;
            let file_type = entry.file_type();
            let is_reparse_point = file_type.is_symlink();
            // Symlinks are resolved so a linked directory is listed as a directory
            // Entries removed between the listing and the stat are skipped
            let metadata = match std::fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(path = %entry.path().display(), %err, "Skipping directory entry that could not be read");
                    continue;
                }
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: metadata.is_dir(),
                modification_time: metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_default(),
                is_reparse_point,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_jwalk_lists_direct_children_only() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Sub/Deep")).unwrap();
        fs::write(temp.path().join("A.pkg"), "a").unwrap();
        fs::write(temp.path().join("Sub/B.pkg"), "b").unwrap();

        let dir = temp.path().to_string_lossy().into_owned();
        let mut entries = JwalkEnumerator::new().enumerate(&dir).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let names: Vec<(&str, bool)> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.is_directory))
            .collect();
        assert_eq!(names, vec![("A.pkg", false), ("Sub", true)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_entries_are_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("A.pkg"), "a").unwrap();
        std::os::unix::fs::symlink(temp.path().join("gone.pkg"), temp.path().join("B.pkg")).unwrap();

        let dir = temp.path().to_string_lossy().into_owned();
        let entries = JwalkEnumerator::new().enumerate(&dir).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A.pkg"]);
    }

    #[test]
    fn test_enumerate_missing_directory_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing").to_string_lossy().into_owned();
        let result = JwalkEnumerator::new().enumerate(&missing);
        assert!(matches!(result, Err(GatherError::NotFound { .. })));
        assert!(JwalkEnumerator::new().enumerate_journal(&missing).is_err());
    }

    #[test]
    fn test_closure_reader() {
        let reader = |path: &str, _: &str, _: bool| -> Result<AssetFileContents, ReadError> {
            Err(ReadError::failed(path))
        };
        let err = reader.read_asset_file("/x/A.pkg", "/Game/A", true).unwrap_err();
        assert_eq!(err, ReadError::failed("/x/A.pkg"));
        assert!(!NoMarkOfTheWeb.has_mark_of_the_web("/x/A.pkg"));
    }
}
