//! Versioned cache files.
//!
//! A cache file is an 8 byte little endian version tag followed by
//! checksummed blocks. The block payload starts with a `u64` entry count
//! followed by the MessagePack-encoded entries.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::block::{BlockSource, BufferedBlocks, ChecksumReader, ChecksumWriter, MappedBlocks};
use crate::error::CacheError;

/// Smallest encoded size of one entry, used to reject absurd entry counts.
const MIN_ENTRY_SIZE: u64 = 4;

/// Whether cache files can be memory-mapped on this platform.
pub const fn supports_memory_mapped_files() -> bool {
    cfg!(any(unix, windows))
}

/// Path of the temporary file a cache file is written to before the rename.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut temp = OsString::from(path.as_os_str());
    temp.push(".tmp");
    PathBuf::from(temp)
}

/// Write `entries` to `path` through a temporary file.
///
/// Returns the number of bytes written.
pub fn write_cache_file<T, I>(
    path: &Path,
    version: u64,
    block_size: usize,
    entries: I,
) -> Result<u64, CacheError>
where
    T: Serialize,
    I: ExactSizeIterator<Item = T>,
{
    let temp = temp_path(path);
    let written = write_entries(&temp, version, block_size, entries).inspect_err(|_| {
        let _ = fs::remove_file(&temp);
    })?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        CacheError::io(path, e)
    })?;
    Ok(written)
}

fn write_entries<T, I>(path: &Path, version: u64, block_size: usize, entries: I) -> Result<u64, CacheError>
where
    T: Serialize,
    I: ExactSizeIterator<Item = T>,
{
    let file = File::create(path).map_err(|e| CacheError::io(path, e))?;
    let mut out = BufWriter::new(file);
    out.write_all(&version.to_le_bytes())
        .map_err(|e| CacheError::io(path, e))?;

    let mut writer = ChecksumWriter::with_block_size(out, block_size);
    writer
        .write_all(&(entries.len() as u64).to_le_bytes())
        .map_err(|e| CacheError::io(path, e))?;
    for entry in entries {
        rmp_serde::encode::write(&mut writer, &entry)?;
    }
    let written = writer.bytes_written();
    let out = writer.finish().map_err(|e| CacheError::io(path, e))?;
    let file = out
        .into_inner()
        .map_err(|e| CacheError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| CacheError::io(path, e))?;
    Ok(written + 8)
}

/// Read every entry of the cache file at `path`.
///
/// The file is memory-mapped when `memory_map` is set and the platform
/// supports it, otherwise it is read through a buffered reader.
pub fn read_cache_file<T: DeserializeOwned>(
    path: &Path,
    version: u64,
    memory_map: bool,
) -> Result<Vec<T>, CacheError> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let len = file.metadata().map_err(|e| CacheError::io(path, e))?.len();

    if memory_map && supports_memory_mapped_files() {
        // SAFETY: cache files are only replaced by rename, never modified in place.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => return read_mapped(path, &map, version),
            Err(err) => debug!(path = %path.display(), %err, "Memory mapping failed, using buffered reads"),
        }
    }

    let mut reader = BufReader::new(file);
    let mut tag = [0u8; 8];
    reader
        .read_exact(&mut tag)
        .map_err(|e| CacheError::io(path, e))?;
    check_version(u64::from_le_bytes(tag), version)?;
    let blocks = BufferedBlocks::new(reader, len.saturating_sub(8));
    decode_entries(path, ChecksumReader::new(blocks))
}

fn read_mapped<T: DeserializeOwned>(path: &Path, map: &[u8], version: u64) -> Result<Vec<T>, CacheError> {
    let Some((tag, rest)) = map.split_first_chunk::<8>() else {
        return Err(CacheError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "missing version tag"),
        ));
    };
    check_version(u64::from_le_bytes(*tag), version)?;
    decode_entries(path, ChecksumReader::new(MappedBlocks::new(rest)))
}

fn check_version(found: u64, expected: u64) -> Result<(), CacheError> {
    if found != expected {
        return Err(CacheError::VersionMismatch { expected, found });
    }
    Ok(())
}

fn decode_entries<S: BlockSource, T: DeserializeOwned>(
    path: &Path,
    mut reader: ChecksumReader<S>,
) -> Result<Vec<T>, CacheError> {
    let mut count = [0u8; 8];
    reader
        .read_exact(&mut count)
        .map_err(|e| CacheError::io(path, e))?;
    let count = u64::from_le_bytes(count);
    let remaining = reader.remaining_len();
    if count > remaining / MIN_ENTRY_SIZE {
        return Err(CacheError::CorruptEntryCount { count, remaining });
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(rmp_serde::decode::from_read(&mut reader)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VERSION: u64 = 7;

    #[test]
    fn test_write_then_read_both_paths() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entries.bin");
        let entries: Vec<(String, u32)> = (0..50).map(|i| (format!("/Game/A{i}"), i)).collect();

        write_cache_file(&path, VERSION, 64, entries.iter()).unwrap();
        assert!(!temp_path(&path).exists());

        let mapped: Vec<(String, u32)> = read_cache_file(&path, VERSION, true).unwrap();
        let buffered: Vec<(String, u32)> = read_cache_file(&path, VERSION, false).unwrap();
        assert_eq!(mapped, entries);
        assert_eq!(buffered, entries);
    }

    #[test]
    fn test_version_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entries.bin");
        write_cache_file(&path, VERSION, 64, [1u32, 2, 3].iter()).unwrap();

        let result: Result<Vec<u32>, _> = read_cache_file(&path, VERSION + 1, true);
        assert!(matches!(result, Err(CacheError::VersionMismatch { .. })));
    }

    #[test]
    fn test_absurd_entry_count_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entries.bin");

        let mut bytes = VERSION.to_le_bytes().to_vec();
        let mut writer = ChecksumWriter::new(Vec::new());
        writer.write_all(&u64::MAX.to_le_bytes()).unwrap();
        bytes.extend(writer.finish().unwrap());
        fs::write(&path, bytes).unwrap();

        let result: Result<Vec<u32>, _> = read_cache_file(&path, VERSION, false);
        assert!(matches!(result, Err(CacheError::CorruptEntryCount { .. })));
    }
}
