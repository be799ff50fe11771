use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use assetgather_cache::{AssetCacheStore, BLOCK_HEADER_SIZE, ShardStatus};
use assetgather_core::{AssetData, DependencyData, DiskCachedAssetData, OptionalBool};
use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;

fn sample_entries(count: usize) -> Vec<(String, Arc<DiskCachedAssetData>)> {
    let base = Utc.with_ymd_and_hms(2023, 11, 5, 8, 30, 0).unwrap();
    (0..count)
        .map(|i| {
            let package = format!("/Game/Props/Prop_{i}");
            let mut entry = DiskCachedAssetData::new(
                base + Duration::nanoseconds(i as i64 * 1_000_003),
                Utc::now(),
                if i % 3 == 0 { "umap" } else { "uasset" },
            );
            entry.has_mark_of_the_web = if i % 2 == 0 {
                OptionalBool::False
            } else {
                OptionalBool::Unset
            };
            entry.asset_data_list.push(
                AssetData::new(package.as_str(), format!("Prop_{i}"), "StaticMesh")
                    .with_tag("Triangles", (i * 12).to_string()),
            );
            entry.dependency_data =
                DependencyData::new(package.as_str(), vec!["/Game/Materials/Base".to_string()]);
            (package, Arc::new(entry))
        })
        .collect()
}

fn loaded_by_key(store: &AssetCacheStore) -> BTreeMap<String, DiskCachedAssetData> {
    store
        .load()
        .into_iter()
        .flat_map(|shard| shard.entries)
        .collect()
}

#[test]
fn test_round_trip_across_shards_and_blocks() {
    let temp = TempDir::new().unwrap();
    let store = AssetCacheStore::new(temp.path(), true)
        .with_block_size(97)
        .with_shard_asset_count(16)
        .with_max_shards(4);

    let entries = sample_entries(60);
    let summary = store.save(&entries).unwrap();
    assert_eq!(summary.shards, 4);
    assert_eq!(summary.entries, 60);
    assert_eq!(store.find_shard_files().len(), 4);

    let loaded = loaded_by_key(&store);
    assert_eq!(loaded.len(), entries.len());
    for (key, entry) in &entries {
        let reloaded = &loaded[key];
        assert_eq!(reloaded.modification_time, entry.modification_time);
        assert_eq!(reloaded.extension, entry.extension);
        assert_eq!(reloaded.has_mark_of_the_web, entry.has_mark_of_the_web);
        assert_eq!(reloaded.asset_data_list, entry.asset_data_list);
        assert_eq!(reloaded.dependency_data.dependencies, entry.dependency_data.dependencies);
    }
}

#[test]
fn test_buffered_load_matches_mapped_load() {
    let temp = TempDir::new().unwrap();
    let store = AssetCacheStore::new(temp.path(), false).with_block_size(128);
    store.save(&sample_entries(25)).unwrap();

    let mapped = loaded_by_key(&store.clone().with_memory_map(true));
    let buffered = loaded_by_key(&store.with_memory_map(false));
    assert_eq!(mapped.len(), 25);
    assert_eq!(mapped, buffered);
}

#[test]
fn test_flipped_byte_discards_only_that_shard() {
    let temp = TempDir::new().unwrap();
    let store = AssetCacheStore::new(temp.path(), true)
        .with_block_size(256)
        .with_shard_asset_count(10)
        .with_max_shards(2);
    store.save(&sample_entries(40)).unwrap();

    let shard_zero = store.shard_path(0);
    let mut bytes = fs::read(&shard_zero).unwrap();
    let offset = 8 + BLOCK_HEADER_SIZE + 12;
    bytes[offset] ^= 0x40;
    fs::write(&shard_zero, bytes).unwrap();

    for memory_map in [true, false] {
        let shards = store.clone().with_memory_map(memory_map).load();
        assert_eq!(shards.len(), 2);
        let corrupt = shards.iter().find(|s| s.index == 0).unwrap();
        let intact = shards.iter().find(|s| s.index == 1).unwrap();
        assert_eq!(corrupt.status, ShardStatus::Corrupt);
        assert!(corrupt.entries.is_empty());
        assert_eq!(intact.status, ShardStatus::Loaded);
        assert!(!intact.entries.is_empty());
    }
}

#[test]
fn test_truncated_shard_is_discarded() {
    let temp = TempDir::new().unwrap();
    let store = AssetCacheStore::new(temp.path(), true).with_block_size(64);
    store.save(&sample_entries(10)).unwrap();

    let path = store.shard_path(0);
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let shards = store.load();
    assert_eq!(shards[0].status, ShardStatus::Corrupt);
    assert!(shards[0].entries.is_empty());
}

#[test]
fn test_save_removes_legacy_and_surplus_shards() {
    let temp = TempDir::new().unwrap();
    let store = AssetCacheStore::new(temp.path(), true)
        .with_shard_asset_count(5)
        .with_max_shards(8);

    fs::write(store.legacy_path(), b"old monolithic cache").unwrap();
    store.save(&sample_entries(40)).unwrap();
    assert_eq!(store.find_shard_files().len(), 8);
    assert!(!store.legacy_path().exists());

    // Fewer entries: shards 2..8 from the previous run must go away
    store.save(&sample_entries(8)).unwrap();
    let indices: Vec<usize> = store.find_shard_files().into_iter().map(|(i, _)| i).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(loaded_by_key(&store).len(), 8);
}

#[test]
fn test_modes_use_separate_files() {
    let temp = TempDir::new().unwrap();
    let with_deps = AssetCacheStore::new(temp.path(), true);
    let no_deps = AssetCacheStore::new(temp.path(), false);

    with_deps.save(&sample_entries(3)).unwrap();
    assert_eq!(loaded_by_key(&with_deps).len(), 3);
    assert!(loaded_by_key(&no_deps).is_empty());
}
