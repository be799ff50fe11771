use assetgather_core::paths::{
    self, GatherableFileType, is_parent_path_of, normalize_local_path,
    try_make_child_path_relative_to,
};
use assetgather_core::{
    AssetData, AssetFileContents, DependencyData, DiskCachedAssetData, GatherSettings,
    OptionalBool,
};
use chrono::{Duration, TimeZone, Utc};

#[test]
fn test_cache_entry_reuse_rules() {
    let modified = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let gathered = Utc::now();
    let mut entry = DiskCachedAssetData::new(modified, gathered, "pkg");
    entry.asset_data_list.push(AssetData::new("/Game/A", "A", "Texture"));
    entry.dependency_data = DependencyData::new("/Game/A", vec!["/Game/B".to_string()]);

    // Same timestamp and extension: reusable
    assert!(entry.is_valid_for(modified, "pkg"));

    // Touched file: must be re-read
    assert!(!entry.is_valid_for(modified + Duration::nanoseconds(1), "pkg"));

    // Same package saved with a different extension: must be re-read
    assert!(!entry.is_valid_for(modified, "umap"));

    assert_eq!(entry.has_mark_of_the_web, OptionalBool::Unset);
}

#[test]
fn test_asset_file_contents_from_json() {
    let json = r#"{
        "assets": [
            {
                "package_name": "/Game/Maps/Entry",
                "package_path": "/Game/Maps",
                "asset_name": "Entry",
                "asset_class": "World",
                "tags": {"Biome": "Desert"}
            }
        ],
        "dependency_data": {
            "package_name": "/Game/Maps/Entry",
            "dependencies": ["/Game/Props/Rock"]
        }
    }"#;
    let contents: AssetFileContents = serde_json::from_str(json).unwrap();
    assert_eq!(contents.assets.len(), 1);
    assert_eq!(contents.assets[0].tags.get("Biome").map(String::as_str), Some("Desert"));
    assert_eq!(contents.dependency_data.dependencies, vec!["/Game/Props/Rock"]);
    assert!(!contents.cooked_without_metadata);
    assert!(!contents.dependency_data.has_dependency_data);
}

#[test]
fn test_mount_relative_paths() {
    let mount = normalize_local_path("/project/Content");
    let file = normalize_local_path("/project/Content/Maps/Entry.umap");

    let relative = try_make_child_path_relative_to(&file, &mount).unwrap();
    assert_eq!(relative, "Maps/Entry.umap");
    assert_eq!(paths::base_filename_with_path(relative), "Maps/Entry");

    let package = paths::join_path("/Game", paths::base_filename_with_path(relative));
    assert_eq!(package, "/Game/Maps/Entry");

    assert!(is_parent_path_of(&mount, &file));
    assert!(!is_parent_path_of(&file, &mount));
}

#[test]
fn test_invalid_entries_are_rejected() {
    assert!(paths::path_contains_invalid_chars(
        GatherableFileType::Directory,
        "Maps/Old Stuff"
    ));
    assert!(paths::path_contains_invalid_chars(
        GatherableFileType::Invalid,
        "anything"
    ));
    assert!(!paths::path_contains_invalid_chars(
        GatherableFileType::PackageFile,
        "Maps/Entry.umap"
    ));
}

#[test]
fn test_settings_builder_defaults() {
    let settings = GatherSettings::builder()
        .cache_dir("/tmp/assetgather")
        .deny_list_mount_relative_paths(vec!["Collections".to_string()])
        .build()
        .unwrap();

    assert!(settings.async_enabled);
    assert!(settings.cache_write_enabled);
    assert!(!settings.discovery_cache_enabled);
    assert_eq!(settings.deny_list_mount_relative_paths, vec!["Collections"]);
    assert_eq!(settings.cache_prune_age(), Duration::days(30));
}
