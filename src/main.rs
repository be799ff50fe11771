//! assetgather - Incremental asset discovery and metadata gathering.
//!
//! Usage:
//!   assetgather scan <DIR>...                Gather every package under the directories
//!   assetgather wait <MOUNT_DIR> <PATH>...   Gather only the given paths, synchronously
//!   assetgather cache-info                   Inspect the persisted asset cache
//!   assetgather --help                       Show help

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use assetgather_cache::{AssetCacheStore, ShardStatus};
use assetgather_core::paths;
use assetgather_scan::{
    AssetData, AssetFileContents, AssetFileReader, Collaborators, DependencyData,
    GatherDiagnostics, GatherResults, GatherSettings, GatherWarning, Gatherer, ReadError,
};

#[derive(Parser)]
#[command(
    name = "assetgather",
    version,
    about = "Incremental asset discovery and metadata gathering",
    long_about = "assetgather finds package files under mounted content directories, reads \
                  their asset headers and keeps a persistent cache so unchanged files are \
                  never read twice."
)]
struct Cli {
    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Gather every package under one or more content directories
    Scan {
        /// Content directories to mount
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Long package name root for each directory, in order
        #[arg(short, long = "mount-name", default_value = "/Game")]
        mount_names: Vec<String>,

        #[command(flatten)]
        options: GatherOptions,
    },

    /// Mount a directory and gather only the given paths
    Wait {
        /// Content directory to mount
        mount_dir: PathBuf,

        /// Directories or package files to gather
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Long package name root of the mount
        #[arg(short, long = "mount-name", default_value = "/Game")]
        mount_name: String,

        /// Rescan directories that were already scanned
        #[arg(long)]
        force_rescan: bool,

        /// Gather paths even if they are deny-listed
        #[arg(long)]
        ignore_deny_list: bool,

        #[command(flatten)]
        options: GatherOptions,
    },

    /// Report the shards of a persisted asset cache
    CacheInfo {
        /// Directory holding the cache files
        #[arg(short, long, default_value = ".assetgather")]
        cache_dir: PathBuf,

        /// Inspect the cache written without dependency data
        #[arg(long)]
        no_deps: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Args)]
struct GatherOptions {
    /// Directory holding the cache files
    #[arg(short, long, default_value = ".assetgather")]
    cache_dir: PathBuf,

    /// Settings file (JSON); flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Neither read nor write the asset cache
    #[arg(long)]
    no_cache: bool,

    /// Read threads (0 = available parallelism)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Run discovery and reads on background threads
    #[arg(long)]
    background: bool,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Scan {
            dirs,
            mount_names,
            options,
        } => {
            run_scan(&dirs, &mount_names, &options)?;
        }
        Command::Wait {
            mount_dir,
            paths,
            mount_name,
            force_rescan,
            ignore_deny_list,
            options,
        } => {
            run_wait(&mount_dir, &paths, &mount_name, force_rescan, ignore_deny_list, &options)?;
        }
        Command::CacheInfo {
            cache_dir,
            no_deps,
            format,
        } => {
            run_cache_info(&cache_dir, !no_deps, format)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load settings from `--config` if given, then apply the flags.
fn load_settings(options: &GatherOptions) -> Result<GatherSettings> {
    let mut settings = match &options.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .wrap_err_with(|| format!("Invalid config {}", path.display()))?
        }
        None => GatherSettings::new(&options.cache_dir),
    };
    if options.config.is_none() || options.cache_dir != Path::new(".assetgather") {
        settings.cache_dir = options.cache_dir.clone();
    }
    if options.no_cache {
        settings.cache_read_enabled = false;
        settings.cache_write_enabled = false;
    }
    if let Some(threads) = options.threads {
        settings.gather_threads = threads;
        settings.discover_threads = threads;
    }
    settings.async_enabled = options.background;
    settings.validate()?;
    Ok(settings)
}

fn start_gatherer(settings: GatherSettings) -> Result<Gatherer> {
    let gatherer = Gatherer::new(settings, Collaborators::new(Arc::new(JsonHeaderReader)))
        .context("Failed to create gatherer")?;
    // No plugins are loaded by this front end, so missing versions are final
    gatherer.set_startup_complete();
    gatherer.start_async().context("Failed to start background threads")?;
    Ok(gatherer)
}

fn canonical_dir(path: &Path) -> Result<PathBuf> {
    let path = path
        .canonicalize()
        .wrap_err_with(|| format!("Invalid path {}", path.display()))?;
    if !path.is_dir() {
        return Err(eyre!("Not a directory: {}", path.display()));
    }
    Ok(path)
}

/// Mount name for the directory at `index`: the given name, or one derived from the directory.
fn mount_name_for(mount_names: &[String], index: usize, dir: &Path) -> String {
    match mount_names.get(index) {
        Some(name) => name.clone(),
        None => {
            let leaf = dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            format!("/{leaf}")
        }
    }
}

/// Gather every package under the directories.
fn run_scan(dirs: &[PathBuf], mount_names: &[String], options: &GatherOptions) -> Result<()> {
    let settings = load_settings(options)?;
    let cache_enabled = settings.cache_write_enabled;
    let gatherer = start_gatherer(settings)?;

    let mut mounts = Vec::with_capacity(dirs.len());
    for (index, dir) in dirs.iter().enumerate() {
        let dir = canonical_dir(dir)?;
        let name = mount_name_for(mount_names, index, &dir);
        if !name.starts_with('/') || name.split('/').any(paths::contains_invalid_package_chars) {
            return Err(eyre!("Invalid mount name {name}"));
        }
        eprintln!("Mounting {} as {}...", dir.display(), name);
        gatherer.add_mount_point(&dir, &name);
        gatherer.set_is_on_allow_list(&dir, true);
        mounts.push(MountReport {
            local_path: dir,
            long_package_name: name,
        });
    }

    let start = Instant::now();
    gatherer.wait_for_idle(None);
    gatherer.on_initial_search_completed();
    if cache_enabled && !gatherer.is_synchronous() {
        gatherer.save_cache();
    }

    let mut results = GatherResults::default();
    gatherer.get_and_trim_search_results(&mut results);
    let report = GatherReport::new(mounts, results, gatherer.get_diagnostics(), start.elapsed());
    gatherer.stop();
    print_report(&report, options.format)
}

/// Gather only the given paths, through the synchronous scan path.
fn run_wait(
    mount_dir: &Path,
    paths: &[PathBuf],
    mount_name: &str,
    force_rescan: bool,
    ignore_deny_list: bool,
    options: &GatherOptions,
) -> Result<()> {
    let settings = load_settings(options)?;
    let gatherer = start_gatherer(settings)?;
    let mount_dir = canonical_dir(mount_dir)?;
    gatherer.add_mount_point(&mount_dir, mount_name);

    let mut targets = Vec::with_capacity(paths.len());
    for path in paths {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            mount_dir.join(path)
        };
        if !path.starts_with(&mount_dir) {
            return Err(eyre!("{} is not under {}", path.display(), mount_dir.display()));
        }
        targets.push(path);
    }

    let start = Instant::now();
    gatherer.scan_paths_synchronous(&targets, force_rescan, ignore_deny_list);

    let mut results = GatherResults::default();
    gatherer.get_and_trim_search_results(&mut results);
    let mounts = vec![MountReport {
        local_path: mount_dir,
        long_package_name: mount_name.to_string(),
    }];
    let report = GatherReport::new(mounts, results, gatherer.get_diagnostics(), start.elapsed());
    gatherer.stop();
    print_report(&report, options.format)
}

/// Report every shard of the persisted cache.
fn run_cache_info(cache_dir: &Path, gather_dependency_data: bool, format: OutputFormat) -> Result<()> {
    let store = AssetCacheStore::new(cache_dir, gather_dependency_data);
    let shards: Vec<ShardReport> = store
        .load()
        .into_iter()
        .map(|shard| ShardReport {
            index: shard.index,
            size: fs::metadata(&shard.path).map(|m| m.len()).unwrap_or(0),
            status: match shard.status {
                ShardStatus::Loaded => "ok",
                ShardStatus::VersionMismatch => "version mismatch",
                ShardStatus::Corrupt => "corrupt",
            },
            entries: shard.entries.len(),
            path: shard.path,
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&shards)?);
        }
        OutputFormat::Text => {
            if shards.is_empty() {
                println!("No {}_*.bin files in {}", store.base_name(), cache_dir.display());
                return Ok(());
            }
            let total_size: u64 = shards.iter().map(|s| s.size).sum();
            let total_entries: usize = shards.iter().map(|s| s.entries).sum();
            let invalid = shards.iter().filter(|s| s.status != "ok").count();

            println!();
            println!("{}", "─".repeat(60));
            println!(" {} - {}", store.base_name(), format_size(total_size));
            println!(" {} shards, {} entries, {} invalid", shards.len(), total_entries, invalid);
            println!("{}", "─".repeat(60));
            println!();
            for shard in &shards {
                println!(
                    "  {:>5}  {:>10}  {:>8} entries  {}",
                    shard.index,
                    format_size(shard.size),
                    shard.entries,
                    shard.status
                );
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct ShardReport {
    index: usize,
    path: PathBuf,
    size: u64,
    entries: usize,
    status: &'static str,
}

#[derive(Serialize)]
struct MountReport {
    local_path: PathBuf,
    long_package_name: String,
}

#[derive(Serialize)]
struct GatherReport {
    mounts: Vec<MountReport>,
    files_processed: usize,
    cached_files: usize,
    read_files: usize,
    cached_directories: usize,
    listed_directories: usize,
    elapsed_seconds: f64,
    discovery_seconds: f64,
    gather_seconds: f64,
    directories: Vec<String>,
    assets: Vec<AssetData>,
    dependencies: Vec<DependencyData>,
    cooked_without_asset_data: Vec<String>,
    blocked_files: Vec<String>,
    warnings: Vec<GatherWarning>,
}

impl GatherReport {
    fn new(
        mounts: Vec<MountReport>,
        mut results: GatherResults,
        diagnostics: GatherDiagnostics,
        elapsed: Duration,
    ) -> Self {
        results.assets.sort_by(|a, b| {
            a.package_name
                .cmp(&b.package_name)
                .then_with(|| a.asset_name.cmp(&b.asset_name))
        });
        results.paths.sort();
        Self {
            mounts,
            files_processed: diagnostics.num_cached_asset_files + diagnostics.num_uncached_asset_files,
            cached_files: diagnostics.num_cached_asset_files,
            read_files: diagnostics.num_uncached_asset_files,
            cached_directories: diagnostics.num_cached_directories,
            listed_directories: diagnostics.num_uncached_directories,
            elapsed_seconds: elapsed.as_secs_f64(),
            discovery_seconds: diagnostics.discovery_time.as_secs_f64(),
            gather_seconds: diagnostics.gather_time.as_secs_f64(),
            directories: results.paths,
            assets: results.assets,
            dependencies: results.dependencies,
            cooked_without_asset_data: results.cooked_package_names_without_asset_data,
            blocked_files: results.blocked_files,
            warnings: results.warnings,
        }
    }
}

fn print_report(report: &GatherReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            println!();
            println!("{}", "─".repeat(60));
            for mount in &report.mounts {
                println!(" {} -> {}", mount.long_package_name, mount.local_path.display());
            }
            println!(
                " {} files ({} cached, {} read), {} assets",
                report.files_processed,
                report.cached_files,
                report.read_files,
                report.assets.len()
            );
            println!(
                " {} directories ({} from listing cache)",
                report.listed_directories + report.cached_directories,
                report.cached_directories
            );
            println!(" Gathered in {:.2}s", report.elapsed_seconds);
            println!("{}", "─".repeat(60));
            println!();

            let mut by_class: BTreeMap<&str, usize> = BTreeMap::new();
            for asset in &report.assets {
                *by_class.entry(asset.asset_class.as_str()).or_default() += 1;
            }
            for (class, count) in &by_class {
                println!("  {count:>8}  {class}");
            }

            if !report.cooked_without_asset_data.is_empty() {
                println!();
                println!("{} cooked package(s) without asset data", report.cooked_without_asset_data.len());
            }
            if !report.blocked_files.is_empty() {
                println!();
                println!("{} file(s) blocked (mark of the web):", report.blocked_files.len());
                for path in &report.blocked_files {
                    println!("  {path}");
                }
            }
            if !report.warnings.is_empty() {
                println!();
                println!("{} warning(s) during gather", report.warnings.len());
                for warning in report.warnings.iter().take(10) {
                    println!("  {}: {}", warning.path.display(), warning.message);
                }
            }
        }
    }

    Ok(())
}

/// Format bytes as a human-readable size.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Package header stored as JSON inside each package file.
#[derive(Debug, Default, Deserialize)]
struct PackageHeader {
    #[serde(default)]
    assets: Vec<HeaderAsset>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    cooked: bool,
}

#[derive(Debug, Deserialize)]
struct HeaderAsset {
    name: String,
    class: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    editor_only: bool,
}

/// Reads package files whose content is a JSON [`PackageHeader`].
///
/// An empty file is a package with no assets.
struct JsonHeaderReader;

impl AssetFileReader for JsonHeaderReader {
    fn read_asset_file(
        &self,
        local_abs_path: &str,
        long_package_name: &str,
        gather_dependency_data: bool,
    ) -> Result<AssetFileContents, ReadError> {
        let bytes = fs::read(local_abs_path).map_err(|e| ReadError::failed(e.to_string()))?;
        let header: PackageHeader = if bytes.iter().all(u8::is_ascii_whitespace) {
            PackageHeader::default()
        } else {
            serde_json::from_slice(&bytes).map_err(|e| ReadError::failed(format!("invalid package header: {e}")))?
        };

        let assets = header
            .assets
            .into_iter()
            .map(|asset| {
                let mut data = AssetData::new(long_package_name, asset.name, asset.class);
                data.tags = asset.tags;
                data.editor_only_filtered = asset.editor_only;
                data
            })
            .collect();
        let dependencies = if gather_dependency_data {
            header.dependencies
        } else {
            Vec::new()
        };
        Ok(AssetFileContents {
            assets,
            dependency_data: DependencyData::new(long_package_name, dependencies),
            cooked_without_metadata: header.cooked,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_header_reader() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Crate.uasset");
        fs::write(
            &path,
            r#"{"assets":[{"name":"Crate","class":"StaticMesh","tags":{"Triangles":"12"}}],"dependencies":["/Game/Wood"]}"#,
        )
        .unwrap();
        let local = paths::normalize_local_path(&path);

        let contents = JsonHeaderReader.read_asset_file(&local, "/Game/Crate", true).unwrap();
        assert_eq!(contents.assets.len(), 1);
        assert_eq!(contents.assets[0].package_path, "/Game");
        assert_eq!(contents.assets[0].tags["Triangles"], "12");
        assert_eq!(contents.dependency_data.dependencies, vec!["/Game/Wood"]);

        let without_deps = JsonHeaderReader.read_asset_file(&local, "/Game/Crate", false).unwrap();
        assert!(without_deps.dependency_data.dependencies.is_empty());
    }

    #[test]
    fn test_json_header_reader_errors() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("Empty.uasset");
        let broken = temp.path().join("Broken.uasset");
        fs::write(&empty, "\n").unwrap();
        fs::write(&broken, "{not json").unwrap();

        let contents = JsonHeaderReader
            .read_asset_file(&paths::normalize_local_path(&empty), "/Game/Empty", true)
            .unwrap();
        assert!(contents.assets.is_empty());
        assert!(
            JsonHeaderReader
                .read_asset_file(&paths::normalize_local_path(&broken), "/Game/Broken", true)
                .is_err()
        );
    }

    #[test]
    fn test_mount_name_for() {
        let names = vec!["/Game".to_string()];
        assert_eq!(mount_name_for(&names, 0, Path::new("/p/Content")), "/Game");
        assert_eq!(mount_name_for(&names, 1, Path::new("/p/Plugins/Rocks")), "/Rocks");
    }

    #[test]
    fn test_load_settings_rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("config.json");
        fs::write(&config, r#"{"cache_dir": "Cache", "package_extensions": [".uasset"]}"#).unwrap();
        let config_arg = config.to_string_lossy().into_owned();

        let cli = Cli::try_parse_from(["assetgather", "scan", "a", "--config", config_arg.as_str()]).unwrap();
        let Command::Scan { options, .. } = cli.command else {
            panic!("expected scan");
        };
        assert!(load_settings(&options).is_err());

        fs::write(&config, r#"{"cache_dir": "Cache", "package_extensions": ["uasset"]}"#).unwrap();
        let settings = load_settings(&options).unwrap();
        assert!(settings.is_package_extension("uasset"));
    }

    #[test]
    fn test_cli_parses_scan() {
        let cli = Cli::try_parse_from(["assetgather", "scan", "a", "b", "--no-cache", "-f", "json"]).unwrap();
        match cli.command {
            Command::Scan { dirs, mount_names, options } => {
                assert_eq!(dirs.len(), 2);
                assert_eq!(mount_names, vec!["/Game"]);
                assert!(options.no_cache);
                assert!(matches!(options.format, OutputFormat::Json));
            }
            _ => panic!("expected scan"),
        }
    }
}
