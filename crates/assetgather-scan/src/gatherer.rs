//! Gatherer engine: turns discovered files into asset records.
//!
//! Each tick pops a batch from [`FilesToSearch`], serves the files whose
//! cache entry is still valid straight from memory, and reads the rest in
//! parallel on a bounded rayon pool. Results accumulate under the results
//! lock until [`Gatherer::get_and_trim_search_results`] drains them.
//!
//! Lock order: tick lock, then results lock, then the discovery locks.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use indexmap::IndexMap;
use indexmap::map::Entry;
use parking_lot::Mutex;
use rayon::prelude::*;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use assetgather_cache::{AssetCacheStore, ShardStatus};
use assetgather_core::{
    AssetData, AssetFileContents, DependencyData, DiskCachedAssetData, GatherError, GatherSettings,
    GatherWarning, GatherableFileType, OptionalBool, ReadError, paths,
};

use crate::discovery::Discovery;
use crate::existence::PathExistence;
use crate::files_to_search::FilesToSearch;
use crate::mount_dir::DenyLists;
use crate::path_data::{GatheredPathData, Priority};
use crate::progress::{GatherProgress, ProgressTracker};
use crate::reader::{
    AssetFileReader, DirectoryEnumerator, JwalkEnumerator, MarkOfTheWebProbe, NoMarkOfTheWeb,
};
use crate::scan_dir::SetPathProperties;

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const PAUSED_SLEEP: Duration = Duration::from_millis(5);
const POLL_DISCOVERY_PERIOD: Duration = Duration::from_millis(1);
const SAVE_WAIT_SLEEP: Duration = Duration::from_millis(1);
/// Delay between closing a cache file and writing over it.
const WAIT_BEFORE_REOPEN: Duration = Duration::from_millis(500);

/// Services the gatherer calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub reader: Arc<dyn AssetFileReader>,
    pub enumerator: Arc<dyn DirectoryEnumerator>,
    pub mark_of_the_web: Arc<dyn MarkOfTheWebProbe>,
}

impl Collaborators {
    /// Use `reader` with the jwalk enumerator and no mark-of-the-web support.
    pub fn new(reader: Arc<dyn AssetFileReader>) -> Self {
        Self {
            reader,
            enumerator: Arc::new(JwalkEnumerator::new()),
            mark_of_the_web: Arc::new(NoMarkOfTheWeb),
        }
    }

    pub fn with_enumerator(mut self, enumerator: Arc<dyn DirectoryEnumerator>) -> Self {
        self.enumerator = enumerator;
        self
    }

    pub fn with_mark_of_the_web(mut self, probe: Arc<dyn MarkOfTheWebProbe>) -> Self {
        self.mark_of_the_web = probe;
        self
    }
}

/// Results drained by [`Gatherer::get_and_trim_search_results`].
///
/// Every drained item is removed from the gatherer; nothing is delivered twice.
#[derive(Debug, Default)]
pub struct GatherResults {
    pub assets: Vec<AssetData>,
    pub dependencies: Vec<DependencyData>,
    /// Long package names of discovered directories.
    pub paths: Vec<String>,
    /// Packages cooked without asset metadata.
    pub cooked_package_names_without_asset_data: Vec<String>,
    /// Local paths of files withheld because they carry the mark of the web.
    pub blocked_files: Vec<String>,
    pub warnings: Vec<GatherWarning>,
}

impl GatherResults {
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
            && self.dependencies.is_empty()
            && self.paths.is_empty()
            && self.cooked_package_names_without_asset_data.is_empty()
            && self.blocked_files.is_empty()
            && self.warnings.is_empty()
    }
}

/// State reported alongside drained results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultContext {
    /// Gather time of each run between idle periods since the last drain.
    pub search_times: Vec<Duration>,
    pub num_files_to_search: usize,
    pub num_paths_to_search: i64,
    /// Discovery still has directories to list.
    pub is_discovering_files: bool,
    /// Work remains, runnable or not.
    pub is_searching: bool,
    /// Work remains that can run without outside action.
    pub able_to_progress: bool,
}

/// Timings and counters across both engines.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GatherDiagnostics {
    pub discovery_time: Duration,
    pub gather_time: Duration,
    pub wall_time: Duration,
    pub num_cached_directories: usize,
    pub num_uncached_directories: usize,
    pub num_cached_asset_files: usize,
    pub num_uncached_asset_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickResult {
    KeepTicking,
    /// Nothing to read until discovery reports more files.
    PollDiscovery,
    /// A waiter's batch finished or a cache save is due.
    Interrupt,
    Idle,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    package_name: String,
    data: Arc<DiskCachedAssetData>,
}

/// State owned by whichever thread holds the tick lock.
#[derive(Debug)]
struct TickState {
    /// Entries loaded from the persisted cache, keyed by lowercase package name.
    disk_cache: IndexMap<String, CacheSlot>,
    /// Entries read or confirmed by this run.
    new_cache: IndexMap<String, CacheSlot>,
    cache_read_enabled: bool,
    cache_write_enabled: bool,
    /// Saves in flight outside the tick lock.
    cache_in_use: u32,
    is_saving_cache: bool,
    last_save_num_uncached: usize,
}

#[derive(Debug)]
struct ResultsState {
    files_to_search: FilesToSearch,
    assets: Vec<AssetData>,
    dependencies: Vec<DependencyData>,
    discovered_paths: Vec<String>,
    cooked_without_metadata: Vec<String>,
    blocked_files: Vec<String>,
    warnings: Vec<GatherWarning>,
    search_times: Vec<Duration>,
    is_idle: bool,
    is_complete: bool,
    discovery_is_complete: bool,
    first_tick_after_idle: bool,
    finished_initial_discovery: bool,
    flushed_retry_files: bool,
    has_loaded_cache: bool,
    save_cache_triggered: bool,
    /// Files a blocked caller still needs read; `None` when nobody waits.
    wait_batch_count: Option<usize>,
    num_paths_to_search: i64,
    last_cache_write_time: Instant,
    current_search_time: Duration,
    cumulative_gather_time: Duration,
    progress: ProgressTracker,
}

impl ResultsState {
    fn new() -> Self {
        Self {
            files_to_search: FilesToSearch::new(),
            assets: Vec::new(),
            dependencies: Vec::new(),
            discovered_paths: Vec::new(),
            cooked_without_metadata: Vec::new(),
            blocked_files: Vec::new(),
            warnings: Vec::new(),
            search_times: Vec::new(),
            is_idle: false,
            is_complete: false,
            discovery_is_complete: false,
            first_tick_after_idle: true,
            finished_initial_discovery: false,
            flushed_retry_files: false,
            has_loaded_cache: false,
            save_cache_triggered: false,
            wait_batch_count: None,
            num_paths_to_search: 0,
            last_cache_write_time: Instant::now(),
            current_search_time: Duration::ZERO,
            cumulative_gather_time: Duration::ZERO,
            progress: ProgressTracker::new(),
        }
    }

    fn shrink(&mut self) {
        self.files_to_search.shrink();
        self.assets.shrink_to_fit();
        self.dependencies.shrink_to_fit();
        self.discovered_paths.shrink_to_fit();
        self.cooked_without_metadata.shrink_to_fit();
        self.blocked_files.shrink_to_fit();
        self.warnings.shrink_to_fit();
        self.search_times.shrink_to_fit();
    }
}

#[derive(Debug, Default)]
enum ReadOutcome {
    #[default]
    Pending,
    Canceled,
    Read(AssetFileContents),
    Failed(ReadError),
}

#[derive(Debug)]
struct ReadContext {
    file: GatheredPathData,
    key: String,
    extension: CompactString,
    outcome: ReadOutcome,
    has_mark_of_the_web: OptionalBool,
}

fn cache_key(long_package_name: &str) -> String {
    long_package_name.to_ascii_lowercase()
}

fn normalize_long_package_name(long_package_name: &str) -> &str {
    match long_package_name.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// State shared with the background thread.
struct Shared {
    settings: Arc<GatherSettings>,
    discovery: Arc<Discovery>,
    reader: Arc<dyn AssetFileReader>,
    mark_of_the_web: Arc<dyn MarkOfTheWebProbe>,
    cache_store: AssetCacheStore,
    tick: Mutex<TickState>,
    results: Mutex<ResultsState>,
    pool: rayon::ThreadPool,
    progress_tx: broadcast::Sender<GatherProgress>,
    gather_start_time: DateTime<Utc>,
    is_stopped: AtomicBool,
    is_paused: AtomicU32,
    is_async: AtomicBool,
    startup_complete: AtomicBool,
    initial_search_completed: AtomicBool,
}

impl Shared {
    fn is_synchronous(&self) -> bool {
        !self.is_async.load(Ordering::SeqCst)
    }

    fn pause(&self) -> GatherPause<'_> {
        let counted = !self.is_synchronous();
        if counted {
            self.is_paused.fetch_add(1, Ordering::SeqCst);
        }
        GatherPause {
            shared: self,
            counted,
        }
    }

    fn run(&self) {
        while !self.is_stopped.load(Ordering::SeqCst) {
            let result = self.inner_tick_loop(false, None);
            if result == TickResult::PollDiscovery {
                std::thread::sleep(POLL_DISCOVERY_PERIOD);
            }

            loop {
                let is_idle = {
                    let results = self.results.lock();
                    let paused = self.is_paused.load(Ordering::SeqCst) > 0;
                    if self.is_stopped.load(Ordering::SeqCst)
                        || results.save_cache_triggered
                        || (!paused && !results.is_idle)
                    {
                        break;
                    }
                    results.is_idle
                };
                std::thread::sleep(if is_idle { IDLE_SLEEP } else { PAUSED_SLEEP });
            }
        }
    }

    /// Tick until idle, interrupted, paused, or past `deadline`, then save the cache if due.
    fn inner_tick_loop(&self, synchronous: bool, deadline: Option<Instant>) -> TickResult {
        // Waiting callers save the cache only when no background thread does
        let contribute_to_cache_save = !synchronous || self.is_synchronous();

        let result;
        let mut to_save = None;
        {
            let mut tick = self.tick.lock();
            let mut tick_start = Some(Instant::now());
            let mut poll_discovery = true;
            let mut last_poll = Instant::now();

            loop {
                let tick_result = self.tick_internal(&mut tick, &mut tick_start, poll_discovery, synchronous);
                if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                    result = TickResult::Interrupt;
                    break;
                }
                if self.is_stopped.load(Ordering::SeqCst)
                    || (!synchronous && self.is_paused.load(Ordering::SeqCst) > 0)
                {
                    result = TickResult::Idle;
                    break;
                }
                if !matches!(tick_result, TickResult::KeepTicking | TickResult::PollDiscovery) {
                    result = tick_result;
                    break;
                }
                let now = Instant::now();
                if poll_discovery {
                    last_poll = now;
                }
                if tick_result == TickResult::KeepTicking {
                    // Discovery is polled periodically rather than every batch
                    poll_discovery = now.duration_since(last_poll) > POLL_DISCOVERY_PERIOD;
                } else if !poll_discovery {
                    poll_discovery = true;
                } else {
                    result = TickResult::PollDiscovery;
                    break;
                }
            }

            if let Some(start) = tick_start.take() {
                self.results.lock().current_search_time += start.elapsed();
            }
            if contribute_to_cache_save {
                to_save = self.try_reserve_save_cache(&mut tick);
            }
        }
        if let Some(entries) = to_save {
            self.save_cache_file(entries);
        }
        result
    }

    fn tick_internal(
        &self,
        tick: &mut TickState,
        tick_start: &mut Option<Instant>,
        poll_discovery: bool,
        synchronous: bool,
    ) -> TickResult {
        let mut files = Vec::new();
        let mut wait_batch_decremented = false;
        let load_cache;
        let mut last_cache_write_time;
        {
            let mut results = self.results.lock();
            if results.first_tick_after_idle {
                results.first_tick_after_idle = false;
                results.last_cache_write_time = Instant::now();
            }
            if poll_discovery {
                self.ingest_discovery_results(&mut results);
            }
            if self.startup_complete.load(Ordering::SeqCst) && !results.flushed_retry_files {
                results.flushed_retry_files = true;
                results.files_to_search.retry_later_retry_files();
            }

            let mut num_to_process = self
                .settings
                .files_per_batch()
                .min(results.files_to_search.num_available());
            if num_to_process == 0 {
                let mut tick_result = TickResult::KeepTicking;
                if results.wait_batch_count.take().is_some() {
                    tick_result = TickResult::Interrupt;
                }
                if results.discovery_is_complete {
                    if tick_result == TickResult::KeepTicking {
                        tick_result = TickResult::Idle;
                    }
                    let was_initial_discovery_finished = results.finished_initial_discovery;
                    self.set_is_idle(&mut results, true, tick_start);
                    if !was_initial_discovery_finished && results.finished_initial_discovery {
                        info!("Triggering cache save on discovery complete");
                        results.save_cache_triggered = true;
                    }
                } else if tick_result == TickResult::KeepTicking {
                    tick_result = TickResult::PollDiscovery;
                }
                return tick_result;
            }

            if let Some(remaining) = results.wait_batch_count {
                if remaining == 0 {
                    // The waiter's files are done and the idle check above has run
                    results.wait_batch_count = None;
                    return TickResult::Interrupt;
                }
                wait_batch_decremented = true;
                num_to_process = num_to_process.min(remaining);
                results.wait_batch_count = Some(remaining - num_to_process);
            }
            results.files_to_search.pop_front(&mut files, num_to_process);

            load_cache = tick.cache_read_enabled && !results.has_loaded_cache;
            last_cache_write_time = results.last_cache_write_time;
        }
        let cache_write_enabled = tick.cache_write_enabled;

        if load_cache {
            self.load_cache(tick);
            let mut results = self.results.lock();
            results.has_loaded_cache = true;
            // No save right after a load
            results.last_cache_write_time = Instant::now();
            last_cache_write_time = results.last_cache_write_time;
        }

        let block_marked = self.settings.block_files_with_mark_of_the_web;
        let mut num_cached = 0;
        let mut num_uncached = 0;
        let mut assets = Vec::new();
        let mut dependencies = Vec::new();
        let mut cooked = Vec::new();
        let mut blocked = Vec::new();
        let mut warnings = Vec::new();
        let mut reads = Vec::new();

        for file in files {
            if file.file_type != GatherableFileType::PackageFile {
                warn!(package = %file.long_package_name, "Unrecognized gathered file type");
                continue;
            }
            let key = cache_key(&file.long_package_name);
            let extension = paths::extension(&file.local_abs_path);

            let Some(mut slot) = self.valid_cache_entry(tick, &key, &file, extension) else {
                reads.push(ReadContext {
                    extension: extension.into(),
                    file,
                    key,
                    outcome: ReadOutcome::Pending,
                    has_mark_of_the_web: OptionalBool::Unset,
                });
                continue;
            };

            if block_marked && slot.data.has_mark_of_the_web.is_true() {
                // The mark may have been removed since the entry was written
                let has_mark = self.mark_of_the_web.has_mark_of_the_web(&file.local_abs_path);
                Arc::make_mut(&mut slot.data).has_mark_of_the_web = has_mark.into();
                if has_mark {
                    self.add_to_cache(tick, key, slot, &file.local_abs_path, &mut warnings);
                    blocked.push(file.local_abs_path);
                    continue;
                }
            }

            if slot.data.last_gathered_time != self.gather_start_time {
                Arc::make_mut(&mut slot.data).last_gathered_time = self.gather_start_time;
            }
            num_cached += 1;
            assets.extend(slot.data.asset_data_list.iter().cloned());
            let mut dependency_data = slot.data.dependency_data.clone();
            dependency_data.has_package_data = true;
            dependency_data.has_dependency_data = self.settings.gather_dependency_data;
            dependencies.push(dependency_data);
            self.add_to_cache(tick, key, slot, &file.local_abs_path, &mut warnings);
        }

        if !reads.is_empty() {
            let min_len = self.settings.single_thread_files_per_batch.max(1);
            self.pool.install(|| {
                reads
                    .par_iter_mut()
                    .with_min_len(min_len)
                    .for_each(|read| self.read_file(read, synchronous));
            });
        }

        let mut canceled = Vec::new();
        let mut retry_later = Vec::new();
        for read in reads {
            let ReadContext {
                file,
                key,
                extension,
                outcome,
                has_mark_of_the_web,
            } = read;
            match outcome {
                ReadOutcome::Pending | ReadOutcome::Canceled => canceled.push(file),
                ReadOutcome::Read(mut contents) => {
                    if contents.dependency_data.package_name.is_empty() {
                        contents.dependency_data.package_name = file.long_package_name.clone();
                    }
                    contents.dependency_data.has_package_data = true;
                    contents.dependency_data.has_dependency_data = self.settings.gather_dependency_data;

                    // Cooked and editor-only-stripped packages are never cached
                    let cache_package = cache_write_enabled
                        && !contents.cooked_without_metadata
                        && !contents.is_editor_only_filtered();
                    if cache_package {
                        let mut entry = DiskCachedAssetData::new(
                            file.package_timestamp,
                            self.gather_start_time,
                            extension,
                        );
                        entry.asset_data_list = contents.assets.clone();
                        entry.dependency_data = contents.dependency_data.clone();
                        entry.has_mark_of_the_web = has_mark_of_the_web;
                        let slot = CacheSlot {
                            package_name: file.long_package_name.clone(),
                            data: Arc::new(entry),
                        };
                        self.add_to_cache(tick, key, slot, &file.local_abs_path, &mut warnings);
                    }

                    if block_marked && has_mark_of_the_web.is_true() {
                        blocked.push(file.local_abs_path);
                    } else {
                        num_uncached += 1;
                        if contents.cooked_without_metadata {
                            cooked.push(file.long_package_name);
                        }
                        assets.append(&mut contents.assets);
                        dependencies.push(contents.dependency_data);
                    }
                }
                ReadOutcome::Failed(err) => {
                    if err.is_custom_version_missing() && !self.startup_complete.load(Ordering::SeqCst) {
                        retry_later.push(file);
                    } else {
                        warn!(path = %file.local_abs_path, %err, "Could not read asset file");
                        warnings.push(GatherWarning::read_failed(&file.local_abs_path, &err));
                    }
                }
            }
        }

        let mut results = self.results.lock();
        results.assets.append(&mut assets);
        results.dependencies.append(&mut dependencies);
        results.cooked_without_metadata.append(&mut cooked);
        results.blocked_files.append(&mut blocked);
        results.warnings.append(&mut warnings);
        results.progress.record(num_cached, num_uncached);
        for file in retry_later {
            results.files_to_search.add_file_for_later_retry(file);
        }
        // Requeued at the front in reverse so they come back in popped order
        for file in canceled.into_iter().rev() {
            results.files_to_search.add_file_again_after_timeout(file);
            if wait_batch_decremented {
                results.wait_batch_count = Some(results.wait_batch_count.unwrap_or(0) + 1);
            }
        }

        let mut tick_result = TickResult::KeepTicking;
        let reads_since_write = results
            .progress
            .uncached_files()
            .saturating_sub(tick.last_save_num_uncached);
        if tick.cache_write_enabled
            && !tick.is_saving_cache
            && last_cache_write_time.elapsed() >= self.settings.min_time_before_cache_write()
            && reads_since_write >= self.settings.min_asset_reads_before_cache_write
        {
            results.save_cache_triggered = true;
            tick_result = TickResult::Interrupt;
        }
        self.send_progress(&results);
        tick_result
    }

    fn read_file(&self, read: &mut ReadContext, synchronous: bool) {
        if !synchronous && self.is_paused.load(Ordering::SeqCst) > 0 {
            read.outcome = ReadOutcome::Canceled;
            return;
        }
        read.outcome = match self.reader.read_asset_file(
            &read.file.local_abs_path,
            &read.file.long_package_name,
            self.settings.gather_dependency_data,
        ) {
            Ok(contents) => {
                if self.settings.block_files_with_mark_of_the_web {
                    read.has_mark_of_the_web = self
                        .mark_of_the_web
                        .has_mark_of_the_web(&read.file.local_abs_path)
                        .into();
                }
                ReadOutcome::Read(contents)
            }
            Err(err) => ReadOutcome::Failed(err),
        };
    }

    /// Cached entry for `file`, if it matches the file on disk.
    fn valid_cache_entry(
        &self,
        tick: &TickState,
        key: &str,
        file: &GatheredPathData,
        extension: &str,
    ) -> Option<CacheSlot> {
        let slot = tick.new_cache.get(key).or_else(|| tick.disk_cache.get(key))?;
        if slot.data.modification_time != file.package_timestamp {
            return None;
        }
        let dependency_name = &slot.data.dependency_data.package_name;
        let name_mismatch = !dependency_name.is_empty() && *dependency_name != file.long_package_name;
        if name_mismatch || !slot.data.is_valid_for(file.package_timestamp, extension) {
            info!(package = %file.long_package_name, "Cached dependency data is invalid, discarding cached data");
            return None;
        }
        if self.settings.block_files_with_mark_of_the_web && !slot.data.has_mark_of_the_web.is_set() {
            return None;
        }
        Some(slot.clone())
    }

    /// Record an entry for the next cache save. The last entry for a package wins.
    fn add_to_cache(
        &self,
        tick: &mut TickState,
        key: String,
        slot: CacheSlot,
        local_abs_path: &str,
        warnings: &mut Vec<GatherWarning>,
    ) {
        match tick.new_cache.entry(key) {
            Entry::Vacant(entry) => {
                entry.insert(slot);
            }
            Entry::Occupied(mut entry) => {
                if Arc::ptr_eq(&entry.get().data, &slot.data) {
                    return;
                }
                let previous = &entry.get().data.extension;
                if !previous.eq_ignore_ascii_case(&slot.data.extension) {
                    warn!(
                        package = %slot.package_name,
                        first = %previous,
                        second = %slot.data.extension,
                        "Multiple files exist with the same package name but different extensions; merge, rename or delete one of them"
                    );
                    warnings.push(GatherWarning::extension_mismatch(
                        local_abs_path,
                        &slot.package_name,
                        previous,
                    ));
                }
                entry.insert(slot);
            }
        }
    }

    fn load_cache(&self, tick: &mut TickState) {
        let start = Instant::now();
        let shards = self.cache_store.load();
        let mut corrupt = 0;
        for shard in shards {
            if shard.status == ShardStatus::Corrupt {
                corrupt += 1;
            }
            tick.disk_cache.reserve(shard.entries.len());
            for (package_name, data) in shard.entries {
                tick.disk_cache.insert(
                    cache_key(&package_name),
                    CacheSlot {
                        package_name,
                        data: Arc::new(data),
                    },
                );
            }
        }
        info!(
            entries = tick.disk_cache.len(),
            corrupt_shards = corrupt,
            "Spent {:.3}s loading caches {}_*.bin",
            start.elapsed().as_secs_f64(),
            self.cache_store.base_name()
        );
    }

    fn try_reserve_save_cache(&self, tick: &mut TickState) -> Option<Vec<(String, Arc<DiskCachedAssetData>)>> {
        if self.is_stopped.load(Ordering::SeqCst) || tick.is_saving_cache {
            return None;
        }
        let (num_uncached, finished_initial_discovery) = {
            let mut results = self.results.lock();
            if !results.save_cache_triggered {
                return None;
            }
            results.save_cache_triggered = false;
            (
                results.progress.uncached_files(),
                results.finished_initial_discovery,
            )
        };
        if !tick.cache_write_enabled {
            return None;
        }

        let entries = self.cache_entries_to_save(tick, finished_initial_discovery);
        tick.is_saving_cache = true;
        tick.last_save_num_uncached = num_uncached;
        tick.cache_in_use += 1;
        Some(entries)
    }

    /// New entries plus loaded entries not replaced this run.
    ///
    /// Loaded entries older than the prune age are dropped, but only once the
    /// first full discovery has finished.
    fn cache_entries_to_save(
        &self,
        tick: &TickState,
        finished_initial_discovery: bool,
    ) -> Vec<(String, Arc<DiskCachedAssetData>)> {
        let prune_age = self.settings.cache_prune_age();
        let mut entries = Vec::with_capacity(tick.new_cache.len().max(tick.disk_cache.len()));
        entries.extend(
            tick.new_cache
                .values()
                .map(|slot| (slot.package_name.clone(), Arc::clone(&slot.data))),
        );
        for (key, slot) in &tick.disk_cache {
            if tick.new_cache.contains_key(key) {
                continue;
            }
            let age = self.gather_start_time - slot.data.last_gathered_time;
            if !finished_initial_discovery || age < prune_age {
                entries.push((slot.package_name.clone(), Arc::clone(&slot.data)));
            }
        }
        entries
    }

    fn save_cache_file(&self, entries: Vec<(String, Arc<DiskCachedAssetData>)>) {
        let last_write = self.results.lock().last_cache_write_time;
        let reopen_at = last_write + WAIT_BEFORE_REOPEN;
        let now = Instant::now();
        if now < reopen_at {
            std::thread::sleep(reopen_at - now);
        }

        if let Err(err) = self.cache_store.save(&entries) {
            warn!(%err, "Failed to save asset cache");
        }
        drop(entries);

        let _pause = self.pause();
        let mut tick = self.tick.lock();
        tick.is_saving_cache = false;
        tick.cache_in_use = tick.cache_in_use.saturating_sub(1);
        self.results.lock().last_cache_write_time = Instant::now();
    }

    fn ingest_discovery_results(&self, results: &mut ResultsState) {
        let batch = self
            .discovery
            .get_and_trim_search_results(&mut results.files_to_search);
        results.discovery_is_complete = batch.is_complete;
        results.discovered_paths.extend(batch.discovered_paths);
        results.num_paths_to_search = batch.num_paths_to_search;
        results.warnings.extend(batch.warnings);
    }

    fn set_is_idle(&self, results: &mut ResultsState, idle: bool, tick_start: &mut Option<Instant>) {
        if results.is_idle == idle {
            return;
        }
        results.is_idle = idle;
        if !idle {
            results.is_complete = false;
            results.discovery_is_complete = false;
            results.first_tick_after_idle = true;
            return;
        }

        if let Some(start) = tick_start.take() {
            results.current_search_time += start.elapsed();
        }
        // Mounts can still be added until host startup completes
        if !results.finished_initial_discovery && self.startup_complete.load(Ordering::SeqCst) {
            results.finished_initial_discovery = true;
            debug!(
                "Initial scan took {:.6} seconds (found {} cached assets, and loaded {})",
                results.current_search_time.as_secs_f64(),
                results.progress.cached_files(),
                results.progress.uncached_files()
            );
        }
        let current = std::mem::take(&mut results.current_search_time);
        results.search_times.push(current);
        results.cumulative_gather_time += current;
        self.send_progress(results);
    }

    fn set_not_idle(&self) {
        let mut results = self.results.lock();
        self.set_is_idle(&mut results, false, &mut None);
    }

    fn send_progress(&self, results: &ResultsState) {
        // No subscribers is fine
        let _ = self.progress_tx.send(results.progress.snapshot(
            results.files_to_search.num(),
            results.num_paths_to_search,
            results.is_idle,
        ));
    }
}

/// Asset gatherer: discovery plus metadata reading with a persistent cache.
///
/// Without [`start_async`](Self::start_async) all work happens on threads
/// that call the wait functions.
pub struct Gatherer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Gatherer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatherer")
            .field("discovery", &self.shared.discovery)
            .field("is_async", &!self.shared.is_synchronous())
            .finish_non_exhaustive()
    }
}

impl Gatherer {
    pub fn new(settings: GatherSettings, collaborators: Collaborators) -> Result<Self, GatherError> {
        let settings = Arc::new(settings);
        let discovery = Arc::new(Discovery::new(
            Arc::clone(&settings),
            collaborators.enumerator,
        )?);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.effective_gather_threads())
            .thread_name(|index| format!("assetgather-gather-{index}"))
            .build()
            .map_err(|err| GatherError::Unsupported {
                message: format!("failed to create gather thread pool: {err}"),
            })?;
        let cache_store = AssetCacheStore::new(&settings.cache_dir, settings.gather_dependency_data);
        let (progress_tx, _) = broadcast::channel(100);

        let shared = Shared {
            tick: Mutex::new(TickState {
                disk_cache: IndexMap::new(),
                new_cache: IndexMap::new(),
                cache_read_enabled: settings.cache_read_enabled,
                cache_write_enabled: settings.cache_write_enabled,
                cache_in_use: 0,
                is_saving_cache: false,
                last_save_num_uncached: 0,
            }),
            results: Mutex::new(ResultsState::new()),
            settings,
            discovery,
            reader: collaborators.reader,
            mark_of_the_web: collaborators.mark_of_the_web,
            cache_store,
            pool,
            progress_tx,
            gather_start_time: Utc::now(),
            is_stopped: AtomicBool::new(false),
            is_paused: AtomicU32::new(0),
            is_async: AtomicBool::new(false),
            startup_complete: AtomicBool::new(false),
            initial_search_completed: AtomicBool::new(false),
        };
        Ok(Self {
            shared: Arc::new(shared),
            thread: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &GatherSettings {
        &self.shared.settings
    }

    pub fn discovery(&self) -> &Discovery {
        &self.shared.discovery
    }

    /// Subscribe to progress snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<GatherProgress> {
        self.shared.progress_tx.subscribe()
    }

    /// Start background discovery and gather threads if async mode is enabled.
    pub fn start_async(&self) -> Result<(), GatherError> {
        if !self.shared.settings.async_enabled {
            return Ok(());
        }
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("assetgather-gather".into())
            .spawn(move || shared.run())
            .map_err(|err| GatherError::Unsupported {
                message: format!("failed to spawn gather thread: {err}"),
            })?;
        self.shared.is_async.store(true, Ordering::SeqCst);
        *thread = Some(handle);
        drop(thread);
        self.shared.discovery.start_async()
    }

    /// Stop both engines and join their threads.
    pub fn stop(&self) {
        self.shared.discovery.stop();
        self.shared.is_stopped.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Gather thread panicked");
            }
        }
        self.shared.is_async.store(false, Ordering::SeqCst);
    }

    pub fn is_synchronous(&self) -> bool {
        self.shared.is_synchronous()
    }

    /// Pause background ticking until the guard is dropped.
    pub fn pause(&self) -> GatherPause<'_> {
        self.shared.pause()
    }

    /// Report that the host finished loading its startup modules.
    ///
    /// Files parked on a missing custom version are retried, and that
    /// failure is terminal from now on.
    pub fn set_startup_complete(&self) {
        self.shared.startup_complete.store(true, Ordering::SeqCst);
        self.shared.set_not_idle();
    }

    /// Report that the first full search is done; persists the directory listing cache.
    pub fn on_initial_search_completed(&self) {
        self.shared.discovery.on_initial_search_completed();
        self.shared
            .initial_search_completed
            .store(true, Ordering::SeqCst);
    }

    pub fn is_initial_search_completed(&self) -> bool {
        self.shared.initial_search_completed.load(Ordering::SeqCst)
    }

    /// Mount a local directory under a long package name root such as `/Game`.
    pub fn add_mount_point(&self, local_path: impl AsRef<Path>, long_package_name: &str) {
        let local_abs_path = paths::normalize_local_path(local_path);
        let existed = self
            .shared
            .discovery
            .add_mount_point(&local_abs_path, normalize_long_package_name(long_package_name));
        if !existed {
            self.shared.set_not_idle();
        }
    }

    pub fn remove_mount_point(&self, local_path: impl AsRef<Path>) {
        self.shared
            .discovery
            .remove_mount_point(&paths::normalize_local_path(local_path));
    }

    pub fn on_directory_created(&self, local_path: impl AsRef<Path>) {
        self.shared
            .discovery
            .on_directory_created(&paths::normalize_local_path(local_path));
        self.shared.set_not_idle();
    }

    pub fn on_files_created<P: AsRef<Path>>(&self, local_paths: &[P]) {
        let local_abs_paths: Vec<String> = local_paths.iter().map(paths::normalize_local_path).collect();
        self.shared.discovery.on_files_created(&local_abs_paths);
        self.shared.set_not_idle();
    }

    /// Move a path ahead of other discovery and gather work.
    pub fn prioritize_search_path(&self, local_path: impl AsRef<Path>) {
        let local_abs_path = paths::normalize_local_path(local_path);
        self.shared.discovery.prioritize_search_path(&local_abs_path);
        let mut results = self.shared.results.lock();
        self.shared.set_is_idle(&mut results, false, &mut None);
        results
            .files_to_search
            .prioritize_path(&local_abs_path, Priority::High);
    }

    pub fn set_directory_properties(&self, local_path: impl AsRef<Path>, properties: &SetPathProperties) {
        let local_abs_path = paths::normalize_local_path(local_path);
        self.shared
            .discovery
            .try_set_directory_properties(&local_abs_path, properties, false);
        self.shared.set_not_idle();
    }

    pub fn set_is_on_allow_list(&self, local_path: impl AsRef<Path>, is_allowed: bool) {
        self.set_directory_properties(
            local_path,
            &SetPathProperties {
                is_on_allow_list: Some(is_allowed),
                ..Default::default()
            },
        );
    }

    pub fn is_on_allow_list(&self, local_path: impl AsRef<Path>) -> bool {
        self.shared
            .discovery
            .is_on_allow_list(&paths::normalize_local_path(local_path))
    }

    pub fn is_on_deny_list(&self, local_path: impl AsRef<Path>) -> bool {
        self.shared
            .discovery
            .is_on_deny_list(&paths::normalize_local_path(local_path))
    }

    pub fn is_monitored(&self, local_path: impl AsRef<Path>) -> bool {
        self.shared
            .discovery
            .is_monitored(&paths::normalize_local_path(local_path))
    }

    /// Replace the deny lists applied to every mount.
    pub fn set_deny_lists(&self, deny_lists: DenyLists) {
        self.shared.discovery.set_deny_lists(deny_lists);
        self.shared.set_not_idle();
    }

    /// Block until the files under `local_path` have been gathered.
    ///
    /// Unlike [`scan_paths_synchronous`](Self::scan_paths_synchronous) this does
    /// not add the path to the allow list.
    pub fn wait_on_path(&self, local_path: impl AsRef<Path>) {
        if self.shared.results.lock().is_idle {
            return;
        }
        let mut queries = [PathExistence::new(paths::normalize_local_path(local_path))];
        self.shared
            .discovery
            .set_properties_and_wait(&mut queries, false, false, false);
        self.wait_on_paths_internal(&queries);
    }

    /// Allow-list the paths, then block until every file under them has been
    /// read from the cache or from disk.
    pub fn scan_paths_synchronous<P: AsRef<Path>>(&self, local_paths: &[P], force_rescan: bool, ignore_deny_list: bool) {
        let mut queries: Vec<PathExistence> = local_paths
            .iter()
            .map(|path| PathExistence::new(paths::normalize_local_path(path)))
            .collect();
        self.shared
            .discovery
            .set_properties_and_wait(&mut queries, true, force_rescan, ignore_deny_list);
        self.shared.set_not_idle();
        self.wait_on_paths_internal(&queries);
    }

    fn wait_on_paths_internal(&self, queries: &[PathExistence]) {
        let _pause = self.shared.pause();
        {
            let _tick = self.shared.tick.lock();
            let mut results = self.shared.results.lock();
            self.shared.ingest_discovery_results(&mut results);
            for query in queries {
                results
                    .files_to_search
                    .prioritize_path(query.local_abs_path(), Priority::Blocking);
            }
            // Zero still runs one tick so the idle state is refreshed
            results.wait_batch_count = Some(results.files_to_search.num_blocking_files());
        }

        loop {
            self.shared.inner_tick_loop(true, None);
            if self.shared.results.lock().wait_batch_count.is_none() {
                break;
            }
        }
    }

    /// Tick on the calling thread, or wait for the background threads, until idle.
    ///
    /// Returns after `timeout` even if work remains.
    pub fn wait_for_idle(&self, timeout: Option<Duration>) {
        if self.shared.results.lock().is_idle {
            return;
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let past_deadline = || deadline.is_some_and(|deadline| Instant::now() > deadline);
        let discovery = &self.shared.discovery;
        if discovery.is_synchronous() {
            discovery.wait_for_idle(deadline);
            if past_deadline() {
                return;
            }
        }

        let _pause = self.shared.pause();
        loop {
            let result = self.shared.inner_tick_loop(true, deadline);
            if past_deadline() || self.shared.results.lock().is_idle {
                break;
            }
            if result == TickResult::PollDiscovery {
                if discovery.is_synchronous() {
                    discovery.wait_for_idle(deadline);
                } else {
                    std::thread::sleep(POLL_DISCOVERY_PERIOD);
                }
            }
        }
    }

    /// Idle with no queued files, including files parked for a retry.
    pub fn is_complete(&self) -> bool {
        let results = self.shared.results.lock();
        results.is_complete || (results.is_idle && results.files_to_search.num() == 0)
    }

    /// Move accumulated results into `out`.
    pub fn get_and_trim_search_results(&self, out: &mut GatherResults) -> ResultContext {
        let mut results = self.shared.results.lock();
        out.assets.append(&mut results.assets);
        out.dependencies.append(&mut results.dependencies);
        out.paths.append(&mut results.discovered_paths);
        out.cooked_package_names_without_asset_data
            .append(&mut results.cooked_without_metadata);
        out.blocked_files.append(&mut results.blocked_files);
        out.warnings.append(&mut results.warnings);

        let num_files_to_search = results.files_to_search.num();
        // Idle may mean waiting on outside events; complete means nothing is left
        let is_complete = results.is_idle && num_files_to_search == 0;
        if is_complete && !results.is_complete {
            results.is_complete = true;
            results.shrink();
        }
        ResultContext {
            search_times: std::mem::take(&mut results.search_times),
            num_files_to_search,
            num_paths_to_search: results.num_paths_to_search,
            is_discovering_files: !results.discovery_is_complete,
            is_searching: !is_complete,
            able_to_progress: !results.is_idle,
        }
    }

    pub fn get_diagnostics(&self) -> GatherDiagnostics {
        let discovery = self.shared.discovery.get_diagnostics();
        let results = self.shared.results.lock();
        GatherDiagnostics {
            discovery_time: discovery.cumulative_discovery_time,
            gather_time: results.cumulative_gather_time,
            wall_time: results.progress.elapsed(),
            num_cached_directories: discovery.num_cached_directories,
            num_uncached_directories: discovery.num_uncached_directories,
            num_cached_asset_files: results.progress.cached_files(),
            num_uncached_asset_files: results.progress.uncached_files(),
        }
    }

    /// Disable the cache and drop every in-memory entry.
    ///
    /// Waits for in-flight saves, which read the entries being dropped.
    pub fn clear_cache(&self) {
        let mut in_use = {
            let mut tick = self.shared.tick.lock();
            let was_enabled = tick.cache_read_enabled || tick.cache_write_enabled;
            tick.cache_read_enabled = false;
            tick.cache_write_enabled = false;
            if !was_enabled {
                return;
            }
            tick.cache_in_use > 0
        };
        // No new save can start once writes are disabled
        while in_use {
            std::thread::sleep(SAVE_WAIT_SLEEP);
            in_use = self.shared.tick.lock().cache_in_use > 0;
        }

        let mut tick = self.shared.tick.lock();
        tick.new_cache = IndexMap::new();
        tick.disk_cache = IndexMap::new();
    }

    /// Save the asset cache on the calling thread, after any save in flight.
    ///
    /// Returns false when cache writes are disabled or the gatherer is stopped.
    pub fn save_cache(&self) -> bool {
        let _pause = self.shared.pause();
        loop {
            let entries = {
                let mut tick = self.shared.tick.lock();
                if !tick.cache_write_enabled || self.shared.is_stopped.load(Ordering::SeqCst) {
                    return false;
                }
                if tick.is_saving_cache {
                    None
                } else {
                    self.shared.results.lock().save_cache_triggered = true;
                    self.shared.try_reserve_save_cache(&mut tick)
                }
            };
            match entries {
                Some(entries) => {
                    self.shared.save_cache_file(entries);
                    return true;
                }
                None => std::thread::sleep(SAVE_WAIT_SLEEP),
            }
        }
    }
}

impl Drop for Gatherer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps background gathering paused while alive.
#[must_use = "gathering resumes as soon as the guard is dropped"]
pub struct GatherPause<'a> {
    shared: &'a Shared,
    counted: bool,
}

impl std::fmt::Debug for GatherPause<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatherPause").field("counted", &self.counted).finish()
    }
}

impl Drop for GatherPause<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.shared.is_paused.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
