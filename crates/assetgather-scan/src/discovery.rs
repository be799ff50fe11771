//! Discovery engine: finds directories and package files under mounted roots.
//!
//! Discovery owns one [`MountDir`] per mounted root. Each tick collects scan
//! requests from the incomplete parts of the mount trees (priority directories
//! first), lists those directories on a bounded rayon pool outside the tree
//! lock, and feeds the listings back into the trees. Files found on the way
//! are buffered under a separate results lock until the gatherer takes them.
//!
//! Lock order: the tree lock may be held while taking the results lock, never
//! the other way round. Only the holder of the tick token runs a tick.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use assetgather_cache::{DirectoryListing, DirectoryListingStore, ListedFile};
use assetgather_core::{
    GatherError, GatherSettings, GatherWarning, GatherableFileType, WarningKind, paths,
};

use crate::existence::{PathExistence, PathType, stat_path};
use crate::files_to_search::FilesToSearch;
use crate::mount_dir::{DenyLists, MountDir, MountId};
use crate::path_data::{DiscoveredPathData, GatheredPathData};
use crate::reader::{DirEntry, DirectoryEnumerator};
use crate::scan_dir::{Inherited, ScanCounters, ScanDirId, SetPathProperties};
use crate::tick::{Event, TickOwner};

const IDLE_SLEEP: Duration = Duration::from_millis(100);
const PRIORITY_WAIT: Duration = Duration::from_millis(100);
/// Listings of one directory attempted before it is given up as empty.
const MAX_ENUMERATION_ATTEMPTS: u32 = 3;

/// A scan tree node together with the mount that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanDirHandle {
    pub mount: MountId,
    pub id: ScanDirId,
}

#[derive(Debug)]
struct PriorityScanDir {
    dir: ScanDirHandle,
    parent_data: Inherited,
    request_count: u32,
    release_when_complete: bool,
}

#[derive(Debug)]
struct TreeState {
    /// Sorted by local path.
    mounts: Vec<MountDir>,
    next_mount_id: u32,
    priority_scan_dirs: Vec<PriorityScanDir>,
    deny_lists: DenyLists,
}

impl TreeState {
    fn lower_bound(&self, local_abs_path: &str) -> usize {
        self.mounts
            .partition_point(|mount| paths::path_cmp(mount.local_abs_path(), local_abs_path).is_lt())
    }

    fn find_mount(&self, local_abs_path: &str) -> Option<usize> {
        let index = self.lower_bound(local_abs_path);
        self.mounts
            .get(index)
            .filter(|mount| paths::paths_equal(mount.local_abs_path(), local_abs_path))
            .map(|_| index)
    }

    /// The mount whose directory contains `local_abs_path`.
    ///
    /// The mount sorted just before the path is either a parent, or a
    /// sibling subtree whose parent chain may lead to a parent.
    fn find_containing_mount(&self, local_abs_path: &str) -> Option<usize> {
        let index = self.lower_bound(local_abs_path);
        if self
            .mounts
            .get(index)
            .is_some_and(|mount| paths::paths_equal(mount.local_abs_path(), local_abs_path))
        {
            return Some(index);
        }
        let mut previous = index.checked_sub(1);
        while let Some(candidate) = previous {
            let mount = &self.mounts[candidate];
            if paths::is_parent_path_of(mount.local_abs_path(), local_abs_path) {
                return Some(candidate);
            }
            previous = mount.parent_mount().and_then(|parent| self.find_mount(parent));
        }
        None
    }

    fn mount(&self, id: MountId) -> Option<&MountDir> {
        self.mounts.iter().find(|mount| mount.id() == id)
    }

    fn mount_mut(&mut self, id: MountId) -> Option<&mut MountDir> {
        self.mounts.iter_mut().find(|mount| mount.id() == id)
    }

    fn is_valid(&self, handle: ScanDirHandle) -> bool {
        self.mount(handle.mount)
            .is_some_and(|mount| mount.tree().is_valid(handle.id))
    }

    /// Removed nodes count as complete.
    fn is_complete(&self, handle: ScanDirHandle) -> bool {
        self.mount(handle.mount)
            .is_none_or(|mount| mount.tree().is_complete(handle.id))
    }

    fn has_scanned(&self, handle: ScanDirHandle) -> bool {
        self.mount(handle.mount)
            .and_then(|mount| mount.tree().get(handle.id))
            .is_some_and(|node| node.has_scanned())
    }

    fn priority_entry(&mut self, dir: ScanDirHandle) -> &mut PriorityScanDir {
        let index = match self.priority_scan_dirs.iter().position(|entry| entry.dir == dir) {
            Some(index) => index,
            None => {
                self.priority_scan_dirs.push(PriorityScanDir {
                    dir,
                    parent_data: Inherited::default(),
                    request_count: 0,
                    release_when_complete: false,
                });
                self.priority_scan_dirs.len() - 1
            }
        };
        &mut self.priority_scan_dirs[index]
    }

    fn release_priority_request(&mut self, dir: ScanDirHandle) {
        let Some(index) = self.priority_scan_dirs.iter().position(|entry| entry.dir == dir) else {
            return;
        };
        let entry = &mut self.priority_scan_dirs[index];
        entry.request_count = entry.request_count.saturating_sub(1);
        if entry.request_count == 0 {
            self.priority_scan_dirs.swap_remove(index);
        }
    }
}

#[derive(Debug, Default)]
struct DiscoveryResults {
    /// Last idle state recorded for timing.
    is_idle: bool,
    discovered_directories: Vec<String>,
    discovered_files: Vec<(String, Vec<DiscoveredPathData>)>,
    discovered_single_files: Vec<DiscoveredPathData>,
    warnings: Vec<GatherWarning>,
    num_discovered_files: usize,
    cumulative_discovered_files: usize,
    current_discovery_time: Duration,
    cumulative_discovery_time: Duration,
    num_cached_directories: usize,
    num_uncached_directories: usize,
}

/// A directory selected for listing in the current tick.
#[derive(Debug)]
struct DirToScan {
    dir: ScanDirHandle,
    parent_data: Inherited,
    local_abs_path: String,
    long_package_name: String,
    scanned: bool,
    /// Listing failed; the node stays unscanned until a later tick.
    failed: bool,
    sub_dirs: Vec<DiscoveredPathData>,
    files: Vec<DiscoveredPathData>,
}

/// Results drained by [`Discovery::get_and_trim_search_results`].
#[derive(Debug, Default)]
pub struct DiscoveryBatch {
    /// Discovery is idle and has nothing left to scan.
    pub is_complete: bool,
    /// Long package names of discovered directories.
    pub discovered_paths: Vec<String>,
    /// Directories still waiting to be scanned.
    pub num_paths_to_search: i64,
    /// Non-fatal problems met while listing directories.
    pub warnings: Vec<GatherWarning>,
}

/// Discovery timings and counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiscoveryDiagnostics {
    pub cumulative_discovery_time: Duration,
    pub num_cached_directories: usize,
    pub num_uncached_directories: usize,
    pub num_discovered_files: usize,
}

/// Directory discovery engine.
pub struct Discovery {
    settings: Arc<GatherSettings>,
    enumerator: Arc<dyn DirectoryEnumerator>,
    counters: Arc<ScanCounters>,
    tree: Mutex<TreeState>,
    results: Mutex<DiscoveryResults>,
    tick_owner: TickOwner,
    priority_data_updated: Event,
    priority_dirty: AtomicBool,
    is_stopped: AtomicBool,
    is_paused: AtomicU32,
    is_async: AtomicBool,
    journal_failure_logged: AtomicBool,
    enumeration_failures: DashMap<String, u32>,
    listings: DashMap<String, DirectoryListing>,
    listing_cache_loaded: AtomicBool,
    listing_cache_active: AtomicBool,
    pool: rayon::ThreadPool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("is_idle", &self.is_idle())
            .field("directories_to_scan", &self.counters.directories_to_scan())
            .field("is_async", &self.is_async.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn listing_key(local_abs_path: &str) -> String {
    local_abs_path.to_ascii_lowercase()
}

impl Discovery {
    /// Create an engine with no mounts, using the configured deny lists.
    pub fn new(
        settings: Arc<GatherSettings>,
        enumerator: Arc<dyn DirectoryEnumerator>,
    ) -> Result<Self, GatherError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.effective_discover_threads())
            .thread_name(|index| format!("assetgather-discover-{index}"))
            .build()
            .map_err(|err| GatherError::Unsupported {
                message: format!("failed to create discovery thread pool: {err}"),
            })?;
        let deny_lists = DenyLists {
            long_package_names: settings.deny_list_package_paths.clone(),
            mount_relative_paths: settings.deny_list_mount_relative_paths.clone(),
        };
        let listing_cache_active = settings.discovery_cache_enabled;

        Ok(Self {
            settings,
            enumerator,
            counters: Arc::new(ScanCounters::new()),
            tree: Mutex::new(TreeState {
                mounts: Vec::new(),
                next_mount_id: 0,
                priority_scan_dirs: Vec::new(),
                deny_lists,
            }),
            results: Mutex::new(DiscoveryResults::default()),
            tick_owner: TickOwner::new(),
            priority_data_updated: Event::new(true),
            priority_dirty: AtomicBool::new(false),
            is_stopped: AtomicBool::new(false),
            is_paused: AtomicU32::new(0),
            is_async: AtomicBool::new(false),
            journal_failure_logged: AtomicBool::new(false),
            enumeration_failures: DashMap::new(),
            listings: DashMap::new(),
            listing_cache_loaded: AtomicBool::new(false),
            listing_cache_active: AtomicBool::new(listing_cache_active),
            pool,
            thread: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &GatherSettings {
        &self.settings
    }

    /// Spawn the background worker if async mode is enabled.
    pub fn start_async(self: &Arc<Self>) -> Result<(), GatherError> {
        if !self.settings.async_enabled {
            return Ok(());
        }
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        self.is_stopped.store(false, Ordering::SeqCst);
        let discovery = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("assetgather-discovery".into())
            .spawn(move || discovery.run())
            .map_err(|err| GatherError::Unsupported {
                message: format!("failed to spawn discovery thread: {err}"),
            })?;
        self.is_async.store(true, Ordering::SeqCst);
        *thread = Some(handle);
        Ok(())
    }

    /// Stop the background worker and wait for it to exit.
    pub fn stop(&self) {
        self.is_stopped.store(true, Ordering::SeqCst);
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Discovery thread panicked");
            }
        }
        self.is_async.store(false, Ordering::SeqCst);
    }

    /// Whether ticks are driven by callers rather than a background thread.
    pub fn is_synchronous(&self) -> bool {
        !self.is_async.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.counters.is_idle()
    }

    /// Number of directories not yet complete.
    pub fn num_directories_to_scan(&self) -> i64 {
        self.counters.directories_to_scan()
    }

    fn run(&self) {
        while !self.is_stopped.load(Ordering::SeqCst) {
            let mut tick_owner = false;
            while !self.is_stopped.load(Ordering::SeqCst)
                && !self.is_idle()
                && self.is_paused.load(Ordering::SeqCst) == 0
            {
                if !tick_owner {
                    tick_owner = self.tick_owner.try_take();
                }
                if tick_owner {
                    self.tick_internal(true);
                } else {
                    std::thread::sleep(IDLE_SLEEP);
                }
            }
            if tick_owner {
                self.tick_owner.release();
            }

            while !self.is_stopped.load(Ordering::SeqCst)
                && (self.is_paused.load(Ordering::SeqCst) > 0 || self.is_idle())
            {
                std::thread::sleep(IDLE_SLEEP);
            }
        }
    }

    /// Pause the engine until the returned guard is dropped.
    ///
    /// The guard holds the tick token, so no tick runs while it is alive.
    pub fn pause(&self) -> DiscoveryPause<'_> {
        let counted = !self.is_synchronous();
        if counted {
            self.is_paused.fetch_add(1, Ordering::SeqCst);
        }
        self.tick_owner.take_blocking();
        DiscoveryPause {
            discovery: self,
            counted,
        }
    }

    /// Run one full tick on the calling thread if no other thread is ticking.
    ///
    /// Returns whether a tick ran.
    pub fn try_tick(&self) -> bool {
        if !self.tick_owner.try_take() {
            return false;
        }
        self.tick_internal(true);
        self.tick_owner.release();
        true
    }

    fn load_listing_cache_once(&self) {
        if self.listing_cache_loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.listing_cache_active.load(Ordering::SeqCst) || !self.settings.cache_read_enabled {
            return;
        }
        let store = DirectoryListingStore::new(&self.settings.cache_dir);
        let listings = store.load();
        if !listings.is_empty() {
            info!(
                directories = listings.len(),
                path = %store.path().display(),
                "Loaded directory listing cache"
            );
        }
        for (path, listing) in listings {
            self.listings.insert(listing_key(&path), listing);
        }
    }

    fn tick_internal(&self, tick_all: bool) {
        self.load_listing_cache_once();

        let mut tick_start = Some(Instant::now());
        let mut scans: Vec<DirToScan> = Vec::new();
        let mut num_cached_directories = 0usize;
        let mut updated_priority_data = false;
        let mut retry_later: Vec<ScanDirHandle> = Vec::new();

        loop {
            {
                let mut guard = self.tree.lock();
                let tree = &mut *guard;

                if !scans.is_empty() {
                    let num_scanned = self.ingest_scans(tree, &mut scans, &mut retry_later);
                    let mut results = self.results.lock();
                    results.num_cached_directories += num_cached_directories;
                    results.num_uncached_directories +=
                        num_scanned.saturating_sub(num_cached_directories);
                    num_cached_directories = 0;
                }

                let exit_after_priority_update = !tick_all && updated_priority_data;
                if !tree.priority_scan_dirs.is_empty() {
                    let mut requests = Vec::new();
                    Self::update_priority_dirs(tree, &mut requests);
                    if !exit_after_priority_update {
                        // A priority directory and its parent can both request the same scan
                        requests.sort_by_key(|(handle, _)| *handle);
                        requests.dedup_by_key(|(handle, _)| *handle);
                        for (handle, parent_data) in requests {
                            if !retry_later.contains(&handle) {
                                scans.extend(Self::new_scan(tree, handle, parent_data));
                            }
                        }
                    }
                }
                if updated_priority_data {
                    self.priority_data_updated.trigger();
                }
                if exit_after_priority_update {
                    self.record_tick_time(&mut tick_start);
                    return;
                }
                self.priority_dirty.store(false, Ordering::SeqCst);
                updated_priority_data = !scans.is_empty();

                if tick_all && scans.is_empty() {
                    let mut requests = Vec::new();
                    for mount in tree.mounts.iter_mut().filter(|mount| !mount.is_complete()) {
                        let mount_id = mount.id();
                        let mut local = Vec::new();
                        mount.update(&mut local);
                        requests.extend(
                            local
                                .into_iter()
                                .map(|(id, data)| (ScanDirHandle { mount: mount_id, id }, data)),
                        );
                    }
                    for (handle, parent_data) in requests {
                        if !retry_later.contains(&handle) {
                            scans.extend(Self::new_scan(tree, handle, parent_data));
                        }
                    }
                }

                if scans.is_empty() {
                    // Failed listings stay incomplete and are retried by the next tick
                    if !tick_all || !retry_later.is_empty() {
                        self.record_tick_time(&mut tick_start);
                        return;
                    }
                    let remaining = self.counters.directories_to_scan();
                    if remaining != 0 {
                        let first_incomplete = tree.mounts.iter().find_map(|mount| {
                            mount.first_incomplete().map(|id| mount.local_abs_path_of(id))
                        });
                        warn!(
                            remaining,
                            first_incomplete = first_incomplete.as_deref().unwrap_or("<none found>"),
                            "Discovery going idle with directories left to scan"
                        );
                    }
                    self.set_is_idle(true, &mut tick_start);
                    for mount in &mut tree.mounts {
                        mount.shrink();
                    }
                    return;
                }
                self.set_is_idle(false, &mut tick_start);
            }

            // Outside the tree lock: list the selected directories
            num_cached_directories = self.apply_cached_listings(&mut scans);
            if num_cached_directories > 0 && !updated_priority_data {
                // Descend into cached children before touching the disk
                continue;
            }

            let min_batch = self.settings.discover_min_batch_size.max(1);
            self.pool.install(|| {
                scans
                    .par_iter_mut()
                    .with_min_len(min_batch)
                    .for_each(|scan| self.scan_directory(scan));
            });
        }
    }

    fn update_priority_dirs(tree: &mut TreeState, requests: &mut Vec<(ScanDirHandle, Inherited)>) {
        let mut index = 0;
        while index < tree.priority_scan_dirs.len() {
            let dir = tree.priority_scan_dirs[index].dir;
            let parent_data = tree.priority_scan_dirs[index].parent_data;
            if !tree.is_complete(dir) {
                if let Some(mount) = tree.mount_mut(dir.mount) {
                    let mut local = Vec::new();
                    mount.tree_mut().update(dir.id, &mut local, parent_data);
                    requests.extend(local.into_iter().map(|(id, data)| {
                        (
                            ScanDirHandle {
                                mount: dir.mount,
                                id,
                            },
                            data,
                        )
                    }));
                }
            }
            if tree.is_complete(dir) {
                let entry = &mut tree.priority_scan_dirs[index];
                if entry.release_when_complete {
                    entry.release_when_complete = false;
                    entry.request_count = entry.request_count.saturating_sub(1);
                    if entry.request_count == 0 {
                        tree.priority_scan_dirs.swap_remove(index);
                        continue;
                    }
                }
            }
            index += 1;
        }
    }

    fn new_scan(tree: &mut TreeState, dir: ScanDirHandle, parent_data: Inherited) -> Option<DirToScan> {
        let mount = tree.mount_mut(dir.mount)?;
        let scan_tree = mount.tree_mut();
        scan_tree.set_scan_in_flight(dir.id, true);
        scan_tree.set_scan_in_flight_invalidated(dir.id, false);
        Some(DirToScan {
            dir,
            parent_data,
            local_abs_path: mount.local_abs_path_of(dir.id),
            long_package_name: mount.long_package_name_of(dir.id),
            scanned: false,
            failed: false,
            sub_dirs: Vec::new(),
            files: Vec::new(),
        })
    }

    /// Apply finished listings to the trees. Returns the number of listings produced.
    ///
    /// Directories whose listing failed are added to `retry_later`.
    fn ingest_scans(
        &self,
        tree: &mut TreeState,
        scans: &mut Vec<DirToScan>,
        retry_later: &mut Vec<ScanDirHandle>,
    ) -> usize {
        let mut num_scanned = 0;
        for mut scan in scans.drain(..) {
            if scan.scanned {
                num_scanned += 1;
            } else if scan.failed {
                retry_later.push(scan.dir);
            }
            let Some(mount) = tree.mount_mut(scan.dir.mount) else {
                continue;
            };
            let scan_tree = mount.tree_mut();
            let Some(node) = scan_tree.get(scan.dir.id) else {
                continue;
            };
            let invalidated = node.is_scan_in_flight_invalidated();
            if scan.scanned {
                if invalidated {
                    // Settings changed while listing; the node will be listed again
                    scan_tree.set_scan_in_flight_invalidated(scan.dir.id, false);
                } else {
                    scan_tree.set_scan_results(
                        scan.dir.id,
                        scan.parent_data,
                        &mut scan.sub_dirs,
                        &mut scan.files,
                    );
                    if !scan.sub_dirs.is_empty() || !scan.files.is_empty() {
                        self.add_discovered(
                            &scan.local_abs_path,
                            &scan.long_package_name,
                            scan.sub_dirs,
                            scan.files,
                        );
                    }
                }
            }
            scan_tree.set_scan_in_flight(scan.dir.id, false);
        }
        num_scanned
    }

    fn apply_cached_listings(&self, scans: &mut [DirToScan]) -> usize {
        if !self.listing_cache_active.load(Ordering::SeqCst) || self.listings.is_empty() {
            return 0;
        }
        let mut num_cached = 0;
        for scan in scans.iter_mut().filter(|scan| !scan.scanned) {
            let key = listing_key(&scan.local_abs_path);
            let Some(listing) = self.listings.get(&key) else {
                continue;
            };
            let is_valid = stat_path(&scan.local_abs_path).is_some_and(|stat| {
                stat.is_directory && stat.modification_time == listing.modification_time
            });
            if !is_valid {
                drop(listing);
                self.listings.remove(&key);
                continue;
            }
            for name in &listing.sub_dirs {
                self.push_entry(scan, name, true, listing.modification_time);
            }
            for file in &listing.files {
                self.push_entry(scan, &file.name, false, file.modification_time);
            }
            scan.scanned = true;
            num_cached += 1;
        }
        num_cached
    }

    fn scan_directory(&self, scan: &mut DirToScan) {
        if scan.scanned || self.priority_dirty.load(Ordering::Relaxed) {
            return;
        }

        let record_listing = self.listing_cache_active.load(Ordering::Relaxed);
        let dir_modification_time = if record_listing {
            stat_path(&scan.local_abs_path).map(|stat| stat.modification_time)
        } else {
            None
        };

        match self.enumerate(&scan.local_abs_path) {
            Ok(entries) => {
                if !self.enumeration_failures.is_empty() {
                    self.enumeration_failures.remove(&listing_key(&scan.local_abs_path));
                }
                for entry in &entries {
                    self.push_entry(scan, &entry.name, entry.is_directory, entry.modification_time);
                }
                if let Some(modification_time) = dir_modification_time {
                    let listing = DirectoryListing {
                        modification_time,
                        sub_dirs: entries
                            .iter()
                            .filter(|entry| entry.is_directory)
                            .map(|entry| entry.name.clone())
                            .collect(),
                        files: entries
                            .iter()
                            .filter(|entry| !entry.is_directory)
                            .map(|entry| ListedFile {
                                name: entry.name.clone(),
                                modification_time: entry.modification_time,
                            })
                            .collect(),
                    };
                    self.listings.insert(listing_key(&scan.local_abs_path), listing);
                }
            }
            Err(err) => {
                let key = listing_key(&scan.local_abs_path);
                let attempts = {
                    let mut attempts = self.enumeration_failures.entry(key.clone()).or_insert(0);
                    *attempts += 1;
                    *attempts
                };
                if attempts < MAX_ENUMERATION_ATTEMPTS {
                    debug!(path = %scan.local_abs_path, attempts, %err, "Failed to enumerate directory, will retry");
                    scan.failed = true;
                    return;
                }
                self.enumeration_failures.remove(&key);
                warn!(path = %scan.local_abs_path, attempts, %err, "Failed to enumerate directory, giving up");
                self.results.lock().warnings.push(GatherWarning::new(
                    &scan.local_abs_path,
                    err.to_string(),
                    WarningKind::EnumerationFailed,
                ));
            }
        }
        scan.scanned = true;
    }

    /// List a directory through the change journal when possible, else directly.
    fn enumerate(&self, dir: &str) -> Result<Vec<DirEntry>, GatherError> {
        if self.enumerator.journal_is_available(dir) {
            match self.enumerator.enumerate_journal(dir) {
                Ok(entries) => return Ok(entries),
                Err(err) => {
                    if !self.journal_failure_logged.swap(true, Ordering::Relaxed) {
                        warn!(path = %dir, %err, "Change journal listing failed, falling back to directory reads");
                    }
                }
            }
        }
        self.enumerator.enumerate(dir)
    }

    fn push_entry(&self, scan: &mut DirToScan, name: &str, is_directory: bool, modification_time: DateTime<Utc>) {
        if is_directory {
            // '.' is not valid in a package path, so directories with extensions are skipped too
            if paths::contains_invalid_package_chars(name) {
                return;
            }
            scan.sub_dirs.push(DiscoveredPathData::new(
                &scan.local_abs_path,
                &scan.long_package_name,
                name,
                modification_time,
                GatherableFileType::Directory,
            ));
            return;
        }
        let file_type = self.file_type(name);
        if file_type == GatherableFileType::Invalid
            || paths::path_contains_invalid_chars(file_type, name)
        {
            return;
        }
        scan.files.push(DiscoveredPathData::new(
            &scan.local_abs_path,
            &scan.long_package_name,
            name,
            modification_time,
            file_type,
        ));
    }

    /// Classify a file by its extension.
    pub fn file_type(&self, file_path: &str) -> GatherableFileType {
        if self.settings.is_package_extension(paths::extension(file_path)) {
            GatherableFileType::PackageFile
        } else {
            GatherableFileType::Invalid
        }
    }

    /// Record an idle transition. The caller holds the tree lock.
    fn set_is_idle(&self, idle: bool, tick_start: &mut Option<Instant>) {
        let mut results = self.results.lock();
        self.counters.set_idle(idle);
        if results.is_idle == idle {
            return;
        }
        results.is_idle = idle;
        if !idle {
            results.num_discovered_files = 0;
            return;
        }
        if let Some(start) = tick_start.take() {
            results.current_discovery_time += start.elapsed();
        }
        let current = std::mem::take(&mut results.current_discovery_time);
        results.cumulative_discovery_time += current;
        results.cumulative_discovered_files += results.num_discovered_files;
        debug!(
            "Discovery took {:.4} seconds to add {} files, Cumulative={:.4} seconds to add {}.",
            current.as_secs_f64(),
            results.num_discovered_files,
            results.cumulative_discovery_time.as_secs_f64(),
            results.cumulative_discovered_files
        );
        results.discovered_directories.shrink_to_fit();
        results.discovered_files.shrink_to_fit();
        results.discovered_single_files.shrink_to_fit();
    }

    fn record_tick_time(&self, tick_start: &mut Option<Instant>) {
        if let Some(start) = tick_start.take() {
            self.results.lock().current_discovery_time += start.elapsed();
        }
    }

    fn add_discovered(
        &self,
        dir_local_abs_path: &str,
        dir_long_package_name: &str,
        sub_dirs: Vec<DiscoveredPathData>,
        files: Vec<DiscoveredPathData>,
    ) {
        let mut results = self.results.lock();
        if self.settings.ignore_empty_directories {
            // Only directories with content are reported
            if !files.is_empty() {
                results
                    .discovered_directories
                    .push(dir_long_package_name.to_string());
            }
        } else {
            results
                .discovered_directories
                .extend(sub_dirs.into_iter().map(|sub_dir| sub_dir.long_package_name));
        }
        if !files.is_empty() {
            results.num_discovered_files += files.len();
            results
                .discovered_files
                .push((dir_local_abs_path.to_string(), files));
        }
    }

    fn add_discovered_file(&self, file: DiscoveredPathData) {
        let mut results = self.results.lock();
        results.discovered_single_files.push(file);
        results.num_discovered_files += 1;
    }

    /// Move discovered files into `files_to_search` and return everything else.
    ///
    /// Single files reported by blocking calls are queued at blocking priority.
    pub fn get_and_trim_search_results(&self, files_to_search: &mut FilesToSearch) -> DiscoveryBatch {
        let mut results = self.results.lock();
        let discovered_paths = std::mem::take(&mut results.discovered_directories);
        for (dir, files) in results.discovered_files.drain(..) {
            files_to_search.add_directory(&dir, files.into_iter().map(GatheredPathData::from).collect());
        }
        for file in results.discovered_single_files.drain(..) {
            files_to_search.add_priority_file(file.into());
        }

        let num_paths_to_search = self.counters.directories_to_scan();
        let is_complete = self.counters.is_idle();
        if is_complete && num_paths_to_search != 0 {
            warn!(
                num_paths_to_search,
                "Discovery reports idle while directories remain to be searched"
            );
        }
        DiscoveryBatch {
            is_complete,
            discovered_paths,
            num_paths_to_search,
            warnings: std::mem::take(&mut results.warnings),
        }
    }

    pub fn get_diagnostics(&self) -> DiscoveryDiagnostics {
        let results = self.results.lock();
        DiscoveryDiagnostics {
            cumulative_discovery_time: results.cumulative_discovery_time,
            num_cached_directories: results.num_cached_directories,
            num_uncached_directories: results.num_uncached_directories,
            num_discovered_files: results.cumulative_discovered_files + results.num_discovered_files,
        }
    }

    /// Tick on the calling thread, or wait for the background thread, until idle.
    ///
    /// Returns early once `deadline` passes.
    pub fn wait_for_idle(&self, deadline: Option<Instant>) {
        if self.is_idle() {
            return;
        }
        let mut tick_owner = false;
        while !self.is_idle() {
            if !tick_owner {
                tick_owner = self.tick_owner.try_take();
            }
            if tick_owner {
                self.tick_internal(true);
            } else {
                let sleep = match deadline {
                    Some(deadline) => IDLE_SLEEP.min(deadline.saturating_duration_since(Instant::now())),
                    None => IDLE_SLEEP,
                };
                if !sleep.is_zero() {
                    std::thread::sleep(sleep);
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() > deadline) {
                break;
            }
        }
        if tick_owner {
            self.tick_owner.release();
        }
    }

    /// Apply allow-list, rescan and deny-list overrides to each path and
    /// block until the directories among them have been scanned.
    ///
    /// Files among the paths are reported directly at blocking priority.
    pub fn set_properties_and_wait(
        &self,
        query_paths: &mut [PathExistence],
        add_to_allow_list: bool,
        force_rescan: bool,
        ignore_deny_list: bool,
    ) {
        struct WaitTarget {
            dir: ScanDirHandle,
            scan_entire_tree: bool,
        }

        let properties = SetPathProperties {
            is_on_allow_list: add_to_allow_list.then_some(true),
            matches_deny_list: None,
            ignore_deny_list: ignore_deny_list.then_some(true),
            has_scanned: force_rescan.then_some(false),
        };

        let mut dirs_to_scan: Vec<WaitTarget> = Vec::new();
        let mut tick_owner = false;
        {
            let mut guard = self.tree.lock();
            let tree = &mut *guard;
            for query in query_paths.iter_mut() {
                // Existence data is loaded only after the cheap early exits below
                let Some(index) = tree.find_containing_mount(query.local_abs_path()) else {
                    info!(
                        path = %query.local_abs_path(),
                        "Path is not in a mounted directory; request ignored"
                    );
                    continue;
                };
                let mount = &mut tree.mounts[index];
                let outcome = mount.try_set_directory_properties(query, &properties);
                if outcome.made_changes {
                    self.set_is_idle(false, &mut None);
                }

                let Some((scan_dir, parent_data)) = outcome.controlling else {
                    debug!(path = %query.local_abs_path(), "Path is not monitored; request ignored");
                    continue;
                };
                let monitor_data = mount.tree().monitor_data(scan_dir, "", parent_data);
                let is_allowed = monitor_data.is_on_allow_list || add_to_allow_list;
                let is_denied = monitor_data.is_on_deny_list() && !ignore_deny_list;
                if !is_allowed || is_denied {
                    debug!(path = %query.local_abs_path(), "Path is not monitored; request ignored");
                    continue;
                }

                let is_complete = mount.tree().is_complete(scan_dir);
                if !force_rescan && is_complete && !query.has_existence_data() {
                    // Settings were already applied and the scan finished; nothing new to find
                    continue;
                }

                let rel_path_from_control_dir = outcome.rel_path;
                let path_type = query.path_type();
                if path_type == PathType::MissingParentDir {
                    debug!(path = %query.local_abs_path(), "Path does not exist; request ignored");
                    continue;
                }

                let handle = ScanDirHandle {
                    mount: mount.id(),
                    id: scan_dir,
                };
                if matches!(path_type, PathType::Directory | PathType::MissingButDirExists) {
                    if is_complete {
                        continue;
                    }
                    // A non-empty remainder means only an ancestor exists in the tree,
                    // which happens for directories that are already complete
                    let found_ancestor = match path_type {
                        PathType::Directory => !rel_path_from_control_dir.is_empty(),
                        _ => rel_path_from_control_dir.contains(['/', '\\']),
                    };
                    if found_ancestor {
                        continue;
                    }
                    dirs_to_scan.push(WaitTarget {
                        dir: handle,
                        scan_entire_tree: path_type == PathType::Directory,
                    });
                    let entry = tree.priority_entry(handle);
                    entry.request_count += 1;
                    entry.parent_data = parent_data;
                } else {
                    let has_scanned = mount.tree().get(scan_dir).is_some_and(|node| node.has_scanned());
                    let already_scanned = has_scanned && monitor_data.is_monitored();
                    if already_scanned && !force_rescan {
                        continue;
                    }
                    let leaf = paths::clean_filename(&rel_path_from_control_dir);
                    let file_type = self.file_type(leaf);
                    if file_type == GatherableFileType::Invalid
                        || paths::path_contains_invalid_chars(file_type, &rel_path_from_control_dir)
                    {
                        continue;
                    }
                    let long_package_name = paths::join_path(
                        &mount.long_package_name_of(scan_dir),
                        paths::base_filename_with_path(&rel_path_from_control_dir),
                    );
                    let package_timestamp = query.modification_time().unwrap_or_default();
                    self.add_discovered_file(DiscoveredPathData {
                        local_abs_path: query.local_abs_path().to_string(),
                        long_package_name,
                        rel_path: leaf.to_string(),
                        package_timestamp,
                        file_type,
                    });
                    if paths::is_path_leaf(&rel_path_from_control_dir) && !has_scanned {
                        mount
                            .tree_mut()
                            .mark_file_already_scanned(scan_dir, &rel_path_from_control_dir);
                        self.set_is_idle(false, &mut None);
                    }
                }
            }

            if !dirs_to_scan.is_empty() {
                self.priority_dirty.store(true, Ordering::SeqCst);
                self.priority_data_updated.reset();
                tick_owner = self.tick_owner.try_take();
            }
        }

        while !dirs_to_scan.is_empty() {
            if tick_owner {
                self.tick_internal(false);
            } else {
                self.priority_data_updated.wait(PRIORITY_WAIT);
            }

            let mut guard = self.tree.lock();
            let tree = &mut *guard;
            let mut index = 0;
            while index < dirs_to_scan.len() {
                let target = &dirs_to_scan[index];
                let done = !tree.is_valid(target.dir)
                    || tree.is_complete(target.dir)
                    || (!target.scan_entire_tree && tree.has_scanned(target.dir));
                let stuck = !done && self.is_idle();
                if stuck {
                    warn!("Discovery went idle while a requested directory is incomplete");
                }
                if done || stuck {
                    let dir = target.dir;
                    dirs_to_scan.swap_remove(index);
                    tree.release_priority_request(dir);
                } else {
                    index += 1;
                }
            }

            if dirs_to_scan.is_empty() {
                if tick_owner {
                    self.tick_owner.release();
                    tick_owner = false;
                }
            } else {
                self.priority_data_updated.reset();
                if !tick_owner {
                    tick_owner = self.tick_owner.try_take();
                }
            }
        }
    }

    /// Ask discovery to scan the directory controlling `local_abs_path` first.
    pub fn prioritize_search_path(&self, local_abs_path: &str) {
        let mut guard = self.tree.lock();
        let tree = &mut *guard;
        self.set_is_idle(false, &mut None);
        let Some(index) = tree.find_containing_mount(local_abs_path) else {
            warn!(path = %local_abs_path, "Prioritize called on an unmounted path; request ignored");
            return;
        };
        let mount = &mut tree.mounts[index];
        let mut query = PathExistence::new(local_abs_path);
        let outcome = mount.try_set_directory_properties(&mut query, &SetPathProperties::default());
        let Some((scan_dir, parent_data)) = outcome.controlling else {
            return;
        };
        if !mount.tree().is_valid(scan_dir) || mount.tree().is_complete(scan_dir) {
            return;
        }
        let handle = ScanDirHandle {
            mount: mount.id(),
            id: scan_dir,
        };
        let entry = tree.priority_entry(handle);
        if !entry.release_when_complete {
            entry.release_when_complete = true;
            entry.request_count += 1;
        }
        entry.parent_data = parent_data;
    }

    /// Apply directory properties to a path.
    ///
    /// `confirmed_exists` skips the existence check for a path known to be a directory.
    pub fn try_set_directory_properties(
        &self,
        local_abs_path: &str,
        properties: &SetPathProperties,
        confirmed_exists: bool,
    ) {
        if !properties.is_set() {
            return;
        }
        let mut query = if confirmed_exists {
            PathExistence::confirmed_directory(local_abs_path)
        } else {
            PathExistence::new(local_abs_path)
        };
        let mut tree = self.tree.lock();
        let Some(index) = tree.find_containing_mount(local_abs_path) else {
            warn!(path = %local_abs_path, "Directory properties set on an unmounted path; request ignored");
            return;
        };
        let outcome = tree.mounts[index].try_set_directory_properties(&mut query, properties);
        if outcome.made_changes {
            self.set_is_idle(false, &mut None);
        }
    }

    fn monitor_data(&self, local_abs_path: &str) -> Option<Inherited> {
        let tree = self.tree.lock();
        let index = tree.find_containing_mount(local_abs_path)?;
        Some(tree.mounts[index].monitor_data(local_abs_path))
    }

    pub fn is_on_allow_list(&self, local_abs_path: &str) -> bool {
        self.monitor_data(local_abs_path)
            .is_some_and(|data| data.is_on_allow_list)
    }

    pub fn is_on_deny_list(&self, local_abs_path: &str) -> bool {
        self.monitor_data(local_abs_path)
            .is_some_and(|data| data.is_on_deny_list())
    }

    pub fn is_monitored(&self, local_abs_path: &str) -> bool {
        self.monitor_data(local_abs_path)
            .is_some_and(|data| data.is_monitored())
    }

    /// Mount a local directory under a long package name root.
    ///
    /// Returns `true` if the directory was already mounted.
    pub fn add_mount_point(&self, local_abs_path: &str, long_package_name: &str) -> bool {
        let mut guard = self.tree.lock();
        let tree = &mut *guard;
        if tree.find_mount(local_abs_path).is_some() {
            return true;
        }

        let mut parent: Option<String> = None;
        let mut children = Vec::new();
        for mount in &tree.mounts {
            if paths::is_parent_path_of(mount.local_abs_path(), local_abs_path) {
                // Later mounts in sorted order are more direct parents
                parent = Some(mount.local_abs_path().to_string());
            } else if paths::is_parent_path_of(local_abs_path, mount.local_abs_path()) {
                // Skip grandchildren that already sit under a mount between them and us
                let is_direct_child = match (mount.parent_mount(), parent.as_deref()) {
                    (None, _) => true,
                    (Some(existing), Some(parent)) => paths::paths_equal(existing, parent),
                    (Some(_), None) => false,
                };
                if is_direct_child {
                    children.push(mount.local_abs_path().to_string());
                }
            }
        }
        self.set_is_idle(false, &mut None);

        let id = MountId::new(tree.next_mount_id);
        tree.next_mount_id += 1;
        let mut mount = MountDir::new(
            id,
            local_abs_path,
            long_package_name,
            Arc::clone(&self.counters),
            &tree.deny_lists,
        );
        mount.set_parent_mount(parent.clone());
        let index = tree.lower_bound(local_abs_path);
        tree.mounts.insert(index, mount);

        if let Some(parent_index) = parent.as_deref().and_then(|parent| tree.find_mount(parent)) {
            let children_started: Vec<bool> = children
                .iter()
                .map(|child| {
                    tree.find_mount(child)
                        .is_some_and(|index| tree.mounts[index].tree().has_started_scanning())
                })
                .collect();
            let parent_mount = &mut tree.mounts[parent_index];
            parent_mount.add_child_mount(local_abs_path, &tree.deny_lists);
            for (child, started) in children.iter().zip(children_started) {
                parent_mount.remove_child_mount(child, started, &tree.deny_lists);
            }
        }
        for child in &children {
            if let Some(child_index) = tree.find_mount(child) {
                tree.mounts[child_index].set_parent_mount(Some(local_abs_path.to_string()));
            }
            if let Some(index) = tree.find_mount(local_abs_path) {
                tree.mounts[index].add_child_mount(child, &tree.deny_lists);
            }
        }
        debug!(path = %local_abs_path, package = %long_package_name, "Mount point added");
        false
    }

    /// Unmount a directory, handing its nested mounts to its parent mount.
    pub fn remove_mount_point(&self, local_abs_path: &str) {
        let mut guard = self.tree.lock();
        let tree = &mut *guard;
        self.set_is_idle(false, &mut None);
        let Some(index) = tree.find_mount(local_abs_path) else {
            return;
        };
        let mount = tree.mounts.remove(index);
        let children = mount.child_mounts();
        let parent = mount.parent_mount().map(str::to_string);

        match parent.as_deref().and_then(|parent| tree.find_mount(parent)) {
            Some(parent_index) => {
                for child in &children {
                    tree.mounts[parent_index].add_child_mount(child, &tree.deny_lists);
                    if let Some(child_index) = tree.find_mount(child) {
                        tree.mounts[child_index].set_parent_mount(parent.clone());
                    }
                }
                let started = mount.tree().has_started_scanning();
                if let Some(parent_index) = parent.as_deref().and_then(|parent| tree.find_mount(parent)) {
                    tree.mounts[parent_index].remove_child_mount(
                        mount.local_abs_path(),
                        started,
                        &tree.deny_lists,
                    );
                }
            }
            None => {
                for child in &children {
                    if let Some(child_index) = tree.find_mount(child) {
                        tree.mounts[child_index].set_parent_mount(None);
                    }
                }
            }
        }
        let removed_id = mount.id();
        tree.priority_scan_dirs
            .retain(|entry| entry.dir.mount != removed_id);
        debug!(path = %local_abs_path, "Mount point removed");
    }

    /// Replace the global deny lists and reapply them to every mount.
    pub fn set_deny_lists(&self, deny_lists: DenyLists) {
        let mut guard = self.tree.lock();
        let tree = &mut *guard;
        tree.deny_lists = deny_lists;
        for mount in &mut tree.mounts {
            mount.update_deny_list(&tree.deny_lists);
        }
        self.set_is_idle(false, &mut None);
    }

    /// Report a directory created after it may have been scanned.
    ///
    /// The directory is reported but not scanned; its contents arrive through
    /// their own notifications.
    pub fn on_directory_created(&self, local_abs_path: &str) {
        let tree = self.tree.lock();
        let Some(index) = tree.find_containing_mount(local_abs_path) else {
            return;
        };
        let mount = &tree.mounts[index];
        if !mount.is_monitored(local_abs_path) {
            return;
        }
        let Some(mount_rel_path) =
            paths::try_make_child_path_relative_to(local_abs_path, mount.local_abs_path())
        else {
            return;
        };
        let long_package_name = paths::join_path(mount.long_package_name(), mount_rel_path);
        if paths::contains_invalid_package_chars(&long_package_name) {
            return;
        }
        let dir_data = DiscoveredPathData {
            local_abs_path: local_abs_path.to_string(),
            long_package_name: long_package_name.clone(),
            rel_path: paths::clean_filename(mount_rel_path).to_string(),
            package_timestamp: Utc::now(),
            file_type: GatherableFileType::Directory,
        };
        self.set_is_idle(false, &mut None);
        self.add_discovered(local_abs_path, &long_package_name, vec![dir_data], Vec::new());
    }

    /// Report files created after their directories may have been scanned.
    pub fn on_files_created(&self, local_abs_paths: &[String]) {
        let mut guard = self.tree.lock();
        self.set_is_idle(false, &mut None);
        for local_abs_path in local_abs_paths {
            self.on_file_created(&mut guard, local_abs_path);
        }
    }

    fn on_file_created(&self, tree: &mut TreeState, local_abs_path: &str) {
        let Some(index) = tree.find_containing_mount(local_abs_path) else {
            return;
        };
        // Create/delete races can report files that are gone again
        let Some(stat) = stat_path(local_abs_path).filter(|stat| !stat.is_directory) else {
            return;
        };
        let mount = &mut tree.mounts[index];
        let Some(controlling) = mount.controlling_dir(local_abs_path, false) else {
            return;
        };
        if !controlling.accumulated.is_monitored() {
            return;
        }

        let file_rel_path = controlling.rel_path;
        let leaf = paths::clean_filename(&file_rel_path);
        let file_type = self.file_type(leaf);
        if file_type == GatherableFileType::Invalid
            || paths::path_contains_invalid_chars(file_type, &file_rel_path)
        {
            return;
        }
        let long_package_name = paths::join_path(
            &mount.long_package_name_of(controlling.id),
            paths::base_filename_with_path(&file_rel_path),
        );
        self.add_discovered_file(DiscoveredPathData {
            local_abs_path: local_abs_path.to_string(),
            long_package_name,
            rel_path: leaf.to_string(),
            package_timestamp: stat.modification_time,
            file_type,
        });
        if paths::is_path_leaf(&file_rel_path) {
            mount
                .tree_mut()
                .mark_file_already_scanned(controlling.id, &file_rel_path);
        }
    }

    /// Persist and release the directory listing cache.
    ///
    /// Listings gathered after this point are not recorded.
    pub fn on_initial_search_completed(&self) {
        if !self.listing_cache_active.swap(false, Ordering::SeqCst) {
            return;
        }
        if self.settings.cache_write_enabled {
            let store = DirectoryListingStore::new(&self.settings.cache_dir);
            let snapshot: Vec<(String, DirectoryListing)> = self
                .listings
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            match store.save(snapshot.iter().map(|(path, listing)| (path.as_str(), listing))) {
                Ok(bytes) => info!(
                    directories = snapshot.len(),
                    bytes,
                    path = %store.path().display(),
                    "Saved directory listing cache"
                ),
                Err(err) => warn!(%err, "Failed to save directory listing cache"),
            }
        }
        self.listings.clear();
        self.listings.shrink_to_fit();
    }
}

/// Keeps discovery paused while alive.
#[must_use = "discovery resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct DiscoveryPause<'a> {
    discovery: &'a Discovery,
    counted: bool,
}

impl Drop for DiscoveryPause<'_> {
    fn drop(&mut self) {
        self.discovery.tick_owner.release();
        if self.counted {
            self.discovery.is_paused.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::JwalkEnumerator;
    use assetgather_core::paths::normalize_local_path;
    use std::fs;
    use tempfile::TempDir;

    fn sync_discovery(temp: &TempDir) -> Discovery {
        let settings = GatherSettings::builder()
            .cache_dir(temp.path().join("Cache"))
            .async_enabled(false)
            .discover_threads(2usize)
            .build()
            .unwrap();
        Discovery::new(Arc::new(settings), Arc::new(JwalkEnumerator::new())).unwrap()
    }

    fn content(temp: &TempDir) -> String {
        let root = temp.path().join("Content");
        fs::create_dir_all(root.join("Sub/Deep")).unwrap();
        fs::write(root.join("A.pkg"), "a").unwrap();
        fs::write(root.join("Sub/B.pkg"), "b").unwrap();
        fs::write(root.join("Sub/Deep/C.umap"), "c").unwrap();
        fs::write(root.join("Sub/readme.txt"), "skip").unwrap();
        normalize_local_path(root)
    }

    fn drain(discovery: &Discovery) -> (DiscoveryBatch, Vec<String>) {
        let mut files = FilesToSearch::new();
        let batch = discovery.get_and_trim_search_results(&mut files);
        let mut popped = Vec::new();
        files.pop_front(&mut popped, usize::MAX);
        let mut names: Vec<String> = popped.into_iter().map(|f| f.long_package_name).collect();
        names.sort();
        (batch, names)
    }

    #[test]
    fn test_full_scan_of_allow_listed_mount() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);

        assert!(!discovery.add_mount_point(&root, "/Game"));
        assert!(discovery.add_mount_point(&root, "/Game"));
        discovery.try_set_directory_properties(
            &root,
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            true,
        );
        discovery.wait_for_idle(None);
        assert!(discovery.is_idle());
        assert_eq!(discovery.num_directories_to_scan(), 0);

        let (batch, names) = drain(&discovery);
        assert!(batch.is_complete);
        assert_eq!(names, vec!["/Game/A", "/Game/Sub/B", "/Game/Sub/Deep/C"]);
        let mut paths = batch.discovered_paths;
        paths.sort();
        assert_eq!(paths, vec!["/Game/Sub", "/Game/Sub/Deep"]);
        assert_eq!(discovery.get_diagnostics().num_uncached_directories, 3);
    }

    #[test]
    fn test_unmonitored_mount_goes_idle_without_listing() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        discovery.add_mount_point(&root, "/Game");
        discovery.wait_for_idle(None);
        let (batch, names) = drain(&discovery);
        assert!(batch.is_complete);
        assert!(names.is_empty());
        assert!(!discovery.is_monitored(&root));
    }

    #[test]
    fn test_wait_on_directory_scans_only_that_subtree() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        discovery.add_mount_point(&root, "/Game");

        let mut query = [PathExistence::new(format!("{root}/Sub"))];
        discovery.set_properties_and_wait(&mut query, true, false, false);

        let (_, names) = drain(&discovery);
        assert_eq!(names, vec!["/Game/Sub/B", "/Game/Sub/Deep/C"]);
        assert!(discovery.is_on_allow_list(&format!("{root}/Sub/Deep")));
        assert!(!discovery.is_on_allow_list(&root));
    }

    #[test]
    fn test_wait_on_file_reports_it_directly() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        discovery.add_mount_point(&root, "/Game");

        let mut query = [PathExistence::new(format!("{root}/A.pkg"))];
        discovery.set_properties_and_wait(&mut query, true, false, false);
        let mut files = FilesToSearch::new();
        discovery.get_and_trim_search_results(&mut files);
        assert_eq!(files.num_blocking_files(), 1);
    }

    #[test]
    fn test_nested_mount_is_excluded_from_parent() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        let nested = format!("{root}/Sub");
        discovery.add_mount_point(&root, "/Game");
        discovery.add_mount_point(&nested, "/Plugin");
        for path in [&root, &nested] {
            discovery.try_set_directory_properties(
                path,
                &SetPathProperties {
                    is_on_allow_list: Some(true),
                    ..Default::default()
                },
                true,
            );
        }
        discovery.wait_for_idle(None);

        let (_, names) = drain(&discovery);
        assert_eq!(names, vec!["/Game/A", "/Plugin/B", "/Plugin/Deep/C"]);
        assert!(!discovery.is_on_deny_list(&format!("{root}/Sub")));
    }

    #[test]
    fn test_deny_list_update_marks_mount_dirty() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        discovery.add_mount_point(&root, "/Game");
        discovery.set_deny_lists(DenyLists {
            long_package_names: vec!["/Game/Sub".into()],
            mount_relative_paths: Vec::new(),
        });
        discovery.try_set_directory_properties(
            &root,
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            true,
        );
        discovery.wait_for_idle(None);
        let (_, names) = drain(&discovery);
        assert_eq!(names, vec!["/Game/A"]);
        assert!(discovery.is_on_deny_list(&format!("{root}/Sub/Deep")));

        discovery.set_deny_lists(DenyLists::default());
        discovery.wait_for_idle(None);
        let (_, names) = drain(&discovery);
        assert_eq!(names, vec!["/Game/Sub/B", "/Game/Sub/Deep/C"]);
    }

    #[test]
    fn test_file_created_after_scan_is_reported_once() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let discovery = sync_discovery(&temp);
        discovery.add_mount_point(&root, "/Game");
        discovery.try_set_directory_properties(
            &root,
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            true,
        );
        discovery.wait_for_idle(None);
        drain(&discovery);

        fs::write(format!("{root}/New.pkg"), "n").unwrap();
        discovery.on_files_created(&[format!("{root}/New.pkg"), format!("{root}/Gone.pkg")]);
        discovery.wait_for_idle(None);
        let (_, names) = drain(&discovery);
        assert_eq!(names, vec!["/Game/New"]);
    }

    #[test]
    fn test_listing_cache_is_saved_and_reused() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let settings = Arc::new(
            GatherSettings::builder()
                .cache_dir(temp.path().join("Cache"))
                .async_enabled(false)
                .discovery_cache_enabled(true)
                .build()
                .unwrap(),
        );
        let allow = SetPathProperties {
            is_on_allow_list: Some(true),
            ..Default::default()
        };

        let first = Discovery::new(Arc::clone(&settings), Arc::new(JwalkEnumerator::new())).unwrap();
        first.add_mount_point(&root, "/Game");
        first.try_set_directory_properties(&root, &allow, true);
        first.wait_for_idle(None);
        first.on_initial_search_completed();
        assert!(DirectoryListingStore::new(temp.path().join("Cache")).path().exists());

        let second = Discovery::new(settings, Arc::new(JwalkEnumerator::new())).unwrap();
        second.add_mount_point(&root, "/Game");
        second.try_set_directory_properties(&root, &allow, true);
        second.wait_for_idle(None);
        let (_, names) = drain(&second);
        assert_eq!(names, vec!["/Game/A", "/Game/Sub/B", "/Game/Sub/Deep/C"]);
        assert_eq!(second.get_diagnostics().num_cached_directories, 3);
    }

    #[test]
    fn test_background_thread_reaches_idle() {
        let temp = TempDir::new().unwrap();
        let root = content(&temp);
        let settings = GatherSettings::builder()
            .cache_dir(temp.path().join("Cache"))
            .async_enabled(true)
            .build()
            .unwrap();
        let discovery = Arc::new(Discovery::new(Arc::new(settings), Arc::new(JwalkEnumerator::new())).unwrap());
        discovery.start_async().unwrap();
        assert!(!discovery.is_synchronous());

        discovery.add_mount_point(&root, "/Game");
        discovery.try_set_directory_properties(
            &root,
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            true,
        );
        discovery.wait_for_idle(Some(Instant::now() + Duration::from_secs(30)));
        assert!(discovery.is_idle());
        discovery.stop();
        assert!(discovery.is_synchronous());

        let (_, names) = drain(&discovery);
        assert_eq!(names.len(), 3);
    }
}
