//! Per-mount tree of directory scan state.
//!
//! Nodes live in an arena owned by their mount and are addressed by
//! generation-checked [`ScanDirId`]s. A node removed from the tree frees its
//! slot and bumps the slot generation, so a stale id held by an in-flight
//! scan resolves to nothing instead of to a reused node.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tracing::warn;

use assetgather_core::paths;

use crate::existence::{PathExistence, PathType};
use crate::path_data::DiscoveredPathData;

/// Directory settings that combine down the tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inherited {
    /// Directory is on the allow list.
    pub is_on_allow_list: bool,
    /// Directory matches a deny-list entry.
    pub matches_deny_list: bool,
    /// Deny-list matches are ignored for this directory.
    pub ignore_deny_list: bool,
}

impl Inherited {
    /// Combine a parent's accumulated settings with a child's direct settings.
    pub fn combine(parent: Inherited, child: Inherited) -> Self {
        Self {
            is_on_allow_list: parent.is_on_allow_list || child.is_on_allow_list,
            matches_deny_list: parent.matches_deny_list || child.matches_deny_list,
            ignore_deny_list: parent.ignore_deny_list || child.ignore_deny_list,
        }
    }

    /// Allow-listed and not denied.
    pub fn is_monitored(&self) -> bool {
        self.is_on_allow_list && !self.is_on_deny_list()
    }

    /// Matches the deny list and is not exempt from it.
    pub fn is_on_deny_list(&self) -> bool {
        self.matches_deny_list && !self.ignore_deny_list
    }

    /// Any setting is present.
    pub fn has_setting(&self) -> bool {
        self.is_on_allow_list || self.matches_deny_list || self.ignore_deny_list
    }
}

/// Directory property changes requested by a caller. Unset fields are left alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetPathProperties {
    /// Add to or remove from the allow list.
    pub is_on_allow_list: Option<bool>,
    /// Add to or remove from the deny list.
    pub matches_deny_list: Option<bool>,
    /// Exempt from or subject to the deny list.
    pub ignore_deny_list: Option<bool>,
    /// `Some(false)` forces a rescan.
    pub has_scanned: Option<bool>,
}

impl SetPathProperties {
    /// Whether any property is requested.
    pub fn is_set(&self) -> bool {
        self.is_on_allow_list.is_some()
            || self.matches_deny_list.is_some()
            || self.ignore_deny_list.is_some()
            || self.has_scanned.is_some()
    }
}

/// Counters shared between every mount's tree and the discovery engine.
///
/// `is_idle` is never left true while `directories_to_scan` is non-zero:
/// a node becoming incomplete clears idle before it increments the count.
#[derive(Debug, Default)]
pub struct ScanCounters {
    is_idle: AtomicBool,
    directories_to_scan: AtomicI64,
}

impl ScanCounters {
    /// Create counters for an idle engine.
    pub fn new() -> Self {
        Self::default()
    }

    fn mark_incomplete(&self) {
        self.is_idle.store(false, Ordering::SeqCst);
        self.directories_to_scan.fetch_add(1, Ordering::SeqCst);
    }

    fn mark_complete(&self) {
        self.directories_to_scan.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of directories not yet complete.
    pub fn directories_to_scan(&self) -> i64 {
        self.directories_to_scan.load(Ordering::SeqCst)
    }

    /// Whether discovery reported itself idle.
    pub fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::SeqCst)
    }

    /// Record the idle state.
    pub fn set_idle(&self, idle: bool) {
        self.is_idle.store(idle, Ordering::SeqCst);
    }
}

/// Generation-checked handle to a node in a [`ScanTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScanDirId {
    index: u32,
    generation: u32,
}

/// Scan state of one directory.
#[derive(Debug)]
pub struct ScanDir {
    rel_path: String,
    parent: Option<ScanDirId>,
    sub_dirs: Vec<ScanDirId>,
    direct: Inherited,
    already_scanned_files: Vec<String>,
    has_scanned: bool,
    is_complete: bool,
    scan_in_flight: bool,
    scan_in_flight_invalidated: bool,
}

impl ScanDir {
    fn new(parent: Option<ScanDirId>, rel_path: &str) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            parent,
            sub_dirs: Vec::new(),
            direct: Inherited::default(),
            already_scanned_files: Vec::new(),
            has_scanned: false,
            is_complete: false,
            scan_in_flight: false,
            scan_in_flight_invalidated: false,
        }
    }

    /// Path segment relative to the parent; empty for the root.
    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    /// Settings set directly on this directory.
    pub fn direct_data(&self) -> Inherited {
        self.direct
    }

    /// Whether this directory's listing has been ingested.
    pub fn has_scanned(&self) -> bool {
        self.has_scanned
    }

    /// Whether no work remains under this directory.
    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// Whether a listing of this directory is being produced.
    pub fn is_scan_in_flight(&self) -> bool {
        self.scan_in_flight
    }

    /// Whether the in-flight listing must be discarded.
    pub fn is_scan_in_flight_invalidated(&self) -> bool {
        self.scan_in_flight_invalidated
    }

    /// Number of child nodes.
    pub fn num_sub_dirs(&self) -> usize {
        self.sub_dirs.len()
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<ScanDir>,
}

/// Directory found by [`ScanTree::controlling_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllingDir {
    /// The deepest node that decides how the queried path is handled.
    pub id: ScanDirId,
    /// Settings accumulated down to and including that node.
    pub accumulated: Inherited,
    /// Remainder of the queried path below that node.
    pub rel_path: String,
}

/// Outcome of [`ScanTree::try_set_directory_properties`].
#[derive(Debug, Default, Clone)]
pub struct SetPropertiesOutcome {
    /// Node that now controls the queried path, with its parent's accumulated settings.
    pub controlling: Option<(ScanDirId, Inherited)>,
    /// Remainder of the queried path below the controlling node.
    pub rel_path: String,
    /// Whether any node changed.
    pub made_changes: bool,
}

/// Scan request produced by [`ScanTree::update`].
pub type ScanRequest = (ScanDirId, Inherited);

/// Arena of [`ScanDir`] nodes for one mount.
#[derive(Debug)]
pub struct ScanTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ScanDirId,
    counters: Arc<ScanCounters>,
    has_started_scanning: bool,
}

impl ScanTree {
    /// Create a tree holding only an unscanned root.
    pub fn new(counters: Arc<ScanCounters>) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ScanDirId {
                index: 0,
                generation: 0,
            },
            counters,
            has_started_scanning: false,
        };
        tree.root = tree.alloc(None, "");
        tree
    }

    /// The root node.
    pub fn root(&self) -> ScanDirId {
        self.root
    }

    /// Whether any listing has been ingested for this tree.
    pub fn has_started_scanning(&self) -> bool {
        self.has_started_scanning
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether the tree holds no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a handle. Stale handles yield `None`.
    pub fn get(&self, id: ScanDirId) -> Option<&ScanDir> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn get_mut(&mut self, id: ScanDirId) -> Option<&mut ScanDir> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Whether a handle still names a live node.
    pub fn is_valid(&self, id: ScanDirId) -> bool {
        self.get(id).is_some()
    }

    /// Whether a node is complete; removed nodes count as complete.
    pub fn is_complete(&self, id: ScanDirId) -> bool {
        self.get(id).is_none_or(|node| node.is_complete)
    }

    fn alloc(&mut self, parent: Option<ScanDirId>, rel_path: &str) -> ScanDirId {
        self.counters.mark_incomplete();
        let node = ScanDir::new(parent, rel_path);
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                ScanDirId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                ScanDirId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    /// Free a node and its subtree.
    fn shutdown(&mut self, id: ScanDirId) {
        let Some(node) = self.get(id) else {
            return;
        };
        let sub_dirs = node.sub_dirs.clone();
        for sub_dir in sub_dirs {
            self.shutdown(sub_dir);
        }
        let slot = &mut self.slots[id.index as usize];
        if let Some(node) = slot.node.take() {
            if !node.is_complete {
                self.counters.mark_complete();
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
        }
    }

    /// Path of a node relative to the mount root.
    pub fn mount_rel_path(&self, id: ScanDirId) -> String {
        let mut segments = Vec::new();
        let mut current = self.get(id);
        while let Some(node) = current {
            if node.parent.is_some() {
                segments.push(node.rel_path.as_str());
            }
            current = node.parent.and_then(|parent| self.get(parent));
        }
        segments.reverse();
        segments.join("/")
    }

    /// Accumulated settings of the node nearest to `rel_path` below `id`.
    pub fn monitor_data(&self, id: ScanDirId, rel_path: &str, parent_data: Inherited) -> Inherited {
        let Some(node) = self.get(id) else {
            return Inherited::default();
        };
        let accumulated = Inherited::combine(parent_data, node.direct);
        let (first, rest) = paths::split_first_component(rel_path);
        if first.is_empty() {
            return accumulated;
        }
        match self.find_sub_dir(id, first) {
            Some(sub_dir) => self.monitor_data(sub_dir, rest, accumulated),
            None => accumulated,
        }
    }

    /// Whether a node is allow-listed and not denied.
    pub fn is_monitored(&self, id: ScanDirId, parent_data: Inherited) -> bool {
        self.get(id)
            .is_some_and(|node| Inherited::combine(parent_data, node.direct).is_monitored())
    }

    /// Whether a node is monitored and has not been scanned.
    pub fn should_scan(&self, id: ScanDirId, parent_data: Inherited) -> bool {
        self.get(id).is_some_and(|node| !node.has_scanned) && self.is_monitored(id, parent_data)
    }

    /// Find the node that controls `rel_path`, creating intermediate nodes
    /// below directories that still need scanning.
    pub fn controlling_dir(
        &mut self,
        id: ScanDirId,
        rel_path: &str,
        is_directory: bool,
        parent_data: Inherited,
    ) -> Option<ControllingDir> {
        let accumulated = Inherited::combine(parent_data, self.get(id)?.direct);
        if rel_path.is_empty() {
            if !is_directory {
                warn!(
                    path = %self.mount_rel_path(id),
                    "Controlling directory requested for a file path that is recorded as a directory"
                );
                return None;
            }
            return Some(ControllingDir {
                id,
                accumulated,
                rel_path: String::new(),
            });
        }

        let (first, rest) = paths::split_first_component(rel_path);
        if rest.is_empty() && !is_directory {
            return Some(ControllingDir {
                id,
                accumulated,
                rel_path: rel_path.to_string(),
            });
        }

        let sub_dir = if self.should_scan(id, parent_data) {
            self.find_or_add_sub_dir(id, first)
        } else {
            match self.find_sub_dir(id, first) {
                Some(sub_dir) => sub_dir,
                None => {
                    return Some(ControllingDir {
                        id,
                        accumulated,
                        rel_path: rel_path.to_string(),
                    });
                }
            }
        };
        self.controlling_dir(sub_dir, rest, is_directory, accumulated)
    }

    /// Apply `properties` to the directory at `rel_path` below `id`.
    ///
    /// Missing nodes are created only when the queried path exists on disk;
    /// the disk is queried lazily and at most once through `query`.
    pub fn try_set_directory_properties(
        &mut self,
        id: ScanDirId,
        query: &mut PathExistence,
        rel_path: &str,
        parent_data: Inherited,
        properties: &SetPathProperties,
        out: &mut SetPropertiesOutcome,
    ) {
        let Some(node) = self.get(id) else {
            return;
        };
        let direct = node.direct;
        let has_scanned = node.has_scanned;

        if rel_path.is_empty() {
            self.apply_properties(id, direct, properties, out);
            out.controlling = Some((id, parent_data));
            out.rel_path.clear();
            return;
        }

        let mut properties = *properties;
        if properties.is_on_allow_list.is_some() && direct.is_on_allow_list {
            // Descendants of an allow-listed directory never carry their own allow flag
            properties.is_on_allow_list = None;
        }

        let (first, rest) = paths::split_first_component(rel_path);
        let data_for_sub_dir = Inherited::combine(parent_data, direct);

        let unchanged_below = has_scanned
            && properties.has_scanned.is_none_or(|value| value)
            && properties
                .is_on_allow_list
                .is_none_or(|value| value == data_for_sub_dir.is_on_allow_list)
            && properties
                .ignore_deny_list
                .is_none_or(|value| value == data_for_sub_dir.ignore_deny_list)
            && properties
                .matches_deny_list
                .is_none_or(|value| value == data_for_sub_dir.matches_deny_list);

        let sub_dir = match self.find_sub_dir(id, first) {
            Some(sub_dir) => sub_dir,
            None if unchanged_below => {
                out.controlling = Some((id, parent_data));
                out.rel_path = rel_path.to_string();
                return;
            }
            None => {
                let path_type = query.path_type();
                if path_type == PathType::MissingParentDir
                    || (rest.is_empty() && path_type != PathType::Directory)
                {
                    out.controlling = Some((id, parent_data));
                    out.rel_path = rel_path.to_string();
                    return;
                }

                let sub_dir = self.find_or_add_sub_dir(id, first);
                // A directory created under an already scanned parent was either
                // scanned before and pruned, or appeared after the scan.
                if has_scanned && self.is_monitored(sub_dir, data_for_sub_dir) {
                    if let Some(node) = self.get_mut(sub_dir) {
                        node.has_scanned = true;
                    }
                }
                out.made_changes = true;
                self.set_complete(id, false);
                sub_dir
            }
        };

        self.try_set_directory_properties(sub_dir, query, rest, data_for_sub_dir, &properties, out);
        if let Some((controlling, _)) = out.controlling {
            if !self.is_complete(controlling) {
                out.made_changes = true;
                self.set_complete(id, false);
            }
        }
    }

    fn apply_properties(
        &mut self,
        id: ScanDirId,
        direct: Inherited,
        properties: &SetPathProperties,
        out: &mut SetPropertiesOutcome,
    ) {
        if let Some(allow) = properties
            .is_on_allow_list
            .filter(|allow| *allow != direct.is_on_allow_list)
        {
            out.made_changes = true;
            self.set_complete(id, false);
            self.invalidate_scan_in_flight(id);
            if let Some(node) = self.get_mut(id) {
                node.direct.is_on_allow_list = allow;
            }
            for descendant in self.descendants(id) {
                if allow {
                    // This directory is now the single allow-listed root of its subtree
                    if let Some(node) = self.get_mut(descendant) {
                        node.direct.is_on_allow_list = false;
                    }
                    self.set_complete(descendant, false);
                } else {
                    self.invalidate_scan_in_flight(descendant);
                }
            }
        }

        let deny_changed = properties
            .matches_deny_list
            .is_some_and(|value| value != direct.matches_deny_list)
            || properties
                .ignore_deny_list
                .is_some_and(|value| value != direct.ignore_deny_list);
        if deny_changed {
            out.made_changes = true;
            self.set_complete(id, false);
            if let Some(node) = self.get_mut(id) {
                if let Some(matches) = properties.matches_deny_list {
                    node.direct.matches_deny_list = matches;
                }
                if let Some(ignore) = properties.ignore_deny_list {
                    node.direct.ignore_deny_list = ignore;
                }
            }

            let mut chain = Inherited::default();
            let mut current = Some(id);
            while let Some(node) = current.and_then(|current| self.get(current)) {
                chain = Inherited::combine(chain, node.direct);
                current = node.parent;
            }
            let is_on_deny_list = chain.is_on_deny_list();

            if is_on_deny_list {
                self.invalidate_scan_in_flight(id);
            }
            for descendant in self.descendants(id) {
                if is_on_deny_list {
                    self.invalidate_scan_in_flight(descendant);
                }
                self.set_complete(descendant, false);
            }
        }

        if let Some(has_scanned) = properties.has_scanned {
            out.made_changes = true;
            self.set_complete(id, false);
            let mut targets = vec![id];
            targets.extend(self.descendants(id));
            for target in targets {
                self.invalidate_scan_in_flight(target);
                if let Some(node) = self.get_mut(target) {
                    node.has_scanned = has_scanned;
                    node.already_scanned_files.clear();
                }
            }
        }
    }

    fn invalidate_scan_in_flight(&mut self, id: ScanDirId) {
        if let Some(node) = self.get_mut(id) {
            if node.scan_in_flight {
                node.scan_in_flight_invalidated = true;
            }
        }
    }

    /// Record a file reported before the directory itself was scanned.
    pub fn mark_file_already_scanned(&mut self, id: ScanDirId, base_name: &str) {
        let Some(node) = self.get_mut(id) else {
            return;
        };
        if node.has_scanned {
            return;
        }
        debug_assert!(paths::is_path_leaf(base_name));
        if node
            .already_scanned_files
            .iter()
            .any(|file| file.eq_ignore_ascii_case(base_name))
        {
            return;
        }
        node.already_scanned_files.push(base_name.to_string());
    }

    /// Ingest the listing of a directory.
    ///
    /// Sub-directories that are not monitored are dropped from `sub_dirs`,
    /// files already reported are dropped from `files`.
    pub fn set_scan_results(
        &mut self,
        id: ScanDirId,
        parent_data: Inherited,
        sub_dirs: &mut Vec<DiscoveredPathData>,
        files: &mut Vec<DiscoveredPathData>,
    ) {
        self.set_complete(id, false);
        let Some(node) = self.get(id) else {
            return;
        };
        if node.has_scanned {
            warn!(path = %self.mount_rel_path(id), "Scan results received for a directory that was already scanned");
            return;
        }
        let accumulated = Inherited::combine(parent_data, node.direct);

        sub_dirs.retain(|sub_dir| {
            let child = self.find_or_add_sub_dir(id, &sub_dir.rel_path);
            self.is_monitored(child, accumulated)
        });

        let Some(node) = self.get_mut(id) else {
            return;
        };
        if !node.already_scanned_files.is_empty() {
            let already = &node.already_scanned_files;
            files.retain(|file| !already.iter().any(|name| paths::paths_equal(name, &file.rel_path)));
        }
        node.already_scanned_files = Vec::new();
        node.has_scanned = true;
        self.has_started_scanning = true;
    }

    /// Collect scan requests below `id` and mark finished subtrees complete.
    ///
    /// A node becomes complete once it needs no scan and all its children
    /// are complete; completed nodes may be pruned from the tree.
    pub fn update(&mut self, id: ScanDirId, out: &mut Vec<ScanRequest>, parent_data: Inherited) {
        let Some(node) = self.get(id) else {
            return;
        };
        if node.is_complete {
            return;
        }
        let direct = node.direct;
        let sub_dirs = node.sub_dirs.clone();

        let scan_this = self.should_scan(id, parent_data);
        if scan_this {
            out.push((id, parent_data));
        }

        let data_for_sub_dirs = Inherited::combine(parent_data, direct);
        let mut all_sub_dirs_complete = true;
        for sub_dir in sub_dirs {
            if self.is_complete(sub_dir) {
                continue;
            }
            self.update(sub_dir, out, data_for_sub_dirs);
            all_sub_dirs_complete &= self.is_complete(sub_dir);
        }

        if scan_this || !all_sub_dirs_complete {
            return;
        }
        self.set_complete(id, true);
    }

    /// Depth-first search for an incomplete node, children before parents.
    pub fn first_incomplete(&self, id: ScanDirId) -> Option<ScanDirId> {
        let node = self.get(id)?;
        node.sub_dirs
            .iter()
            .find_map(|sub_dir| self.first_incomplete(*sub_dir))
            .or((!node.is_complete).then_some(id))
    }

    /// Mark a node and its ancestors incomplete, optionally its descendants too.
    pub fn mark_dirty(&mut self, id: ScanDirId, include_descendants: bool) {
        if include_descendants {
            for descendant in self.descendants(id) {
                self.set_complete(descendant, false);
            }
        }
        let mut current = Some(id);
        while let Some(id) = current {
            self.set_complete(id, false);
            current = self.get(id).and_then(|node| node.parent);
        }
    }

    /// Record that a listing for the node is being produced.
    pub fn set_scan_in_flight(&mut self, id: ScanDirId, in_flight: bool) {
        if let Some(node) = self.get_mut(id) {
            node.scan_in_flight = in_flight;
        }
    }

    /// Set or clear the flag that discards the in-flight listing.
    pub fn set_scan_in_flight_invalidated(&mut self, id: ScanDirId, invalidated: bool) {
        if let Some(node) = self.get_mut(id) {
            node.scan_in_flight_invalidated = invalidated;
        }
    }

    /// Change the completion state of a node.
    ///
    /// A node that completes is pruned when its parent has been scanned and
    /// it has no settings and no children, since re-listing the parent would
    /// recreate it if needed.
    pub fn set_complete(&mut self, id: ScanDirId, complete: bool) {
        let counters = Arc::clone(&self.counters);
        let Some(node) = self.get_mut(id) else {
            return;
        };
        if node.is_complete == complete {
            return;
        }
        node.is_complete = complete;
        if !complete {
            counters.mark_incomplete();
            return;
        }

        counters.mark_complete();
        let prunable = !node.direct.has_setting() && node.sub_dirs.is_empty();
        let parent = node.parent;
        let rel_path = node.rel_path.clone();
        if let Some(parent) = parent {
            if prunable && self.get(parent).is_some_and(|parent| parent.has_scanned) {
                self.remove_sub_dir(parent, &rel_path);
            }
        }
    }

    fn lower_bound(&self, id: ScanDirId, name: &str) -> usize {
        let Some(node) = self.get(id) else {
            return 0;
        };
        node.sub_dirs.partition_point(|sub_dir| {
            self.get(*sub_dir)
                .is_some_and(|sub_dir| paths::path_cmp(&sub_dir.rel_path, name).is_lt())
        })
    }

    /// Find a direct child by name.
    pub fn find_sub_dir(&self, id: ScanDirId, name: &str) -> Option<ScanDirId> {
        let index = self.lower_bound(id, name);
        let sub_dir = *self.get(id)?.sub_dirs.get(index)?;
        self.get(sub_dir)
            .filter(|node| paths::paths_equal(&node.rel_path, name))
            .map(|_| sub_dir)
    }

    /// Find or create a direct child by name.
    pub fn find_or_add_sub_dir(&mut self, id: ScanDirId, name: &str) -> ScanDirId {
        if let Some(sub_dir) = self.find_sub_dir(id, name) {
            return sub_dir;
        }
        let index = self.lower_bound(id, name);
        let sub_dir = self.alloc(Some(id), name);
        if let Some(node) = self.get_mut(id) {
            node.sub_dirs.insert(index, sub_dir);
        }
        sub_dir
    }

    /// Remove a direct child and its subtree.
    pub fn remove_sub_dir(&mut self, id: ScanDirId, name: &str) {
        let Some(sub_dir) = self.find_sub_dir(id, name) else {
            return;
        };
        if let Some(node) = self.get_mut(id) {
            node.sub_dirs.retain(|child| *child != sub_dir);
        }
        self.shutdown(sub_dir);
    }

    /// All nodes below `id`, parents before children.
    pub fn descendants(&self, id: ScanDirId) -> Vec<ScanDirId> {
        let mut result = Vec::new();
        let mut stack: Vec<ScanDirId> = match self.get(id) {
            Some(node) => node.sub_dirs.iter().rev().copied().collect(),
            None => return result,
        };
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                result.push(current);
                stack.extend(node.sub_dirs.iter().rev().copied());
            }
        }
        result
    }

    /// Release unused capacity.
    pub fn shrink(&mut self) {
        for slot in &mut self.slots {
            if let Some(node) = slot.node.as_mut() {
                node.sub_dirs.shrink_to_fit();
                node.already_scanned_files.shrink_to_fit();
            }
        }
        self.free.shrink_to_fit();
    }
}

impl Drop for ScanTree {
    fn drop(&mut self) {
        let root = self.root;
        self.shutdown(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgather_core::GatherableFileType;
    use chrono::Utc;

    const MONITORED: Inherited = Inherited {
        is_on_allow_list: true,
        matches_deny_list: false,
        ignore_deny_list: false,
    };

    fn discovered(rel_path: &str, file_type: GatherableFileType) -> DiscoveredPathData {
        DiscoveredPathData::new("/mount", "/Game", rel_path, Utc::now(), file_type)
    }

    fn new_tree() -> (ScanTree, Arc<ScanCounters>) {
        let counters = Arc::new(ScanCounters::new());
        (ScanTree::new(Arc::clone(&counters)), counters)
    }

    #[test]
    fn test_root_requests_scan_when_monitored() {
        let (mut tree, counters) = new_tree();
        assert_eq!(counters.directories_to_scan(), 1);

        let mut requests = Vec::new();
        tree.update(tree.root(), &mut requests, Inherited::default());
        // Not allow-listed: nothing to scan, the root completes
        assert!(requests.is_empty());
        assert!(tree.is_complete(tree.root()));
        assert_eq!(counters.directories_to_scan(), 0);

        tree.mark_dirty(tree.root(), false);
        tree.update(tree.root(), &mut requests, MONITORED);
        assert_eq!(requests, vec![(tree.root(), MONITORED)]);
        assert!(!tree.is_complete(tree.root()));
    }

    #[test]
    fn test_scan_results_prune_completed_children() {
        let (mut tree, counters) = new_tree();
        let root = tree.root();
        let mut sub_dirs = vec![discovered("Sub", GatherableFileType::Directory)];
        let mut files = vec![discovered("A.pkg", GatherableFileType::PackageFile)];
        tree.set_scan_results(root, MONITORED, &mut sub_dirs, &mut files);
        assert_eq!(sub_dirs.len(), 1);
        assert_eq!(files.len(), 1);
        assert!(tree.has_started_scanning());

        let sub = tree.find_sub_dir(root, "sub").unwrap();
        let mut requests = Vec::new();
        tree.update(root, &mut requests, MONITORED);
        assert_eq!(requests, vec![(sub, MONITORED)]);

        tree.set_scan_results(sub, MONITORED, &mut Vec::new(), &mut Vec::new());
        requests.clear();
        tree.update(root, &mut requests, MONITORED);
        assert!(requests.is_empty());
        assert!(tree.is_complete(root));
        // The finished child is pruned and its handle goes stale
        assert!(!tree.is_valid(sub));
        assert_eq!(tree.len(), 1);
        assert_eq!(counters.directories_to_scan(), 0);
    }

    #[test]
    fn test_already_scanned_files_are_filtered_once() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        tree.mark_file_already_scanned(root, "A.pkg");
        tree.mark_file_already_scanned(root, "a.PKG");

        let mut files = vec![
            discovered("A.pkg", GatherableFileType::PackageFile),
            discovered("B.pkg", GatherableFileType::PackageFile),
        ];
        tree.set_scan_results(root, MONITORED, &mut Vec::new(), &mut files);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, "B.pkg");

        // A second listing of a scanned directory is refused
        let mut again = vec![discovered("B.pkg", GatherableFileType::PackageFile)];
        tree.set_scan_results(root, MONITORED, &mut Vec::new(), &mut again);
        assert!(tree.get(root).unwrap().has_scanned());
    }

    #[test]
    fn test_unmonitored_sub_dirs_are_not_reported() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let mut query = PathExistence::new("/mount/Denied");
        let mut outcome = SetPropertiesOutcome::default();
        tree.try_set_directory_properties(
            root,
            &mut query,
            "",
            Inherited::default(),
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            &mut outcome,
        );
        let denied = tree.find_or_add_sub_dir(root, "Denied");
        tree.try_set_directory_properties(
            denied,
            &mut query,
            "",
            MONITORED,
            &SetPathProperties {
                matches_deny_list: Some(true),
                ..Default::default()
            },
            &mut outcome,
        );

        let mut sub_dirs = vec![
            discovered("Denied", GatherableFileType::Directory),
            discovered("Open", GatherableFileType::Directory),
        ];
        tree.set_scan_results(root, Inherited::default(), &mut sub_dirs, &mut Vec::new());
        let names: Vec<&str> = sub_dirs.iter().map(|d| d.rel_path.as_str()).collect();
        assert_eq!(names, vec!["Open"]);
    }

    #[test]
    fn test_allow_list_clears_descendant_flags() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let sub = tree.find_or_add_sub_dir(root, "Sub");
        let allow = SetPathProperties {
            is_on_allow_list: Some(true),
            ..Default::default()
        };
        let mut query = PathExistence::new("/mount/Sub");
        let mut outcome = SetPropertiesOutcome::default();
        tree.try_set_directory_properties(sub, &mut query, "", Inherited::default(), &allow, &mut outcome);
        assert!(tree.get(sub).unwrap().direct_data().is_on_allow_list);

        let mut outcome = SetPropertiesOutcome::default();
        tree.try_set_directory_properties(root, &mut query, "", Inherited::default(), &allow, &mut outcome);
        assert!(outcome.made_changes);
        assert!(tree.get(root).unwrap().direct_data().is_on_allow_list);
        assert!(!tree.get(sub).unwrap().direct_data().is_on_allow_list);
        assert!(!tree.is_complete(sub));
    }

    #[test]
    fn test_forced_rescan_resets_subtree() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let mut sub_dirs = vec![discovered("Sub", GatherableFileType::Directory)];
        tree.set_scan_results(root, MONITORED, &mut sub_dirs, &mut Vec::new());
        let sub = tree.find_sub_dir(root, "Sub").unwrap();
        tree.set_scan_in_flight(sub, true);

        let mut query = PathExistence::new("/mount");
        let mut outcome = SetPropertiesOutcome::default();
        tree.try_set_directory_properties(
            root,
            &mut query,
            "",
            MONITORED,
            &SetPathProperties {
                has_scanned: Some(false),
                ..Default::default()
            },
            &mut outcome,
        );
        assert!(!tree.get(root).unwrap().has_scanned());
        assert!(!tree.get(sub).unwrap().has_scanned());
        assert!(tree.get(sub).unwrap().is_scan_in_flight_invalidated());

        let mut requests = Vec::new();
        tree.update(root, &mut requests, MONITORED);
        assert!(requests.contains(&(root, MONITORED)));
    }

    #[test]
    fn test_missing_path_creates_no_nodes() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let mut query = PathExistence::new("/definitely/not/here/Sub/Deeper");
        let mut outcome = SetPropertiesOutcome::default();
        tree.try_set_directory_properties(
            root,
            &mut query,
            "Sub/Deeper",
            Inherited::default(),
            &SetPathProperties {
                is_on_allow_list: Some(true),
                ..Default::default()
            },
            &mut outcome,
        );
        assert_eq!(outcome.controlling, Some((root, Inherited::default())));
        assert_eq!(outcome.rel_path, "Sub/Deeper");
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_controlling_dir_for_file() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let controlling = tree
            .controlling_dir(root, "Sub/B.pkg", false, MONITORED)
            .unwrap();
        // The root still needs scanning, so the path down to the file is created
        let sub = tree.find_sub_dir(root, "Sub").unwrap();
        assert_eq!(controlling.id, sub);
        assert_eq!(controlling.rel_path, "B.pkg");
        assert!(controlling.accumulated.is_monitored());
        assert_eq!(tree.mount_rel_path(sub), "Sub");
    }

    #[test]
    fn test_first_incomplete_prefers_children() {
        let (mut tree, _) = new_tree();
        let root = tree.root();
        let sub = tree.find_or_add_sub_dir(root, "Sub");
        assert_eq!(tree.first_incomplete(root), Some(sub));
        tree.set_complete(sub, true);
        assert_eq!(tree.first_incomplete(root), Some(root));
    }
}
