//! Mounted content roots.

use std::sync::Arc;

use tracing::warn;

use assetgather_core::paths;

use crate::existence::{PathExistence, stat_path};
use crate::scan_dir::{
    ControllingDir, Inherited, ScanCounters, ScanDirId, ScanRequest, ScanTree, SetPathProperties,
    SetPropertiesOutcome,
};

/// Deny-list entries applied to every mount.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenyLists {
    /// Long package names excluded from scanning, with their subtrees.
    pub long_package_names: Vec<String>,
    /// Mount-relative paths excluded under every mount.
    pub mount_relative_paths: Vec<String>,
}

/// Identity of a mount for the lifetime of its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MountId(u32);

impl MountId {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }
}

/// A local directory mapped to a long package name root, with its scan tree.
#[derive(Debug)]
pub struct MountDir {
    id: MountId,
    local_abs_path: String,
    long_package_name: String,
    tree: ScanTree,
    child_mount_paths: Vec<String>,
    rel_paths_deny_list: Vec<String>,
    parent_mount: Option<String>,
}

impl MountDir {
    /// Create a mount with an unscanned root and apply the deny lists.
    pub fn new(
        id: MountId,
        local_abs_path: impl Into<String>,
        long_package_name: impl Into<String>,
        counters: Arc<ScanCounters>,
        deny_lists: &DenyLists,
    ) -> Self {
        let mut mount = Self {
            id,
            local_abs_path: local_abs_path.into(),
            long_package_name: long_package_name.into(),
            tree: ScanTree::new(counters),
            child_mount_paths: Vec::new(),
            rel_paths_deny_list: Vec::new(),
            parent_mount: None,
        };
        mount.update_deny_list(deny_lists);
        mount
    }

    pub fn id(&self) -> MountId {
        self.id
    }

    pub fn local_abs_path(&self) -> &str {
        &self.local_abs_path
    }

    pub fn long_package_name(&self) -> &str {
        &self.long_package_name
    }

    pub fn tree(&self) -> &ScanTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut ScanTree {
        &mut self.tree
    }

    /// Whether no scan work remains in this mount.
    pub fn is_complete(&self) -> bool {
        self.tree.is_complete(self.tree.root())
    }

    /// Deny-list entries currently applied, relative to the mount root.
    pub fn rel_paths_deny_list(&self) -> &[String] {
        &self.rel_paths_deny_list
    }

    /// Local path of the mount this one is nested in.
    pub fn parent_mount(&self) -> Option<&str> {
        self.parent_mount.as_deref()
    }

    pub fn set_parent_mount(&mut self, parent: Option<String>) {
        self.parent_mount = parent;
    }

    /// Local paths of the mounts nested directly in this one.
    pub fn child_mounts(&self) -> Vec<String> {
        self.child_mount_paths
            .iter()
            .map(|rel_path| paths::join_path(&self.local_abs_path, rel_path))
            .collect()
    }

    /// Local path of a node in this mount.
    pub fn local_abs_path_of(&self, id: ScanDirId) -> String {
        paths::join_path(&self.local_abs_path, &self.tree.mount_rel_path(id))
    }

    /// Long package name of a node in this mount.
    pub fn long_package_name_of(&self, id: ScanDirId) -> String {
        paths::join_path(&self.long_package_name, &self.tree.mount_rel_path(id))
    }

    /// Node controlling a local path inside this mount.
    pub fn controlling_dir(&mut self, local_abs_path: &str, is_directory: bool) -> Option<ControllingDir> {
        let rel_path = paths::try_make_child_path_relative_to(local_abs_path, &self.local_abs_path)?;
        let root = self.tree.root();
        self.tree
            .controlling_dir(root, rel_path, is_directory, Inherited::default())
    }

    /// Accumulated settings for a local path inside this mount.
    pub fn monitor_data(&self, local_abs_path: &str) -> Inherited {
        match paths::try_make_child_path_relative_to(local_abs_path, &self.local_abs_path) {
            Some(rel_path) => self
                .tree
                .monitor_data(self.tree.root(), rel_path, Inherited::default()),
            None => Inherited::default(),
        }
    }

    pub fn is_monitored(&self, local_abs_path: &str) -> bool {
        self.monitor_data(local_abs_path).is_monitored()
    }

    /// Apply directory properties to the path named by `query`.
    pub fn try_set_directory_properties(
        &mut self,
        query: &mut PathExistence,
        properties: &SetPathProperties,
    ) -> SetPropertiesOutcome {
        let mut outcome = SetPropertiesOutcome::default();
        let Some(rel_path) =
            paths::try_make_child_path_relative_to(query.local_abs_path(), &self.local_abs_path)
                .map(str::to_string)
        else {
            return outcome;
        };

        let mut properties = *properties;
        if properties.ignore_deny_list.is_some() && self.is_child_mount_path(&rel_path) {
            // Child mount ranges are denied through the deny-list flag and must stay denied here
            properties.ignore_deny_list = None;
        }

        let root = self.tree.root();
        self.tree.try_set_directory_properties(
            root,
            query,
            &rel_path,
            Inherited::default(),
            &properties,
            &mut outcome,
        );
        outcome
    }

    /// Recompute the mount's deny list from the global lists and child mounts,
    /// updating only entries that were added or removed.
    pub fn update_deny_list(&mut self, deny_lists: &DenyLists) {
        let mut removed = std::mem::take(&mut self.rel_paths_deny_list);

        let mut current = Vec::new();
        for entry in &deny_lists.long_package_names {
            // An empty relative path denies the whole mount
            if let Some(rel_path) = paths::try_make_child_path_relative_to(entry, &self.long_package_name) {
                current.push(rel_path.to_string());
            }
        }
        current.extend(deny_lists.mount_relative_paths.iter().cloned());
        current.extend(self.child_mount_paths.iter().cloned());

        let mut added = Vec::new();
        for entry in &current {
            match removed.iter().position(|old| paths::paths_equal(old, entry)) {
                Some(index) => {
                    removed.swap_remove(index);
                }
                None => {
                    if !added.iter().any(|new: &String| paths::paths_equal(new, entry)) {
                        added.push(entry.clone());
                    }
                }
            }
        }
        self.rel_paths_deny_list = current;

        let root = self.tree.root();
        let deny = SetPathProperties {
            matches_deny_list: Some(true),
            ..Default::default()
        };
        for rel_path in &added {
            let abs_path = paths::join_path(&self.local_abs_path, rel_path);
            if !stat_path(&abs_path).is_some_and(|stat| stat.is_directory) {
                continue;
            }
            let mut query = PathExistence::confirmed_directory(abs_path);
            let mut outcome = SetPropertiesOutcome::default();
            self.tree.try_set_directory_properties(
                root,
                &mut query,
                rel_path,
                Inherited::default(),
                &deny,
                &mut outcome,
            );
        }

        let allow = SetPathProperties {
            matches_deny_list: Some(false),
            ..Default::default()
        };
        for rel_path in &removed {
            let mut query = PathExistence::new(paths::join_path(&self.local_abs_path, rel_path));
            let mut outcome = SetPropertiesOutcome::default();
            self.tree.try_set_directory_properties(
                root,
                &mut query,
                rel_path,
                Inherited::default(),
                &allow,
                &mut outcome,
            );
        }
    }

    /// Collect scan requests from the whole tree.
    pub fn update(&mut self, out: &mut Vec<ScanRequest>) {
        let root = self.tree.root();
        self.tree.update(root, out, Inherited::default());
    }

    pub fn first_incomplete(&self) -> Option<ScanDirId> {
        self.tree.first_incomplete(self.tree.root())
    }

    /// Exclude a nested mount's range from this mount.
    pub fn add_child_mount(&mut self, child_local_abs_path: &str, deny_lists: &DenyLists) {
        let Some(rel_path) =
            paths::try_make_child_path_relative_to(child_local_abs_path, &self.local_abs_path)
                .map(str::to_string)
        else {
            return;
        };
        if !self.child_mount_paths.iter().any(|path| paths::paths_equal(path, &rel_path)) {
            self.child_mount_paths.push(rel_path.clone());
        }
        if self.tree.has_started_scanning() {
            warn!(
                parent = %self.local_abs_path,
                child = %child_local_abs_path,
                "Directory has already started scanning when a new mount point was added under it; \
                 assets in the new mount point may be reported twice under two package names"
            );
        }
        self.update_deny_list(deny_lists);
        self.mark_dirty(&rel_path);
    }

    /// Merge a nested mount's range back into this mount.
    pub fn remove_child_mount(
        &mut self,
        child_local_abs_path: &str,
        child_has_started_scanning: bool,
        deny_lists: &DenyLists,
    ) {
        let Some(rel_path) =
            paths::try_make_child_path_relative_to(child_local_abs_path, &self.local_abs_path)
                .map(str::to_string)
        else {
            return;
        };
        let before = self.child_mount_paths.len();
        self.child_mount_paths
            .retain(|path| !paths::paths_equal(path, &rel_path));
        if self.child_mount_paths.len() == before {
            return;
        }
        if child_has_started_scanning {
            warn!(
                child = %child_local_abs_path,
                parent = %self.local_abs_path,
                "Directory has already started scanning when it was merged into its parent mount; \
                 assets in it may be reported twice under two package names"
            );
        }
        self.update_deny_list(deny_lists);
        self.mark_dirty(&rel_path);
    }

    /// Whether a mount-relative path lies inside a nested mount.
    pub fn is_child_mount_path(&self, mount_rel_path: &str) -> bool {
        self.child_mount_paths
            .iter()
            .any(|child| paths::is_parent_path_of(child, mount_rel_path))
    }

    /// Mark the node for `mount_rel_path` and its ancestors for revisiting.
    ///
    /// When the exact node exists its descendants are marked too.
    pub fn mark_dirty(&mut self, mount_rel_path: &str) {
        let root = self.tree.root();
        if let Some(controlling) =
            self.tree
                .controlling_dir(root, mount_rel_path, true, Inherited::default())
        {
            self.tree
                .mark_dirty(controlling.id, controlling.rel_path.is_empty());
        }
    }

    pub fn shrink(&mut self) {
        self.tree.shrink();
        self.child_mount_paths.shrink_to_fit();
        self.rel_paths_deny_list.shrink_to_fit();
    }
}
