//! Work queue of discovered files waiting to be gathered.

use std::collections::VecDeque;

use assetgather_core::paths;

use crate::path_data::{GatheredPathData, Priority};

/// Files waiting to be read, grouped by directory.
///
/// Files added by directory live in a prefix tree and are popped depth
/// first, most recently added subtree first. Files that a caller is blocked
/// on live in a separate queue that is always drained before the tree.
/// Files whose read must wait for host startup live in a retry queue and are
/// not counted as available.
#[derive(Debug, Default)]
pub struct FilesToSearch {
    root: TreeNode,
    blocking_files: VecDeque<GatheredPathData>,
    later_retry_files: VecDeque<GatheredPathData>,
    available_files: usize,
}

impl FilesToSearch {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a file ahead of all tree files.
    pub fn add_priority_file(&mut self, file: GatheredPathData) {
        self.available_files += 1;
        self.blocking_files.push_back(file);
    }

    /// Queue the files of one directory.
    pub fn add_directory(&mut self, dir_abs_path: &str, files: Vec<GatheredPathData>) {
        if files.is_empty() {
            return;
        }
        self.available_files += files.len();
        self.root.find_or_add_node(dir_abs_path).files.extend(files);
    }

    /// Requeue a file whose read was canceled, at the very front.
    pub fn add_file_again_after_timeout(&mut self, file: GatheredPathData) {
        self.available_files += 1;
        self.blocking_files.push_front(file);
    }

    /// Park a file until [`retry_later_retry_files`](Self::retry_later_retry_files).
    pub fn add_file_for_later_retry(&mut self, file: GatheredPathData) {
        self.later_retry_files.push_back(file);
    }

    /// Move every parked file back into the tree.
    pub fn retry_later_retry_files(&mut self) {
        while let Some(file) = self.later_retry_files.pop_front() {
            let dir = paths::parent_path(&file.local_abs_path).to_string();
            self.available_files += 1;
            self.root.find_or_add_node(&dir).files.push(file);
        }
    }

    /// Pop up to `count` files, blocking files first.
    pub fn pop_front(&mut self, out: &mut Vec<GatheredPathData>, count: usize) {
        let before = out.len();
        let mut remaining = count;
        while remaining > 0 {
            let Some(file) = self.blocking_files.pop_front() else {
                break;
            };
            out.push(file);
            remaining -= 1;
        }
        self.root.pop_files(out, &mut remaining);
        self.available_files -= out.len() - before;
    }

    /// Move the files of `local_abs_path` into the blocking queue.
    ///
    /// The path may name a directory in the tree, whose files and
    /// descendants' files are all moved, or a file, whose queued entries are
    /// matched ignoring extension. Only `Blocking` requests reorder anything;
    /// every request releases the retry queue first.
    pub fn prioritize_path(&mut self, local_abs_path: &str, priority: Priority) {
        self.retry_later_retry_files();

        if priority > Priority::Blocking {
            return;
        }

        let (node, remaining) = self.root.find_closest_parent_node(local_abs_path);
        if remaining.is_empty() {
            node.pop_all_files(&mut self.blocking_files);
        } else if paths::is_path_leaf(remaining) {
            node.pop_matching_direct_files(&mut self.blocking_files, local_abs_path);
        }
    }

    /// Number of files in the blocking queue.
    pub fn num_blocking_files(&self) -> usize {
        self.blocking_files.len()
    }

    /// Number of files that can be popped now.
    pub fn num_available(&self) -> usize {
        self.available_files
    }

    /// Total number of queued files, including parked ones.
    pub fn num(&self) -> usize {
        self.available_files + self.later_retry_files.len()
    }

    /// Release unused capacity.
    pub fn shrink(&mut self) {
        self.blocking_files.shrink_to_fit();
        self.later_retry_files.shrink_to_fit();
        self.root.shrink();
    }
}

#[derive(Debug, Default)]
struct TreeNode {
    rel_path: String,
    files: Vec<GatheredPathData>,
    sub_dirs: Vec<TreeNode>,
}

impl TreeNode {
    fn new(rel_path: &str) -> Self {
        Self {
            rel_path: rel_path.to_string(),
            ..Self::default()
        }
    }

    fn lower_bound(&self, name: &str) -> usize {
        self.sub_dirs
            .partition_point(|sub_dir| paths::path_cmp(&sub_dir.rel_path, name).is_lt())
    }

    fn find_sub_dir_index(&self, name: &str) -> Option<usize> {
        let index = self.lower_bound(name);
        self.sub_dirs
            .get(index)
            .filter(|sub_dir| paths::paths_equal(&sub_dir.rel_path, name))
            .map(|_| index)
    }

    fn find_or_add_node(&mut self, rel_path: &str) -> &mut TreeNode {
        let (first, rest) = paths::split_first_component(rel_path);
        if first.is_empty() {
            return self;
        }
        let index = match self.find_sub_dir_index(first) {
            Some(index) => index,
            None => {
                let index = self.lower_bound(first);
                self.sub_dirs.insert(index, TreeNode::new(first));
                index
            }
        };
        self.sub_dirs[index].find_or_add_node(rest)
    }

    fn find_closest_parent_node<'a, 'p>(&'a mut self, rel_path: &'p str) -> (&'a mut TreeNode, &'p str) {
        let (first, rest) = paths::split_first_component(rel_path);
        if first.is_empty() {
            return (self, "");
        }
        match self.find_sub_dir_index(first) {
            Some(index) => self.sub_dirs[index].find_closest_parent_node(rest),
            None => (self, rel_path.trim_start_matches(['/', '\\'])),
        }
    }

    fn pop_files(&mut self, out: &mut Vec<GatheredPathData>, remaining: &mut usize) {
        while *remaining > 0 {
            let Some(file) = self.files.pop() else {
                break;
            };
            out.push(file);
            *remaining -= 1;
        }
        while *remaining > 0 {
            let Some(sub_dir) = self.sub_dirs.last_mut() else {
                break;
            };
            sub_dir.pop_files(out, remaining);
            if sub_dir.is_empty() {
                self.sub_dirs.pop();
            }
        }
    }

    fn pop_all_files(&mut self, out: &mut VecDeque<GatheredPathData>) {
        while let Some(file) = self.files.pop() {
            out.push_back(file);
        }
        while let Some(mut sub_dir) = self.sub_dirs.pop() {
            sub_dir.pop_all_files(out);
        }
    }

    fn pop_matching_direct_files(&mut self, out: &mut VecDeque<GatheredPathData>, file_abs_path: &str) {
        let wanted = paths::base_filename_with_path(file_abs_path);
        let mut index = 0;
        while index < self.files.len() {
            if paths::paths_equal(paths::base_filename_with_path(&self.files[index].local_abs_path), wanted) {
                out.push_back(self.files.remove(index));
            } else {
                index += 1;
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.sub_dirs.is_empty()
    }

    fn shrink(&mut self) {
        self.files.shrink_to_fit();
        self.sub_dirs.retain(|sub_dir| !sub_dir.is_empty());
        self.sub_dirs.shrink_to_fit();
        for sub_dir in &mut self.sub_dirs {
            sub_dir.shrink();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assetgather_core::GatherableFileType;
    use chrono::Utc;

    fn file(path: &str) -> GatheredPathData {
        GatheredPathData::new(
            path,
            paths::base_filename_with_path(path),
            Utc::now(),
            GatherableFileType::PackageFile,
        )
    }

    fn pop_paths(queue: &mut FilesToSearch, count: usize) -> Vec<String> {
        let mut out = Vec::new();
        queue.pop_front(&mut out, count);
        out.into_iter().map(|f| f.local_abs_path).collect()
    }

    #[test]
    fn test_blocking_files_pop_before_tree() {
        let mut queue = FilesToSearch::new();
        queue.add_directory("/Game", vec![file("/Game/B.pkg")]);
        queue.add_priority_file(file("/Game/A.pkg"));

        assert_eq!(queue.num(), 2);
        assert_eq!(pop_paths(&mut queue, 1), vec!["/Game/A.pkg"]);
        assert_eq!(pop_paths(&mut queue, 1), vec!["/Game/B.pkg"]);
        assert_eq!(queue.num(), 0);
    }

    #[test]
    fn test_tree_pops_lifo_depth_first() {
        let mut queue = FilesToSearch::new();
        queue.add_directory("/Game", vec![file("/Game/A.pkg"), file("/Game/B.pkg")]);
        queue.add_directory("/Game/Sub", vec![file("/Game/Sub/C.pkg")]);
        queue.add_directory("/Game/Zed", vec![file("/Game/Zed/D.pkg")]);

        assert_eq!(
            pop_paths(&mut queue, 10),
            vec!["/Game/B.pkg", "/Game/A.pkg", "/Game/Zed/D.pkg", "/Game/Sub/C.pkg"]
        );
        assert_eq!(queue.num_available(), 0);
    }

    #[test]
    fn test_prioritize_directory_moves_subtree() {
        let mut queue = FilesToSearch::new();
        queue.add_directory("/Game", vec![file("/Game/A.pkg")]);
        queue.add_directory("/Game/Sub", vec![file("/Game/Sub/B.pkg")]);
        queue.add_directory("/Game/Sub/Deep", vec![file("/Game/Sub/Deep/C.pkg")]);

        queue.prioritize_path("/Game/Sub", Priority::Blocking);
        assert_eq!(queue.num_blocking_files(), 2);
        assert_eq!(queue.num_available(), 3);

        let popped = pop_paths(&mut queue, 2);
        assert!(popped.contains(&"/Game/Sub/B.pkg".to_string()));
        assert!(popped.contains(&"/Game/Sub/Deep/C.pkg".to_string()));
        assert_eq!(pop_paths(&mut queue, 5), vec!["/Game/A.pkg"]);
    }

    #[test]
    fn test_prioritize_file_ignores_extension() {
        let mut queue = FilesToSearch::new();
        queue.add_directory("/Game", vec![file("/Game/A.pkg"), file("/Game/B.umap")]);

        queue.prioritize_path("/Game/A", Priority::Blocking);
        assert_eq!(queue.num_blocking_files(), 1);
        assert_eq!(pop_paths(&mut queue, 1), vec!["/Game/A.pkg"]);

        // Unknown grandparent: nothing to move
        queue.prioritize_path("/Game/Missing/Deeper/X", Priority::Blocking);
        assert_eq!(queue.num_blocking_files(), 0);
    }

    #[test]
    fn test_high_priority_does_not_reorder() {
        let mut queue = FilesToSearch::new();
        queue.add_directory("/Game/Sub", vec![file("/Game/Sub/B.pkg")]);
        queue.prioritize_path("/Game/Sub", Priority::High);
        assert_eq!(queue.num_blocking_files(), 0);
    }

    #[test]
    fn test_later_retry_counts_but_is_not_available() {
        let mut queue = FilesToSearch::new();
        queue.add_file_for_later_retry(file("/Game/Plugin/P.pkg"));
        assert_eq!(queue.num(), 1);
        assert_eq!(queue.num_available(), 0);
        assert!(pop_paths(&mut queue, 4).is_empty());

        queue.retry_later_retry_files();
        assert_eq!(queue.num_available(), 1);
        assert_eq!(pop_paths(&mut queue, 4), vec!["/Game/Plugin/P.pkg"]);
    }

    #[test]
    fn test_requeue_after_timeout_goes_first() {
        let mut queue = FilesToSearch::new();
        queue.add_priority_file(file("/Game/A.pkg"));
        queue.add_file_again_after_timeout(file("/Game/Canceled.pkg"));
        assert_eq!(pop_paths(&mut queue, 1), vec!["/Game/Canceled.pkg"]);
    }
}
