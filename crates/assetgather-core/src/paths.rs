//! String path helpers.
//!
//! Local paths are kept as `/`-separated strings so mount-relative paths and
//! long package names can share the same component logic. Comparisons are
//! ASCII case-insensitive and treat `\` and `/` as the same separator.

use std::cmp::Ordering;
use std::path::Path;

/// Characters that may not appear in a long package name.
pub const INVALID_PACKAGE_CHARS: &str = "\\:*?\"<>|' ,.&!~\n\r\t@#";

/// What kind of gatherable entry a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatherableFileType {
    /// Not gatherable.
    Invalid,
    /// A directory that may contain packages.
    Directory,
    /// A package file with a recognized extension.
    PackageFile,
}

fn is_separator(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

fn fold(c: u8) -> u8 {
    if is_separator(c) { b'/' } else { c.to_ascii_lowercase() }
}

/// Order two paths ignoring ASCII case.
pub fn path_cmp(a: &str, b: &str) -> Ordering {
    a.bytes().map(fold).cmp(b.bytes().map(fold))
}

/// Compare two paths for equality ignoring ASCII case.
pub fn paths_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && path_cmp(a, b) == Ordering::Equal
}

fn starts_with_folded(path: &str, prefix: &str) -> bool {
    path.len() >= prefix.len() && paths_equal(&path[..prefix.len()], prefix)
}

/// Whether `parent` equals `child` or is one of its ancestors.
///
/// An empty parent is the parent of every relative path.
pub fn is_parent_path_of(parent: &str, child: &str) -> bool {
    try_make_child_path_relative_to(child, parent).is_some()
}

/// Return `child` relative to `parent`, or `None` if it is not inside it.
pub fn try_make_child_path_relative_to<'a>(child: &'a str, parent: &str) -> Option<&'a str> {
    let parent = parent.trim_end_matches(['/', '\\']);
    if parent.is_empty() {
        return Some(child.trim_start_matches(['/', '\\']));
    }
    if !child.is_char_boundary(parent.len().min(child.len())) || !starts_with_folded(child, parent) {
        return None;
    }
    let rest = &child[parent.len()..];
    if rest.is_empty() {
        return Some(rest);
    }
    if is_separator(rest.as_bytes()[0]) {
        Some(rest.trim_start_matches(['/', '\\']))
    } else {
        None
    }
}

/// Split a relative path into its first component and the remainder.
pub fn split_first_component(path: &str) -> (&str, &str) {
    let path = path.trim_start_matches(['/', '\\']);
    match path.find(['/', '\\']) {
        Some(pos) => (&path[..pos], path[pos + 1..].trim_start_matches(['/', '\\'])),
        None => (path, ""),
    }
}

/// Append a relative path to `base`, inserting one separator.
pub fn append_path(base: &mut String, relative: &str) {
    let relative = relative.trim_start_matches(['/', '\\']);
    if relative.is_empty() {
        return;
    }
    if !base.is_empty() && !base.ends_with(['/', '\\']) {
        base.push('/');
    }
    base.push_str(relative);
}

/// Join two paths into a new string.
pub fn join_path(base: &str, relative: &str) -> String {
    let mut joined = base.to_string();
    append_path(&mut joined, relative);
    joined
}

/// Parent directory of a path, without trailing separator.
pub fn parent_path(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(0) => &path[..1],
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Final component of a path.
pub fn clean_filename(path: &str) -> &str {
    match path.rfind(['/', '\\']) {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Final component without its extension.
pub fn base_filename(path: &str) -> &str {
    let leaf = clean_filename(path);
    match leaf.rfind('.') {
        Some(pos) if pos > 0 => &leaf[..pos],
        _ => leaf,
    }
}

/// Full path with the extension of the final component removed.
pub fn base_filename_with_path(path: &str) -> &str {
    let leaf_start = path.len() - clean_filename(path).len();
    let base_len = base_filename(path).len();
    &path[..leaf_start + base_len]
}

/// Extension of the final component, without the dot.
pub fn extension(path: &str) -> &str {
    let leaf = clean_filename(path);
    match leaf.rfind('.') {
        Some(pos) if pos > 0 => &leaf[pos + 1..],
        _ => "",
    }
}

/// Whether a relative path has a single component.
pub fn is_path_leaf(path: &str) -> bool {
    !path.trim_end_matches(['/', '\\']).contains(['/', '\\'])
}

/// Convert a local path to the normalized absolute form used as a key.
///
/// Backslashes become `/`, redundant separators and trailing separators are
/// removed. Relative paths are resolved against the working directory.
pub fn normalize_local_path(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let text = absolute.to_string_lossy().replace('\\', "/");
    let leading = text.starts_with('/');
    let mut normalized = String::with_capacity(text.len());
    if leading {
        normalized.push('/');
    }
    for component in text.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if component == ".." {
            let cut = normalized.rfind('/').unwrap_or(0);
            normalized.truncate(if cut == 0 && leading { 1 } else { cut });
            continue;
        }
        append_path(&mut normalized, component);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    normalized
}

/// Whether a name contains characters that are invalid in package names.
pub fn contains_invalid_package_chars(name: &str) -> bool {
    name.contains(|c| INVALID_PACKAGE_CHARS.contains(c))
}

/// Whether the relative path of a discovered entry can be turned into a package name.
pub fn path_contains_invalid_chars(file_type: GatherableFileType, relative_path: &str) -> bool {
    match file_type {
        GatherableFileType::Directory => relative_path
            .split(['/', '\\'])
            .any(contains_invalid_package_chars),
        GatherableFileType::PackageFile => {
            let base = base_filename_with_path(relative_path);
            base.split(['/', '\\']).any(contains_invalid_package_chars)
        }
        GatherableFileType::Invalid => true,
    }
}
