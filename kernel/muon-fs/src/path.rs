//! Path parsing and normalisation.
//!
//! Paths in the core are `/`-separated; everything the VFS consumes is
//! absolute after [`join`] has combined the cwd with whatever the caller
//! typed.

use alloc::string::String;
use alloc::vec::Vec;

/// Splits a path into non-empty components.
///
/// Leading, trailing, and repeated slashes disappear.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Returns `true` if the path starts with `/`.
#[must_use]
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Splits an absolute path into `(parent, basename)`.
///
/// `"/d/f"` becomes `("/d", "f")`; a top-level name's parent is `"/"`.
/// Returns `None` for the root itself or a path with no components.
#[must_use]
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let idx = trimmed.rfind('/')?;
    let base = &trimmed[idx + 1..];
    if base.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, base))
}

/// Joins `rel` onto the absolute directory `cwd` and normalises the result.
///
/// An absolute `rel` ignores `cwd`. `.` and `..` components are resolved;
/// `..` at the root stays at the root.
#[must_use]
pub fn join(cwd: &str, rel: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();

    let start = if is_absolute(rel) { "" } else { cwd };
    for comp in components(start).chain(components(rel)) {
        match comp {
            "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    if stack.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for comp in stack {
        out.push('/');
        out.push_str(comp);
    }
    out
}

/// Normalises an absolute path: collapses slashes, resolves `.` / `..`,
/// and strips any trailing slash except on the root.
#[must_use]
pub fn normalize(path: &str) -> String {
    join("/", path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_skip_empty_segments() {
        let parts: Vec<&str> = components("//usr///bin/ls/").collect();
        assert_eq!(parts, ["usr", "bin", "ls"]);
        assert_eq!(components("/").count(), 0);
    }

    #[test]
    fn split_parent_handles_depths() {
        assert_eq!(split_parent("/d/f"), Some(("/d", "f")));
        assert_eq!(split_parent("/top"), Some(("/", "top")));
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b", "c")));
        assert_eq!(split_parent("/"), None);
    }

    #[test]
    fn join_resolves_relative_paths() {
        assert_eq!(join("/home", "docs"), "/home/docs");
        assert_eq!(join("/home", "/etc"), "/etc");
        assert_eq!(join("/home/docs", ".."), "/home");
        assert_eq!(join("/", ".."), "/");
        assert_eq!(join("/a", "./b/../c"), "/a/c");
    }

    #[test]
    fn normalize_strips_trailing_slash_except_root() {
        assert_eq!(normalize("/d/"), "/d");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("//x//y//"), "/x/y");
    }
}
