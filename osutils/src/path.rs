use std::path::{Path, PathBuf};

/// Joins `relative` below `base`, treating an absolute `relative` as if it
/// were relative to `base`.
pub fn join_relative(base: impl AsRef<Path>, relative: impl AsRef<Path>) -> PathBuf {
    let relative = relative.as_ref();
    base.as_ref()
        .join(relative.strip_prefix("/").unwrap_or(relative))
}

/// Inverse of `join_relative`: the absolute path `path` has inside the tree
/// rooted at `root`, or `None` when `path` is outside of it.
pub fn within_root(root: impl AsRef<Path>, path: impl AsRef<Path>) -> Option<PathBuf> {
    path.as_ref()
        .strip_prefix(root.as_ref())
        .ok()
        .map(|inner| Path::new("/").join(inner))
}
