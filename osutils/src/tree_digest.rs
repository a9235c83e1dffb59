use std::{fs::File, io, path::Path};

use anyhow::{Context, Error};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// SHA-256 over the relative paths, kinds and contents of every entry below
/// `root`, visited in file-name order. Two trees with equal digests hold the
/// same files with the same contents.
///
/// Entries whose path relative to `root` is listed in `excludes` are skipped
/// together with everything below them.
pub fn digest(root: impl AsRef<Path>, excludes: &[&Path]) -> Result<String, Error> {
    let root = root.as_ref();
    let mut hasher = Sha256::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.path()
                .strip_prefix(root)
                .map(|rel| !excludes.iter().any(|x| rel == *x))
                .unwrap_or(true)
        });

    for entry in walker {
        let entry =
            entry.with_context(|| format!("Failed to walk directory '{}'", root.display()))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("'{}' escaped the walk root", entry.path().display()))?;

        let kind: &[u8] = if entry.file_type().is_dir() {
            b"d"
        } else if entry.file_type().is_symlink() {
            b"l"
        } else {
            b"f"
        };
        hasher.update(kind);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);

        if entry.file_type().is_file() {
            let mut file = File::open(entry.path())
                .with_context(|| format!("Failed to open '{}'", entry.path().display()))?;
            io::copy(&mut file, &mut hasher)
                .with_context(|| format!("Failed to read '{}'", entry.path().display()))?;
        }
    }

    Ok(hex::encode(hasher.finalize()))
}
