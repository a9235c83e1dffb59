use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Makes `destination` an exact copy of `source`. Both are directories.
/// Ownership and permissions are not carried, as FAT has neither.
///
/// `excludes` are paths relative to both roots that are neither copied nor
/// deleted on the destination.
pub fn mirror_tree(source: &Path, destination: &Path, excludes: &[&Path]) -> Result<(), Error> {
    Dependency::Rsync
        .cmd()
        .args(mirror_args(source, destination, excludes))
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to copy '{}' to '{}'",
                source.display(),
                destination.display()
            )
        })
}

fn mirror_args(source: &Path, destination: &Path, excludes: &[&Path]) -> Vec<String> {
    // A trailing slash copies the contents rather than the directory itself.
    let with_slash = |p: &Path| format!("{}/", p.display().to_string().trim_end_matches('/'));
    let mut args: Vec<String> = vec![
        "--recursive".into(),
        "--times".into(),
        "--checksum".into(),
        "--delete".into(),
        "--modify-window=2".into(),
    ];
    // Anchored at the transfer root.
    args.extend(excludes.iter().map(|e| {
        format!(
            "--exclude=/{}",
            e.display().to_string().trim_matches('/')
        )
    }));
    args.push(with_slash(source));
    args.push(with_slash(destination));
    args
}
