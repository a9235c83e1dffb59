use std::{fs, path::Path};

use anyhow::{bail, Context, Error};
use log::warn;

use crate::{dependencies::Dependency, files};

/// Mounts block device `device` on `mount_dir`.
pub fn mount(
    device: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    fstype: Option<&str>,
    options: &[&str],
) -> Result<(), Error> {
    let mut cmd = Dependency::Mount.cmd();
    if let Some(fstype) = fstype {
        cmd.arg("-t").arg(fstype);
    }
    if !options.is_empty() {
        cmd.arg("-o").arg(options.join(","));
    }
    cmd.arg(device.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} to path {}",
            device.as_ref().display(),
            mount_dir.as_ref().display(),
        ))
}

/// Unmounts `mount_dir`, and everything below it when `recursive` is set.
pub fn umount(mount_dir: impl AsRef<Path>, recursive: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Umount.cmd();
    if recursive {
        cmd.arg("-R");
    }
    cmd.arg(mount_dir.as_ref()).run_and_check().context(format!(
        "Failed to unmount directory {}",
        mount_dir.as_ref().display()
    ))
}

/// Unmounts recursively, falling back to a lazy unmount so a busy tree never
/// blocks cleanup.
pub fn umount_or_detach(mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    match umount(mount_dir.as_ref(), true) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                "Unmounting '{}' failed, detaching instead: {e:?}",
                mount_dir.as_ref().display()
            );
            Dependency::Umount
                .cmd()
                .arg("-R")
                .arg("--lazy")
                .arg(mount_dir.as_ref())
                .run_and_check()
                .context(format!(
                    "Failed to detach directory {}",
                    mount_dir.as_ref().display()
                ))
        }
    }
}

/// Ensure that the target_path is a suitable path for a mount point
pub fn ensure_mount_directory(target_path: &Path) -> Result<(), Error> {
    if target_path.exists() {
        if !target_path.is_dir() {
            bail!("Mount path '{}' is not a directory", target_path.display());
        }
        if let Ok(entries) = fs::read_dir(target_path) {
            if entries.count() > 0 {
                bail!("Mount path '{}' is not empty", target_path.display());
            }
        }
    } else {
        files::create_dirs(target_path).context(format!(
            "Failed to create mount path '{}'",
            target_path.display()
        ))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_ensure_mount_directory() {
        let temp_mount_dir = TempDir::new().unwrap();

        // Exists and is empty
        ensure_mount_directory(temp_mount_dir.path()).unwrap();

        // Does not exist yet
        let temp_mount_point_dir = temp_mount_dir.path().join("boot/efi");
        ensure_mount_directory(&temp_mount_point_dir).unwrap();
        assert!(temp_mount_point_dir.exists());

        // Exists and is not empty
        assert_eq!(
            ensure_mount_directory(temp_mount_dir.path())
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not empty",
                temp_mount_dir.path().display()
            )
        );

        // A file
        let temp_mount_point_file = temp_mount_dir.path().join("temp_file");
        File::create(&temp_mount_point_file).unwrap();
        assert_eq!(
            ensure_mount_directory(&temp_mount_point_file)
                .unwrap_err()
                .to_string(),
            format!(
                "Mount path '{}' is not a directory",
                temp_mount_point_file.display()
            )
        );
    }
}
