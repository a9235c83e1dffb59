use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use sys_mount::{Mount, MountFlags, Unmount, UnmountFlags};

use mirroot_api::error::{ConfigurationError, MirrootError, ReportError};

use crate::{dependencies::Dependency, files, path::join_relative};

/// Host directories bound into the new root, in mount order.
pub const SPECIAL_DIRS: &[&str] = &["/dev", "/dev/pts", "/proc", "/sys", "/run"];

/// Separate filesystem below `/sys` that grub-install needs to register boot
/// entries. Bound only when the host has it.
const EFIVARS_DIR: &str = "/sys/firmware/efi/efivars";

/// Bind mounts of the host's special directories below a new root. Commands
/// run inside it through the `chroot` binary, so the installer process itself
/// never changes its root.
///
/// Dropping this object does *not* unmount anything. Call `release()`.
pub struct ChrootEnvironment {
    root: PathBuf,
    mounts: Vec<(PathBuf, Mount)>,
}

impl ChrootEnvironment {
    pub fn enter(root: impl AsRef<Path>) -> Result<Self, MirrootError> {
        let mut environment = ChrootEnvironment {
            root: root.as_ref().to_path_buf(),
            mounts: Vec::new(),
        };

        info!(
            "Binding special directories into '{}'",
            environment.root.display()
        );
        let efivars = Path::new(EFIVARS_DIR).is_dir().then_some(EFIVARS_DIR);
        for dir in SPECIAL_DIRS.iter().copied().chain(efivars) {
            if let Err(e) = environment.bind(dir) {
                if let Err(secondary) = environment.release() {
                    return Err(e.secondary_error_context(secondary));
                }
                return Err(e);
            }
        }

        Ok(environment)
    }

    fn bind(&mut self, dir: &str) -> Result<(), MirrootError> {
        let target = join_relative(&self.root, dir);
        files::create_dirs(&target).structured(ConfigurationError::ChrootMountSpecialDir {
            dir: dir.to_string(),
        })?;
        let mount = Mount::builder()
            .flags(MountFlags::BIND)
            .mount(dir, &target)
            .structured(ConfigurationError::ChrootMountSpecialDir {
                dir: dir.to_string(),
            })?;
        debug!("Bound '{dir}' to '{}'", target.display());
        self.mounts.push((target, mount));
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs `program` with `args` inside the new root.
    pub fn run<I, S>(&self, program: &str, args: I) -> Result<(), MirrootError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command(program, args)
            .run_and_check()
            .structured(ConfigurationError::ChrootCommand {
                command: program.to_string(),
            })
    }

    fn command<I, S>(&self, program: &str, args: I) -> crate::dependencies::Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Dependency::Chroot.cmd();
        cmd.arg(&self.root)
            .arg(program)
            .args(args)
            .env("DEBIAN_FRONTEND", "noninteractive")
            .env("LC_ALL", "C.UTF-8");
        cmd
    }

    /// Unmounts the special directories in reverse order. Every mount is
    /// attempted even if an earlier one fails; the first failure is returned.
    pub fn release(&mut self) -> Result<(), MirrootError> {
        let mut first_error = None;
        while let Some((target, mount)) = self.mounts.pop() {
            let result = mount.unmount(UnmountFlags::empty()).or_else(|e| {
                warn!(
                    "Failed to unmount '{}', detaching: {e}",
                    target.display()
                );
                mount.unmount(UnmountFlags::DETACH)
            });
            if let Err(e) = result {
                warn!("Failed to detach '{}': {e}", target.display());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e).structured(ConfigurationError::ChrootUnmountSpecialDir),
            None => {
                info!("Released chroot environment '{}'", self.root.display());
                Ok(())
            }
        }
    }

    pub fn is_active(&self) -> bool {
        !self.mounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_dirs_order() {
        // /dev must be bound before /dev/pts, which lives on top of it.
        let dev = SPECIAL_DIRS.iter().position(|d| *d == "/dev").unwrap();
        let pts = SPECIAL_DIRS.iter().position(|d| *d == "/dev/pts").unwrap();
        assert!(dev < pts);
    }

    #[test]
    fn test_release_empty_environment() {
        let mut environment = ChrootEnvironment {
            root: PathBuf::from("/mnt/mirroot"),
            mounts: Vec::new(),
        };
        assert!(!environment.is_active());
        environment.release().unwrap();
        assert_eq!(
            environment
                .command("update-grub", ["--help"])
                .render_command(),
            "chroot /mnt/mirroot update-grub --help"
        );
    }
}
