//! Base system installation and configuration of the new root.

use std::path::{Path, PathBuf};

use log::{debug, info};

use mirroot_api::{
    config::{OsConfiguration, UserConfiguration},
    constants::{KERNEL_POSTINST_HOOK_PATH, MIRROOT_BINARY_INSTALL_PATH},
    error::{ConfigurationError, MirrootError, ReportError},
};
use osutils::{chroot::ChrootEnvironment, debootstrap, files, path::join_relative};

use super::boot::templates::{Fstab, KernelPostinstHook};

/// Packages every installation needs to boot from a mirrored pool.
const BASE_PACKAGES: &[&str] = &[
    "linux-image-generic",
    "zfs-initramfs",
    "zfsutils-linux",
    "grub-efi-amd64",
    "grub-efi-amd64-signed",
    "shim-signed",
    "efibootmgr",
    "rsync",
    "dosfstools",
    "locales",
    "tzdata",
    "openssh-server",
    "sudo",
];

/// Pulled in by debootstrap itself so apt works over HTTPS in the chroot.
const BOOTSTRAP_PACKAGES: &[&str] = &["ca-certificates"];

const ZPOOL_CACHE_PATH: &str = "/etc/zfs/zpool.cache";

/// Installs and configures the operating system inside the new root.
pub trait OsProvisioner {
    /// Installs the base file tree into `root`.
    fn install_base(&self, root: &Path) -> Result<(), MirrootError>;

    /// Writes configuration that needs no process running inside the root.
    fn configure_files(&self, root: &Path) -> Result<(), MirrootError>;

    /// Installs packages and runs configuration tools inside the root.
    fn configure_chroot(&self, chroot: &ChrootEnvironment) -> Result<(), MirrootError>;
}

/// One command run inside the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChrootCommand {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl ChrootCommand {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Debian-family systems bootstrapped from an archive mirror.
#[derive(Debug, Clone)]
pub struct DebootstrapProvisioner {
    pub hostname: String,
    pub os: OsConfiguration,
    pub fstab: Fstab,

    /// The running mirroot binary, copied into the new system.
    pub binary: PathBuf,
}

impl OsProvisioner for DebootstrapProvisioner {
    fn install_base(&self, root: &Path) -> Result<(), MirrootError> {
        debootstrap::run(&self.os.suite, root, &self.os.mirror, BOOTSTRAP_PACKAGES)
            .structured(ConfigurationError::InstallBaseSystem)
    }

    fn configure_files(&self, root: &Path) -> Result<(), MirrootError> {
        write(root, "/etc/hostname", 0o644, format!("{}\n", self.hostname))?;
        write(root, "/etc/hosts", 0o644, hosts(&self.hostname))?;
        write(root, "/etc/apt/sources.list", 0o644, apt_sources(&self.os))?;
        write(root, "/etc/fstab", 0o644, self.fstab.render())?;
        write(root, "/etc/timezone", 0o644, format!("{}\n", self.os.timezone))?;
        write(
            root,
            "/etc/default/locale",
            0o644,
            format!("LANG={}\n", self.os.locale),
        )?;
        link_localtime(root, &self.os.timezone)?;

        files::copy_file_mode(
            &self.binary,
            join_relative(root, MIRROOT_BINARY_INSTALL_PATH),
            0o755,
        )
        .structured(ConfigurationError::CopyBinary)?;
        write(
            root,
            KERNEL_POSTINST_HOOK_PATH,
            0o755,
            KernelPostinstHook::default().render(),
        )?;

        remove_zpool_cache(root)
    }

    fn configure_chroot(&self, chroot: &ChrootEnvironment) -> Result<(), MirrootError> {
        for command in self.chroot_commands() {
            run_in(chroot, &command)?;
        }
        if let Some(user) = &self.os.user {
            // Only after useradd, so the home directory gets its skeleton.
            if write_authorized_keys(chroot.root(), user)? {
                for command in key_ownership_commands(user) {
                    run_in(chroot, &command)?;
                }
            }
        }
        // Package scripts may recreate it.
        remove_zpool_cache(chroot.root())
    }
}

impl DebootstrapProvisioner {
    /// Commands run in the new root, in order.
    pub fn chroot_commands(&self) -> Vec<ChrootCommand> {
        let mut commands = vec![ChrootCommand::new("apt-get", &["update"])];

        let mut install = ChrootCommand::new(
            "apt-get",
            &["install", "--yes", "--no-install-recommends"],
        );
        install.args.extend(
            BASE_PACKAGES
                .iter()
                .map(|p| p.to_string())
                .chain(self.os.extra_packages.iter().cloned()),
        );
        commands.push(install);

        commands.push(ChrootCommand::new("locale-gen", &[self.os.locale.as_str()]));
        commands.push(ChrootCommand::new(
            "update-locale",
            &[format!("LANG={}", self.os.locale).as_str()],
        ));
        commands.push(ChrootCommand::new(
            "dpkg-reconfigure",
            &["--frontend", "noninteractive", "tzdata"],
        ));

        if let Some(user) = &self.os.user {
            commands.extend(user_commands(user));
        }
        commands
    }
}

fn user_commands(user: &UserConfiguration) -> Vec<ChrootCommand> {
    let name = user.name.as_str();
    let mut commands = vec![ChrootCommand::new(
        "useradd",
        &["--create-home", "--shell", "/bin/bash", "--groups", "sudo", name],
    )];
    match &user.password_hash {
        Some(hash) => commands.push(ChrootCommand::new(
            "usermod",
            &["--password", hash.as_str(), name],
        )),
        None => commands.push(ChrootCommand::new("passwd", &["--lock", name])),
    }
    commands
}

fn ssh_dir(user: &UserConfiguration) -> String {
    format!("/home/{}/.ssh", user.name)
}

/// Writes the user's `authorized_keys` below `root`. Returns whether there
/// were any keys to write.
fn write_authorized_keys(root: &Path, user: &UserConfiguration) -> Result<bool, MirrootError> {
    if user.ssh_authorized_keys.is_empty() {
        return Ok(false);
    }
    let mut keys = user.ssh_authorized_keys.join("\n");
    keys.push('\n');
    write(
        root,
        format!("{}/authorized_keys", ssh_dir(user)),
        0o600,
        keys,
    )?;
    Ok(true)
}

/// Hands `~/.ssh` written from outside the root over to the user.
fn key_ownership_commands(user: &UserConfiguration) -> Vec<ChrootCommand> {
    let name = user.name.as_str();
    let ssh_dir = ssh_dir(user);
    vec![
        ChrootCommand::new(
            "chown",
            &["--recursive", &format!("{name}:{name}"), &ssh_dir],
        ),
        ChrootCommand::new("chmod", &["0700", &ssh_dir]),
    ]
}

fn run_in(chroot: &ChrootEnvironment, command: &ChrootCommand) -> Result<(), MirrootError> {
    info!("Running '{}' in the new root", command.program);
    debug!("Arguments: {:?}", command.args);
    chroot.run(command.program, &command.args)
}

fn write(
    root: &Path,
    path: impl AsRef<Path>,
    mode: u32,
    contents: impl AsRef<[u8]>,
) -> Result<(), MirrootError> {
    let target = join_relative(root, path.as_ref());
    files::write_file(&target, mode, contents.as_ref()).structured(
        ConfigurationError::WriteFile {
            path: path.as_ref().display().to_string(),
        },
    )?;
    debug!("Wrote '{}'", target.display());
    Ok(())
}

fn hosts(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         127.0.1.1\t{hostname}\n\
         \n\
         ::1\tlocalhost ip6-localhost ip6-loopback\n\
         ff02::1\tip6-allnodes\n\
         ff02::2\tip6-allrouters\n"
    )
}

fn apt_sources(os: &OsConfiguration) -> String {
    const COMPONENTS: &str = "main restricted universe multiverse";
    ["", "-updates", "-security"]
        .iter()
        .map(|pocket| format!("deb {} {}{pocket} {COMPONENTS}\n", os.mirror, os.suite))
        .collect()
}

fn link_localtime(root: &Path, timezone: &str) -> Result<(), MirrootError> {
    let link = join_relative(root, "/etc/localtime");
    let error = || ConfigurationError::WriteFile {
        path: "/etc/localtime".into(),
    };
    files::remove_file_if_exists(&link).structured(error())?;
    std::os::unix::fs::symlink(Path::new("/usr/share/zoneinfo").join(timezone), &link)
        .structured(error())
}

fn remove_zpool_cache(root: &Path) -> Result<(), MirrootError> {
    if files::remove_file_if_exists(join_relative(root, ZPOOL_CACHE_PATH)).structured(
        ConfigurationError::WriteFile {
            path: ZPOOL_CACHE_PATH.into(),
        },
    )? {
        info!("Removed '{ZPOOL_CACHE_PATH}' from the new root");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;

    use crate::engine::boot::templates::FstabEntry;

    fn provisioner(binary: PathBuf) -> DebootstrapProvisioner {
        DebootstrapProvisioner {
            hostname: "zfs-host01".into(),
            os: OsConfiguration::default(),
            fstab: Fstab {
                entries: vec![FstabEntry::esp("84A0-088E", "/boot/efi")],
            },
            binary,
        }
    }

    #[test]
    fn test_configure_files() {
        let root = tempfile::tempdir().unwrap();
        let binary = root.path().join("mirroot-src");
        std::fs::write(&binary, b"\x7fELF").unwrap();
        let cache = root.path().join("etc/zfs/zpool.cache");
        std::fs::create_dir_all(cache.parent().unwrap()).unwrap();
        std::fs::write(&cache, b"stale").unwrap();

        let mut provisioner = provisioner(binary);
        provisioner.os.user = Some(UserConfiguration {
            name: "ops".into(),
            password_hash: None,
            ssh_authorized_keys: vec!["ssh-ed25519 AAAA ops@example".into()],
        });
        provisioner.configure_files(root.path()).unwrap();

        let read = |p: &str| std::fs::read_to_string(root.path().join(p)).unwrap();
        assert_eq!(read("etc/hostname"), "zfs-host01\n");
        assert!(read("etc/hosts").contains("127.0.1.1\tzfs-host01\n"));
        assert!(read("etc/fstab").contains("UUID=84A0-088E /boot/efi vfat"));
        assert_eq!(read("etc/timezone"), "UTC\n");
        assert_eq!(read("etc/default/locale"), "LANG=en_US.UTF-8\n");
        // The home directory is left for useradd to create.
        assert!(!root.path().join("home/ops").exists());
        assert_eq!(
            std::fs::read_link(root.path().join("etc/localtime")).unwrap(),
            Path::new("/usr/share/zoneinfo/UTC")
        );

        let hook = root.path().join("etc/kernel/postinst.d/zz-mirroot-sync-esp");
        assert_eq!(
            std::fs::metadata(&hook).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert!(root.path().join("usr/local/sbin/mirroot").exists());
        assert!(!cache.exists());

        // Running again over the same root is harmless.
        provisioner.configure_files(root.path()).unwrap();
    }

    #[test]
    fn test_apt_sources() {
        assert_eq!(
            apt_sources(&OsConfiguration::default()),
            "deb http://archive.ubuntu.com/ubuntu noble main restricted universe multiverse\n\
             deb http://archive.ubuntu.com/ubuntu noble-updates main restricted universe multiverse\n\
             deb http://archive.ubuntu.com/ubuntu noble-security main restricted universe multiverse\n"
        );
    }

    #[test]
    fn test_chroot_commands() {
        let mut provisioner = provisioner(PathBuf::new());
        provisioner.os.extra_packages = vec!["vim".into()];
        let commands = provisioner.chroot_commands();
        let programs: Vec<&str> = commands.iter().map(|c| c.program).collect();
        assert_eq!(
            programs,
            ["apt-get", "apt-get", "locale-gen", "update-locale", "dpkg-reconfigure"]
        );
        assert_eq!(commands[1].args.last().unwrap(), "vim");
        assert!(commands[1].args.contains(&"zfs-initramfs".to_string()));
    }

    #[test]
    fn test_user_commands() {
        let user = UserConfiguration {
            name: "ops".into(),
            password_hash: Some("$6$salt$hash".into()),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAA".into()],
        };
        let commands = user_commands(&user);
        assert_eq!(commands[0].args.last().unwrap(), "ops");
        assert_eq!(
            commands[1],
            ChrootCommand::new("usermod", &["--password", "$6$salt$hash", "ops"])
        );
        assert_eq!(commands.len(), 2);

        let locked = user_commands(&UserConfiguration {
            password_hash: None,
            ssh_authorized_keys: vec![],
            ..user
        });
        assert_eq!(locked.len(), 2);
        assert_eq!(locked[1], ChrootCommand::new("passwd", &["--lock", "ops"]));
    }

    #[test]
    fn test_authorized_keys() {
        let root = tempfile::tempdir().unwrap();
        let user = UserConfiguration {
            name: "ops".into(),
            password_hash: None,
            ssh_authorized_keys: vec!["ssh-ed25519 AAAA ops@example".into(), "ssh-rsa BBBB".into()],
        };
        assert!(write_authorized_keys(root.path(), &user).unwrap());

        let keys = root.path().join("home/ops/.ssh/authorized_keys");
        assert_eq!(
            std::fs::read_to_string(&keys).unwrap(),
            "ssh-ed25519 AAAA ops@example\nssh-rsa BBBB\n"
        );
        assert_eq!(
            std::fs::metadata(&keys).unwrap().permissions().mode() & 0o777,
            0o600
        );

        let commands = key_ownership_commands(&user);
        assert_eq!(
            commands,
            [
                ChrootCommand::new("chown", &["--recursive", "ops:ops", "/home/ops/.ssh"]),
                ChrootCommand::new("chmod", &["0700", "/home/ops/.ssh"]),
            ]
        );

        let keyless = UserConfiguration {
            ssh_authorized_keys: vec![],
            ..user
        };
        let other = tempfile::tempdir().unwrap();
        assert!(!write_authorized_keys(other.path(), &keyless).unwrap());
        assert!(!other.path().join("home").exists());
    }
}
