//! Typed builders for the files mirroot generates into the new system.
//!
//! Values are taken as structured fields and quoted for the target language
//! when rendered, never interpolated into free-form templates.

use std::path::PathBuf;

use mirroot_api::constants::{
    FIRSTBOOT_TICKET_PATH, FIRSTBOOT_UNIT_NAME, FIRSTBOOT_WANTED_BY, FIRSTBOOT_WANTS_LINK_PATH,
    FORCE_IMPORT_PARAM, MIRROOT_BINARY_INSTALL_PATH,
};

/// Quotes `value` for a POSIX shell.
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `/etc/grub.d` script emitting the forced-import menu entry while the
/// bootstrap ticket is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBootMenuScript {
    pub entry_id: String,
    pub title: String,
    pub pool: String,

    /// Dataset mounted at `/`, passed as `root=ZFS=<dataset>`.
    pub root_dataset: String,
}

impl FirstBootMenuScript {
    pub fn linux_params(&self) -> String {
        format!(
            "root=ZFS={} ro {FORCE_IMPORT_PARAM}=1",
            self.root_dataset
        )
    }

    pub fn render(&self) -> String {
        let mut script = String::new();
        script += "#!/bin/sh\n";
        script += "# Generated by mirroot. Emits nothing once the first boot is validated.\n";
        script += "set -e\n\n";
        script += &format!("[ -e {} ] || exit 0\n", sh_quote(FIRSTBOOT_TICKET_PATH));
        script += &format!("[ -e {} ] || exit 0\n\n", sh_quote(FIRSTBOOT_WANTS_LINK_PATH));
        script += ". \"$pkgdatadir/grub-mkconfig_lib\"\n\n";
        script += "kernel=$(ls -1 /boot/vmlinuz-* 2>/dev/null | sort -V | tail -n 1)\n";
        script += "[ -n \"$kernel\" ] || exit 0\n";
        script += "version=\"${kernel#/boot/vmlinuz-}\"\n";
        script += "boot_device=\"$(${grub_probe} --target=device /boot)\"\n";
        script += "rel_dir=\"$(make_system_path_relative_to_its_root /boot)\"\n\n";
        script += &format!("entry_id={}\n", sh_quote(&self.entry_id));
        script += &format!("title={}\n", sh_quote(&self.title));
        script += &format!("params={}\n\n", sh_quote(&self.linux_params()));
        script += "echo \"menuentry '$title' --id $entry_id {\"\n";
        script += "prepare_grub_to_access_device \"$boot_device\" | sed 's/^/\\t/'\n";
        script += "echo \"\tlinux $rel_dir/vmlinuz-$version $params\"\n";
        script += "echo \"\tinitrd $rel_dir/initrd.img-$version\"\n";
        script += "echo \"}\"\n";
        script
    }
}

/// The one-shot unit running `mirroot first-boot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstBootUnit {
    pub binary: PathBuf,
}

impl Default for FirstBootUnit {
    fn default() -> Self {
        Self {
            binary: MIRROOT_BINARY_INSTALL_PATH.into(),
        }
    }
}

impl FirstBootUnit {
    pub fn name(&self) -> &'static str {
        FIRSTBOOT_UNIT_NAME
    }

    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description=Validate the first boot of a mirroot installation\n\
             ConditionPathExists={FIRSTBOOT_TICKET_PATH}\n\
             Wants=zfs-mount.service\n\
             After=zfs-mount.service local-fs.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             ExecStart={} first-boot\n\
             StandardOutput=journal+console\n\
             \n\
             [Install]\n\
             WantedBy={FIRSTBOOT_WANTED_BY}\n",
            self.binary.display()
        )
    }
}

/// `/etc/kernel/postinst.d` hook keeping every ESP in sync after kernel
/// updates. Never fails the package operation that ran it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPostinstHook {
    pub binary: PathBuf,
}

impl Default for KernelPostinstHook {
    fn default() -> Self {
        Self {
            binary: MIRROOT_BINARY_INSTALL_PATH.into(),
        }
    }
}

impl KernelPostinstHook {
    pub fn render(&self) -> String {
        let binary = sh_quote(&self.binary.display().to_string());
        format!(
            "#!/bin/sh\n\
             # Generated by mirroot.\n\
             [ -x {binary} ] || exit 0\n\
             {binary} sync-esp || echo \"mirroot: ESP sync failed, run 'mirroot sync-esp'\" >&2\n\
             exit 0\n"
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
    pub options: Vec<String>,
    pub dump: u8,
    pub pass: u8,
}

impl FstabEntry {
    /// The ESP, addressed by the volume id every mirror member shares.
    pub fn esp(volume_uuid: &str, mount_point: &str) -> Self {
        Self {
            source: format!("UUID={volume_uuid}"),
            target: mount_point.into(),
            fstype: "vfat".into(),
            options: vec!["umask=0077".into(), "nofail".into()],
            dump: 0,
            pass: 1,
        }
    }

    pub fn swap(device: &str) -> Self {
        Self {
            source: device.into(),
            target: "none".into(),
            fstype: "swap".into(),
            options: vec!["sw".into(), "nofail".into()],
            dump: 0,
            pass: 0,
        }
    }
}

/// `/etc/fstab` of the new system. ZFS datasets mount themselves and are not
/// listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fstab {
    pub entries: Vec<FstabEntry>,
}

impl Fstab {
    pub fn render(&self) -> String {
        let mut fstab = String::from("# <file system> <mount point> <type> <options> <dump> <pass>\n");
        for entry in &self.entries {
            fstab += &format!(
                "{} {} {} {} {} {}\n",
                escape_fstab(&entry.source),
                escape_fstab(&entry.target),
                entry.fstype,
                entry.options.join(","),
                entry.dump,
                entry.pass
            );
        }
        fstab
    }
}

/// Octal escapes for the characters fstab fields cannot hold literally.
fn escape_fstab(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            ' ' => r"\040".to_string(),
            '\t' => r"\011".to_string(),
            '\n' => r"\012".to_string(),
            '\\' => r"\134".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use osutils::grub::GrubConfig;

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("rpool/ROOT/ubuntu"), "'rpool/ROOT/ubuntu'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_menu_script() {
        let script = FirstBootMenuScript {
            entry_id: "mirroot-firstboot".into(),
            title: "First boot (forced pool import)".into(),
            pool: "rpool".into(),
            root_dataset: "rpool/ROOT/ubuntu".into(),
        };
        let rendered = script.render();
        assert!(rendered.starts_with("#!/bin/sh\n"));
        assert!(rendered.contains("[ -e '/etc/mirroot/firstboot.ticket' ] || exit 0"));
        assert!(rendered.contains(
            "[ -e '/etc/systemd/system/multi-user.target.wants/mirroot-firstboot.service' ] || exit 0"
        ));
        assert!(rendered.contains("params='root=ZFS=rpool/ROOT/ubuntu ro zfs_force=1'"));
        assert!(rendered.contains("entry_id='mirroot-firstboot'"));
    }

    #[test]
    fn test_menu_script_output_parses() {
        // What the script prints once grub-mkconfig expands the variables.
        let script = FirstBootMenuScript {
            entry_id: "mirroot-firstboot".into(),
            title: "First boot".into(),
            pool: "rpool".into(),
            root_dataset: "rpool/ROOT/ubuntu".into(),
        };
        let expanded = format!(
            "menuentry 'First boot' --id mirroot-firstboot {{\n\
             \tinsmod zfs\n\
             \tlinux /ROOT/ubuntu@/boot/vmlinuz-6.8.0-31-generic {}\n\
             \tinitrd /ROOT/ubuntu@/boot/initrd.img-6.8.0-31-generic\n\
             }}\n",
            script.linux_params()
        );
        let config = GrubConfig::parse(&expanded);
        let entry = config.entry("mirroot-firstboot").unwrap();
        assert!(entry.has_param("zfs_force"));
        assert!(entry.has_param("zfs_force=1"));
    }

    #[test]
    fn test_unit() {
        let unit = FirstBootUnit::default().render();
        assert!(unit.contains("ConditionPathExists=/etc/mirroot/firstboot.ticket\n"));
        assert!(unit.contains("ExecStart=/usr/local/sbin/mirroot first-boot\n"));
        assert!(unit.contains("Type=oneshot\n"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_kernel_hook() {
        assert_eq!(
            KernelPostinstHook::default().render(),
            indoc! {r#"
                #!/bin/sh
                # Generated by mirroot.
                [ -x '/usr/local/sbin/mirroot' ] || exit 0
                '/usr/local/sbin/mirroot' sync-esp || echo "mirroot: ESP sync failed, run 'mirroot sync-esp'" >&2
                exit 0
            "#}
        );
    }

    #[test]
    fn test_fstab() {
        let fstab = Fstab {
            entries: vec![
                FstabEntry::esp("84A0-088E", "/boot/efi"),
                FstabEntry::swap("/dev/disk/by-id/ata-ST500DM002-1BD142_Z3T0ABCD-part2"),
            ],
        };
        assert_eq!(
            fstab.render(),
            indoc! {"
                # <file system> <mount point> <type> <options> <dump> <pass>
                UUID=84A0-088E /boot/efi vfat umask=0077,nofail 0 1
                /dev/disk/by-id/ata-ST500DM002-1BD142_Z3T0ABCD-part2 none swap sw,nofail 0 0
            "}
        );
        assert_eq!(escape_fstab("/srv/my data"), r"/srv/my\040data");
    }
}
