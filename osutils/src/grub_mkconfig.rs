use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::{debug, trace};

use crate::{dependencies::Dependency, files, path};

/// Common location for all grub-mkconfig default fragments.
pub const GRUB_MKCONFIG_SCRIPT_CONF_DIR: &str = "/etc/default/grub.d";

/// A fragment sourced by grub-mkconfig after `/etc/default/grub`.
#[derive(Debug, Default)]
pub struct GrubMkConfigScript {
    /// The fragment name, without extension.
    name: String,

    /// Root directory of the tree the fragment is written into.
    root: PathBuf,

    /// Value for GRUB_DEFAULT.
    default_entry: Option<String>,

    /// Parameters appended to GRUB_CMDLINE_LINUX.
    new_params: Vec<(String, Option<String>)>,
}

impl GrubMkConfigScript {
    /// A fragment at `/etc/default/grub.d/<name>.cfg`.
    ///
    /// ```rust
    /// use std::path::Path;
    ///
    /// use osutils::grub_mkconfig::GrubMkConfigScript;
    ///
    /// let script = GrubMkConfigScript::new("99-my-fragment").with_root("/mnt/target");
    ///
    /// assert_eq!(
    ///     script.file_path(),
    ///     Path::new("/mnt/target/etc/default/grub.d/99-my-fragment.cfg")
    /// );
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: PathBuf::from("/"),
            ..Default::default()
        }
    }

    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..self
        }
    }

    /// Selects the default menu entry by id.
    pub fn set_default(&mut self, entry_id: impl Into<String>) {
        self.default_entry = Some(entry_id.into());
    }

    pub fn add_simple_param(&mut self, key: impl Into<String>) {
        self.new_params.push((key.into(), None));
    }

    pub fn add_kv_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.new_params.push((key.into(), Some(value.into())));
    }

    pub fn write(&self) -> Result<(), Error> {
        self.write_inner(&self.file_path())
    }

    fn write_inner(&self, path: &Path) -> Result<(), Error> {
        debug!("Writing grub-mkconfig fragment to '{}'", path.display());

        let content = self.render();
        trace!("Grub-mkconfig fragment content:\n{content}");

        files::write_file(path, 0o644, content.as_bytes()).with_context(|| {
            format!(
                "Failed to write grub-mkconfig fragment to '{}'",
                path.display()
            )
        })
    }

    pub fn file_path(&self) -> PathBuf {
        path::join_relative(
            &self.root,
            Path::new(GRUB_MKCONFIG_SCRIPT_CONF_DIR)
                .join(&self.name)
                .with_extension("cfg"),
        )
    }

    fn render(&self) -> String {
        let mut conf = String::new();

        if let Some(default_entry) = &self.default_entry {
            conf += &format!("GRUB_DEFAULT=\"{}\"\n", default_entry.replace('"', ""));
        }

        if !self.new_params.is_empty() {
            let params = self
                .new_params
                .iter()
                .map(|(key, value)| match value {
                    Some(value) if value.contains(' ') => format!(r#"{key}=\"{value}\""#),
                    Some(value) => format!("{key}={value}"),
                    None => key.clone(),
                })
                .collect::<Vec<_>>()
                .join(" ");
            conf += &format!("GRUB_CMDLINE_LINUX=\"$GRUB_CMDLINE_LINUX {params}\"\n");
        }

        conf
    }
}

/// Reads the `GRUB_DEFAULT` selection from a defaults file such as
/// `/etc/default/grub`. Missing file or variable means `None`.
pub fn read_default(path: impl AsRef<Path>) -> Result<Option<String>, Error> {
    if !path.as_ref().exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read '{}'", path.as_ref().display()))?;
    Ok(parse_default(&contents))
}

fn parse_default(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix("GRUB_DEFAULT="))
        .last()
        .map(|value| value.trim_matches(|c| c == '"' || c == '\'').to_string())
}

/// Arguments to `grub-mkconfig` writing `output`.
pub fn mkconfig_args(output: impl AsRef<Path>) -> Vec<OsString> {
    vec!["-o".into(), output.as_ref().into()]
}

/// Regenerates `output` on the running system.
pub fn regenerate(output: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::GrubMkconfig
        .cmd()
        .args(mkconfig_args(output.as_ref()))
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to regenerate '{}'",
                output.as_ref().display()
            )
        })
}

/// A `grub-install` run for one ESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubInstall {
    /// ESP mount point as seen by grub-install.
    pub efi_directory: PathBuf,

    /// Folder below `EFI/` and the firmware menu label.
    pub bootloader_id: String,
}

impl GrubInstall {
    pub fn args(&self) -> Vec<OsString> {
        vec![
            "--target=x86_64-efi".into(),
            {
                let mut arg = OsString::from("--efi-directory=");
                arg.push(&self.efi_directory);
                arg
            },
            format!("--bootloader-id={}", self.bootloader_id).into(),
            "--recheck".into(),
            "--no-floppy".into(),
        ]
    }

    /// Runs on the current system.
    pub fn run(&self) -> Result<(), Error> {
        Dependency::GrubInstall
            .cmd()
            .args(self.args())
            .run_and_check()
            .with_context(|| {
                format!(
                    "Failed to install GRUB to '{}' as '{}'",
                    self.efi_directory.display(),
                    self.bootloader_id
                )
            })
    }
}
