use std::{fs, path::Path, sync::OnceLock};

use anyhow::{Context, Error};
use log::trace;
use regex::Regex;

/// One `menuentry` of a generated grub.cfg.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MenuEntry {
    pub title: String,

    /// Value of `--id` or `$menuentry_id_option`.
    pub id: Option<String>,

    /// Kernel image of the `linux` line.
    pub kernel: Option<String>,

    /// Arguments of the `linux` line after the kernel image.
    pub linux_args: Vec<String>,
}

impl MenuEntry {
    /// Whether the kernel command line has `param`, either bare or as
    /// `param=<anything>` when `param` carries no value itself.
    pub fn has_param(&self, param: &str) -> bool {
        self.linux_args.iter().any(|arg| {
            arg == param
                || (!param.contains('=')
                    && arg
                        .split_once('=')
                        .map(|(key, _)| key == param)
                        .unwrap_or_default())
        })
    }
}

/// Menu entries of a grub.cfg, flattened out of any submenus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrubConfig {
    pub entries: Vec<MenuEntry>,
}

fn menuentry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*menuentry\s+(?:'([^']*)'|"([^"]*)")(.*)\{\s*$"#).expect("valid regex")
    })
}

fn id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?:--id|\$menuentry_id_option)\s+['"]?([^'"\s]+)['"]?"#)
            .expect("valid regex")
    })
}

// Capture group 2 is everything after `linux ` / `linuxefi `.
const LINUX_COMMAND_LINE_PATTERN: &str = r"^(\s*linux(?:efi)?\s)(.+)$";

fn linux_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LINUX_COMMAND_LINE_PATTERN).expect("valid regex"))
}

impl GrubConfig {
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read file '{}'", path.as_ref().display()))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut entries = Vec::new();
        let mut current: Option<MenuEntry> = None;
        // Brace depth inside the current menu entry.
        let mut depth = 0usize;

        for line in contents.lines() {
            if let Some(entry) = current.as_mut() {
                let trimmed = line.trim();
                if trimmed.ends_with('{') {
                    depth += 1;
                } else if trimmed == "}" {
                    if depth == 0 {
                        trace!("Parsed grub menu entry '{}'", entry.title);
                        entries.extend(current.take());
                    } else {
                        depth -= 1;
                    }
                } else if let Some(captures) = linux_re().captures(line) {
                    let mut words = captures[2].split_whitespace().map(str::to_string);
                    entry.kernel = words.next();
                    entry.linux_args = words.collect();
                }
                continue;
            }

            if let Some(captures) = menuentry_re().captures(line) {
                let title = captures
                    .get(1)
                    .or_else(|| captures.get(2))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default();
                let id = id_re()
                    .captures(&captures[3])
                    .map(|c| c[1].to_string());
                current = Some(MenuEntry {
                    title,
                    id,
                    ..Default::default()
                });
                depth = 0;
            }
        }

        Self { entries }
    }

    pub fn entry(&self, id: &str) -> Option<&MenuEntry> {
        self.entries.iter().find(|e| e.id.as_deref() == Some(id))
    }

    /// Every entry whose kernel command line carries `param`.
    pub fn entries_with_param(&self, param: &str) -> Vec<&MenuEntry> {
        self.entries.iter().filter(|e| e.has_param(param)).collect()
    }
}
