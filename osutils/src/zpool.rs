use std::{
    ffi::OsString,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Error};
use log::{debug, trace};

use crate::dependencies::Dependency;

/// Health of a pool or one of its vdevs, as printed by `zpool status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VdevState {
    Online,
    Degraded,
    Faulted,
    Offline,
    Unavail,
    Removed,
    Other(String),
}

impl VdevState {
    /// States in which a member contributes nothing to redundancy.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Faulted | Self::Offline | Self::Unavail | Self::Removed
        )
    }
}

impl FromStr for VdevState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ONLINE" => Self::Online,
            "DEGRADED" => Self::Degraded,
            "FAULTED" => Self::Faulted,
            "OFFLINE" => Self::Offline,
            "UNAVAIL" => Self::Unavail,
            "REMOVED" => Self::Removed,
            other => Self::Other(other.to_string()),
        })
    }
}

impl Display for VdevState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Online => "ONLINE",
            Self::Degraded => "DEGRADED",
            Self::Faulted => "FAULTED",
            Self::Offline => "OFFLINE",
            Self::Unavail => "UNAVAIL",
            Self::Removed => "REMOVED",
            Self::Other(s) => s,
        })
    }
}

/// A leaf device of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    /// Device path, or the vdev GUID when the device is missing.
    pub name: String,
    pub state: VdevState,
    /// The path a missing device had, from the `was ...` annotation.
    pub was: Option<String>,
    /// Annotated with `(resilvering)`.
    pub resilvering: bool,
}

impl PoolMember {
    /// Matches a member by full path, by file name of its path, by GUID or by
    /// the path it had before it went missing.
    pub fn matches(&self, device: &str) -> bool {
        let file_name = |p: &str| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        };
        let device_name = file_name(device);
        [Some(self.name.as_str()), self.was.as_deref()]
            .into_iter()
            .flatten()
            .any(|candidate| {
                candidate == device
                    || (device_name.is_some() && file_name(candidate) == device_name)
            })
    }

    /// The best known path of this member.
    pub fn path(&self) -> &str {
        self.was.as_deref().unwrap_or(&self.name)
    }
}

/// Typed view of `zpool status -P <pool>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub state: VdevState,
    /// Text of the `scan:` section, joined into one line.
    pub scan: Option<String>,
    /// Leaf devices of the data vdevs, in listing order.
    pub members: Vec<PoolMember>,
}

impl PoolStatus {
    pub fn member(&self, device: &str) -> Option<&PoolMember> {
        self.members.iter().find(|m| m.matches(device))
    }

    pub fn resilver_in_progress(&self) -> bool {
        self.scan
            .as_deref()
            .map(|s| s.contains("resilver in progress"))
            .unwrap_or_default()
            || self.members.iter().any(|m| m.resilvering)
    }

    /// Whether `device` has been taken in as a replacement: it is listed and
    /// either resilvering, or online after a resilver that already finished.
    /// A finished scan line alone may describe an older resilver.
    pub fn replacement_started(&self, device: &str) -> bool {
        let Some(member) = self.member(device) else {
            return false;
        };
        let resilvered = self
            .scan
            .as_deref()
            .is_some_and(|s| s.starts_with("resilvered"));
        member.resilvering
            || (member.state != VdevState::Unavail && self.resilver_in_progress())
            || (member.state == VdevState::Online && resilvered)
    }

    fn parse(output: &str) -> Result<Self, Error> {
        let mut name = None;
        let mut state = None;
        let mut scan: Option<String> = None;
        let mut members = Vec::new();

        #[derive(PartialEq)]
        enum Section {
            Header,
            Scan,
            Config,
            Done,
        }
        let mut section = Section::Header;

        for line in output.lines() {
            let trimmed = line.trim();
            if let Some((key, value)) = header_field(line) {
                section = Section::Header;
                match key {
                    "pool" => name = Some(value.to_string()),
                    "state" => state = Some(value.parse::<VdevState>()?),
                    "scan" => {
                        scan = Some(value.to_string());
                        section = Section::Scan;
                    }
                    "config" => section = Section::Config,
                    "errors" => section = Section::Done,
                    _ => (),
                }
                continue;
            }

            match section {
                Section::Scan if !trimmed.is_empty() => {
                    if let Some(scan) = scan.as_mut() {
                        scan.push(' ');
                        scan.push_str(trimmed);
                    }
                }
                Section::Config => {
                    let mut fields = trimmed.split_whitespace();
                    let Some(device) = fields.next() else {
                        continue;
                    };
                    if device == "NAME" || Some(device) == name.as_deref() {
                        continue;
                    }
                    if matches!(device, "logs" | "cache" | "spares" | "special" | "dedup") {
                        section = Section::Done;
                        continue;
                    }
                    if is_group_vdev(device) {
                        continue;
                    }
                    let Some(device_state) = fields.next() else {
                        continue;
                    };
                    let rest = fields.skip(3).collect::<Vec<_>>().join(" ");
                    members.push(PoolMember {
                        name: device.to_string(),
                        state: device_state.parse::<VdevState>()?,
                        was: rest
                            .split_once("was ")
                            .map(|(_, was)| was.split_whitespace().next().unwrap_or(was))
                            .map(str::to_string),
                        resilvering: rest.contains("(resilvering)"),
                    });
                }
                _ => (),
            }
        }

        Ok(PoolStatus {
            name: name.context("zpool status output has no pool name")?,
            state: state.context("zpool status output has no pool state")?,
            scan,
            members,
        })
    }
}

/// Splits a `key: value` header line of `zpool status`. Header keys are
/// right-aligned and never tab-indented.
fn header_field(line: &str) -> Option<(&str, &str)> {
    if line.starts_with('\t') {
        return None;
    }
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, value.trim()))
}

fn is_group_vdev(name: &str) -> bool {
    ["mirror-", "replacing-", "spare-", "raidz", "draid"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Names of every imported pool.
pub fn list() -> Result<Vec<String>, Error> {
    Ok(Dependency::Zpool
        .cmd()
        .arg("list")
        .arg("-H")
        .arg("-o")
        .arg("name")
        .output_and_check()
        .context("Failed to list pools")?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// Whether `pool` is currently imported.
pub fn exists(pool: &str) -> Result<bool, Error> {
    Ok(list()?.iter().any(|p| p == pool))
}

/// Returns `None` when the pool is not imported.
pub fn status(pool: &str) -> Result<Option<PoolStatus>, Error> {
    if !exists(pool)? {
        return Ok(None);
    }
    let output = Dependency::Zpool
        .cmd()
        .arg("status")
        .arg("-P")
        .arg(pool)
        .output_and_check()
        .with_context(|| format!("Failed to query status of pool '{pool}'"))?;
    trace!("zpool status output:\n{output}");
    PoolStatus::parse(&output)
        .map(Some)
        .with_context(|| format!("Failed to parse status of pool '{pool}'"))
}

pub fn get_property(pool: &str, property: &str) -> Result<String, Error> {
    Ok(Dependency::Zpool
        .cmd()
        .arg("get")
        .arg("-H")
        .arg("-o")
        .arg("value")
        .arg(property)
        .arg(pool)
        .output_and_check()
        .with_context(|| format!("Failed to read property '{property}' of pool '{pool}'"))?
        .trim()
        .to_string())
}

pub fn set_property(pool: &str, property: &str, value: &str) -> Result<(), Error> {
    Dependency::Zpool
        .cmd()
        .arg("set")
        .arg(format!("{property}={value}"))
        .arg(pool)
        .run_and_check()
        .with_context(|| format!("Failed to set '{property}={value}' on pool '{pool}'"))
}

/// Arguments of `zpool create` for a single mirror vdev.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolCreate {
    pub name: String,
    pub pool_properties: Vec<(String, String)>,
    pub filesystem_properties: Vec<(String, String)>,
    pub altroot: Option<PathBuf>,
    pub mirror: Vec<PathBuf>,
}

impl PoolCreate {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["create".into(), "-f".into()];
        for (key, value) in &self.pool_properties {
            args.push("-o".into());
            args.push(format!("{key}={value}").into());
        }
        for (key, value) in &self.filesystem_properties {
            args.push("-O".into());
            args.push(format!("{key}={value}").into());
        }
        if let Some(altroot) = &self.altroot {
            args.push("-R".into());
            args.push(altroot.into());
        }
        args.push(self.name.as_str().into());
        args.push("mirror".into());
        args.extend(self.mirror.iter().map(OsString::from));
        args
    }

    pub fn run(&self) -> Result<(), Error> {
        Dependency::Zpool
            .cmd()
            .args(self.args())
            .run_and_check()
            .with_context(|| format!("Failed to create pool '{}'", self.name))
    }
}

pub fn destroy(pool: &str, force: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Zpool.cmd();
    cmd.arg("destroy");
    if force {
        cmd.arg("-f");
    }
    cmd.arg(pool)
        .run_and_check()
        .with_context(|| format!("Failed to destroy pool '{pool}'"))
}

pub fn export(pool: &str, force: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Zpool.cmd();
    cmd.arg("export");
    if force {
        cmd.arg("-f");
    }
    cmd.arg(pool)
        .run_and_check()
        .with_context(|| format!("Failed to export pool '{pool}'"))
}

/// Imports `pool` by scanning `scan_dir`, without mounting datasets and
/// without recording it in a cache file.
pub fn import(
    pool: &str,
    force: bool,
    altroot: Option<&Path>,
    scan_dir: Option<&Path>,
) -> Result<(), Error> {
    let mut cmd = Dependency::Zpool.cmd();
    cmd.arg("import").arg("-N").arg("-o").arg("cachefile=none");
    if force {
        cmd.arg("-f");
    }
    if let Some(altroot) = altroot {
        cmd.arg("-R").arg(altroot);
    }
    if let Some(scan_dir) = scan_dir {
        cmd.arg("-d").arg(scan_dir);
    }
    cmd.arg(pool)
        .run_and_check()
        .with_context(|| format!("Failed to import pool '{pool}'"))
}

/// Clears a ZFS label from `device`. A device without a label is not an
/// error. Returns whether a label was cleared.
pub fn labelclear(device: impl AsRef<Path>) -> Result<bool, Error> {
    let output = Dependency::Zpool
        .cmd()
        .arg("labelclear")
        .arg("-f")
        .arg(device.as_ref())
        .output()
        .with_context(|| format!("Failed to clear label of '{}'", device.as_ref().display()))?;
    if output.success() {
        return Ok(true);
    }

    let stderr = output.error_output();
    if stderr.contains("failed to read label")
        || stderr.contains("no such file")
        || stderr.contains("No such file")
    {
        debug!("No ZFS label on '{}'", device.as_ref().display());
        return Ok(false);
    }
    output
        .check()
        .with_context(|| format!("Failed to clear label of '{}'", device.as_ref().display()))?;
    Ok(true)
}

/// Replaces `old` (a path or GUID) with `new` and starts a resilver.
pub fn replace(pool: &str, old: &str, new: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Zpool
        .cmd()
        .arg("replace")
        .arg("-f")
        .arg(pool)
        .arg(old)
        .arg(new.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to replace '{old}' with '{}' in pool '{pool}'",
                new.as_ref().display()
            )
        })
}
