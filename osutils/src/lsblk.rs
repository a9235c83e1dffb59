use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::warn;
use serde::{Deserialize, Deserializer};

use crate::dependencies::Dependency;

const COLUMNS: &str = "NAME,KNAME,SIZE,ROTA,TYPE,PKNAME,MODEL,SERIAL,TRAN,FSTYPE,UUID,PARTUUID,MOUNTPOINT";

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    /// Device path, as `--path` is always passed
    pub name: PathBuf,

    /// Kernel device path, e.g. `/dev/nvme0n1` for a by-id name
    pub kname: Option<PathBuf>,

    #[serde(deserialize_with = "de_u64")]
    pub size: u64,

    /// Rotational media
    #[serde(rename = "rota", deserialize_with = "de_bool")]
    pub rotational: bool,

    #[serde(rename = "type")]
    pub device_type: BlockDeviceType,

    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<PathBuf>,

    pub model: Option<String>,
    pub serial: Option<String>,

    /// Transport, e.g. `nvme`, `sata`, `usb`
    pub tran: Option<String>,

    pub fstype: Option<String>,

    /// Filesystem UUID, the volume id for FAT
    pub uuid: Option<String>,

    #[serde(rename = "partuuid")]
    pub part_uuid: Option<String>,

    pub mountpoint: Option<PathBuf>,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlockDeviceType {
    Disk,
    Part,
    Loop,
    Rom,
    Crypt,
    Lvm,
    #[default]
    #[serde(other)]
    Other,
}

impl BlockDevice {
    /// Every mount point on this device or any of its partitions.
    pub fn mount_points(&self) -> Vec<&Path> {
        self.mountpoint
            .as_deref()
            .into_iter()
            .chain(self.children.iter().flat_map(|c| c.mount_points()))
            .collect()
    }
}

/// Older util-linux prints numbers and booleans as strings.
fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("expected unsigned integer")),
        serde_json::Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!(
            "expected integer, got {other}"
        ))),
    }
}

fn de_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Bool(b) => Ok(b),
        serde_json::Value::String(s) => Ok(s.trim() == "1"),
        serde_json::Value::Number(n) => Ok(n.as_u64() == Some(1)),
        other => Err(serde::de::Error::custom(format!(
            "expected boolean, got {other}"
        ))),
    }
}

/// Describes one device and its partitions.
pub fn get(device_path: impl AsRef<Path>) -> Result<BlockDevice, Error> {
    let mut devices = run(Some(device_path.as_ref()))?;
    if devices.len() != 1 {
        bail!(
            "Expected exactly one block device for '{}', found {}",
            device_path.as_ref().display(),
            devices.len()
        );
    }
    Ok(devices.remove(0))
}

/// Lists every block device when `device_path` is `None`.
pub fn run(device_path: Option<&Path>) -> Result<Vec<BlockDevice>, Error> {
    let mut cmd = Dependency::Lsblk.cmd();
    cmd.arg("--json")
        .arg("--path")
        .arg("--bytes")
        .arg("--output")
        .arg(COLUMNS);
    if let Some(path) = device_path {
        cmd.arg(path);
    }
    let result = cmd.output_and_check().context("Failed to execute lsblk")?;

    let parsed = parse_lsblk_output(result.as_str());
    if parsed.is_err() {
        warn!("lsblk output: {}", result);
    }

    parsed
}

fn parse_lsblk_output(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    Ok(parsed.blockdevices)
}
