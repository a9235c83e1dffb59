use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, trace};
use serde::Deserialize;

use crate::{dependencies::Dependency, partition_types::PartitionType};

#[derive(Debug, PartialEq, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfDisk,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SfDisk {
    /// Disk label type
    pub label: SfDiskLabel,

    /// Disk identifier
    pub id: String,

    /// Disk device path
    pub device: PathBuf,

    /// Disk size unit (always "sectors")
    pub unit: SfDiskUnit,

    /// First LBA
    pub firstlba: u64,

    /// Last LBA
    pub lastlba: u64,

    /// Sector size
    #[serde(default = "SfDisk::default_sectorsize")]
    pub sectorsize: u64,

    /// List of partitions
    #[serde(default)]
    pub partitions: Vec<SfPartition>,

    /// Usable capacity between first and last LBA
    #[serde(skip)]
    pub capacity: u64,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Clone)]
pub struct SfPartition {
    /// Partition device path
    pub node: PathBuf,

    /// Partition start offset in sectors
    pub start: u64,

    /// Partition size in sectors
    #[serde(rename = "size")]
    pub size_sectors: u64,

    /// Partition type
    #[serde(rename = "type")]
    pub partition_type: PartitionType,

    /// Partition UUID
    #[serde(rename = "uuid")]
    pub id: Option<String>,

    /// Partition name
    pub name: Option<String>,

    /// Partition size in bytes
    #[serde(skip)]
    pub size: u64,

    /// Partition number in the partition table
    #[serde(skip)]
    pub number: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum SfDiskLabel {
    #[serde(rename = "gpt")]
    Gpt,

    /// Master Boot Record
    #[serde(rename = "mbr", alias = "dos")]
    Mbr,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum SfDiskUnit {
    #[serde(rename = "sectors")]
    Sectors,
}

impl SfDisk {
    fn default_sectorsize() -> u64 {
        512
    }

    /// Reads the partition table of a disk. Returns `None` when the disk has
    /// no partition table at all.
    pub fn get_info(disk: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let output = Dependency::Sfdisk
            .cmd()
            .arg("-J")
            .arg(disk.as_ref())
            .output()
            .context(format!(
                "Failed to fetch disk information for {}",
                disk.as_ref().display()
            ))?;

        // sfdisk prints nothing and fails when there is no label.
        if !output.success() && output.output().trim().is_empty() {
            trace!(
                "No partition table on {}: {}",
                disk.as_ref().display(),
                output.error_output().trim()
            );
            return Ok(None);
        }

        let json = output.check_output().context(format!(
            "Failed to fetch disk information for {}",
            disk.as_ref().display()
        ))?;

        SfDisk::parse_sfdisk_output(&json)
            .map(Some)
            .context(format!(
                "Failed to extract disk information for {}",
                disk.as_ref().display()
            ))
    }

    pub fn parse_sfdisk_output(output: &str) -> Result<Self, Error> {
        let mut disk = serde_json::from_str::<SfdiskOutput>(output)
            .context("Failed to parse disk information")?
            .partitiontable;

        disk.capacity = (disk.lastlba - disk.firstlba + 1) * disk.sectorsize;
        for part in disk.partitions.iter_mut() {
            part.size = part.size_sectors * disk.sectorsize;
            part.number = part
                .node
                .as_os_str()
                .to_string_lossy()
                .rsplit_once(|c: char| !c.is_ascii_digit())
                .map(|(_, n)| n)
                .context(format!(
                    "Failed to extract partition number from {}",
                    part.node.display()
                ))?
                .parse()
                .context(format!(
                    "Failed to parse partition number from {}",
                    part.node.display()
                ))?;
        }

        Ok(disk)
    }
}

/// One line of an sfdisk script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfScriptPartition {
    /// Size in bytes, or `None` to take the rest of the disk.
    pub size: Option<u64>,
    pub partition_type: PartitionType,
    pub name: String,
}

/// A GPT layout applied with `sfdisk` in one go.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SfScript {
    partitions: Vec<SfScriptPartition>,
}

impl SfScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partition(
        mut self,
        size: Option<u64>,
        partition_type: PartitionType,
        name: impl Into<String>,
    ) -> Self {
        self.partitions.push(SfScriptPartition {
            size,
            partition_type,
            name: name.into(),
        });
        self
    }

    /// Renders the script. Sizes are emitted in KiB so every byte count that
    /// is a multiple of 1 KiB survives exactly.
    pub fn render(&self) -> String {
        let mut script = String::from("label: gpt\n\n");
        for part in &self.partitions {
            if let Some(size) = part.size {
                script += &format!("size={}KiB, ", size / 1024);
            }
            script += &format!(
                "type={}, name=\"{}\"\n",
                part.partition_type,
                part.name.replace('"', "")
            );
        }
        script
    }

    /// Replaces the partition table of `disk`, wiping signatures found at the
    /// old and new partition locations.
    pub fn apply(&self, disk: impl AsRef<Path>) -> Result<(), Error> {
        let script = self.render();
        debug!(
            "Writing partition table to '{}':\n{script}",
            disk.as_ref().display()
        );
        Dependency::Sfdisk
            .cmd()
            .arg("--wipe")
            .arg("always")
            .arg("--wipe-partitions")
            .arg("always")
            .arg(disk.as_ref())
            .stdin(script)
            .run_and_check()
            .context(format!(
                "Failed to write partition table to '{}'",
                disk.as_ref().display()
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn test_parse_disk() {
        let sfdisk_output_json = indoc! {r#"
            {
               "partitiontable": {
                  "label": "gpt",
                  "id": "3E6494F9-91E1-426B-A25A-0A8101E464A4",
                  "device": "/dev/nvme0n1",
                  "unit": "sectors",
                  "firstlba": 34,
                  "lastlba": 976773134,
                  "sectorsize": 512,
                  "partitions": [
                     {
                        "node": "/dev/nvme0n1p1",
                        "start": 2048,
                        "size": 2097152,
                        "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                        "uuid": "F764E91F-9D15-4F6E-8508-0AFC1D0DF0B5",
                        "name": "EFI"
                     },{
                        "node": "/dev/nvme0n1p2",
                        "start": 2099200,
                        "size": 16777216,
                        "type": "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F",
                        "uuid": "4D8C2A88-1411-4021-804D-EB8C40F054AA",
                        "name": "swap"
                     },{
                        "node": "/dev/nvme0n1p3",
                        "start": 18876416,
                        "size": 957896704,
                        "type": "6A898CC3-1DD2-11B2-99A6-080020736631",
                        "uuid": "1B2C2A88-1411-4021-804D-EB8C40F054AA"
                     }
                  ]
               }
            }
        "#};
        let parsed = SfDisk::parse_sfdisk_output(sfdisk_output_json).unwrap();
        assert_eq!(parsed.label, SfDiskLabel::Gpt);
        assert_eq!(parsed.device, Path::new("/dev/nvme0n1"));
        assert_eq!(parsed.capacity, (976773134 - 34 + 1) * 512);
        assert_eq!(parsed.partitions.len(), 3);

        let esp = &parsed.partitions[0];
        assert_eq!(esp.partition_type, PartitionType::Esp);
        assert_eq!(esp.size, 1 << 30);
        assert_eq!(esp.number, 1);
        assert_eq!(esp.name.as_deref(), Some("EFI"));

        let pool = &parsed.partitions[2];
        assert_eq!(pool.partition_type, PartitionType::Zfs);
        assert_eq!(pool.number, 3);
        assert_eq!(pool.name, None);
    }

    #[test]
    fn test_parse_by_id_node() {
        let json = indoc! {r#"
            {
               "partitiontable": {
                  "label": "gpt",
                  "id": "3E6494F9-91E1-426B-A25A-0A8101E464A4",
                  "device": "/dev/disk/by-id/ata-ST500DM002_Z3T0ABCD",
                  "unit": "sectors",
                  "firstlba": 2048,
                  "lastlba": 976773134,
                  "partitions": [
                     {
                        "node": "/dev/disk/by-id/ata-ST500DM002_Z3T0ABCD-part12",
                        "start": 2048,
                        "size": 2048,
                        "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"
                     }
                  ]
               }
            }
        "#};
        let parsed = SfDisk::parse_sfdisk_output(json).unwrap();
        assert_eq!(parsed.sectorsize, 512);
        assert_eq!(parsed.partitions[0].number, 12);
        assert_eq!(parsed.partitions[0].id, None);
    }

    #[test]
    fn test_parse_rejects_bad_unit() {
        let json = indoc! {r#"
            {
               "partitiontable": {
                  "label": "gpt",
                  "id": "3E6494F9",
                  "device": "/dev/sda",
                  "unit": "bytes",
                  "firstlba": 2048,
                  "lastlba": 67108830
               }
            }
        "#};
        SfDisk::parse_sfdisk_output(json).unwrap_err();
    }

    #[test]
    fn test_render_script() {
        let script = SfScript::new()
            .with_partition(Some(1 << 30), PartitionType::Esp, "EFI")
            .with_partition(Some(8 << 30), PartitionType::Swap, "swap")
            .with_partition(None, PartitionType::Zfs, "rpool");

        assert_eq!(
            script.render(),
            indoc! {r#"
                label: gpt

                size=1048576KiB, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, name="EFI"
                size=8388608KiB, type=0657FD6D-A4AB-43C4-84E5-0933C84B4F4F, name="swap"
                type=6A898CC3-1DD2-11B2-99A6-080020736631, name="rpool"
            "#}
        );
    }
}
