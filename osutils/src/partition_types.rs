use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Deserializer};

/// GPT partition type codes used on mirror members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PartitionType {
    /// EFI System Partition
    Esp,

    /// Linux swap
    Swap,

    /// Solaris /usr, the code OpenZFS uses for pool members
    Zfs,

    /// Anything else, kept verbatim in upper case
    Other(String),
}

impl PartitionType {
    pub const ESP_GUID: &'static str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
    pub const SWAP_GUID: &'static str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
    pub const ZFS_GUID: &'static str = "6A898CC3-1DD2-11B2-99A6-080020736631";

    pub fn from_guid(guid: &str) -> Self {
        let upper = guid.trim().to_ascii_uppercase();
        match upper.as_str() {
            Self::ESP_GUID => Self::Esp,
            Self::SWAP_GUID => Self::Swap,
            Self::ZFS_GUID => Self::Zfs,
            _ => Self::Other(upper),
        }
    }

    /// The type GUID as written in an sfdisk script.
    pub fn guid(&self) -> &str {
        match self {
            Self::Esp => Self::ESP_GUID,
            Self::Swap => Self::SWAP_GUID,
            Self::Zfs => Self::ZFS_GUID,
            Self::Other(guid) => guid,
        }
    }
}

impl FromStr for PartitionType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_guid(s))
    }
}

impl Display for PartitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.guid())
    }
}

impl<'de> Deserialize<'de> for PartitionType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self::from_guid(&String::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(
            "c12a7328-f81f-11d2-ba4b-00a0c93ec93b".parse::<PartitionType>().unwrap(),
            PartitionType::Esp
        );
        assert_eq!(
            PartitionType::SWAP_GUID.parse::<PartitionType>().unwrap(),
            PartitionType::Swap
        );
        assert_eq!(
            "6a898cc3-1dd2-11b2-99a6-080020736631".parse::<PartitionType>().unwrap(),
            PartitionType::Zfs
        );
        assert_eq!(
            "0fc63daf-8483-4772-8e79-3d69d8477de4".parse::<PartitionType>().unwrap(),
            PartitionType::Other("0FC63DAF-8483-4772-8E79-3D69D8477DE4".into())
        );
    }

    #[test]
    fn test_guid_round_trip() {
        for ty in [PartitionType::Esp, PartitionType::Swap, PartitionType::Zfs] {
            assert_eq!(ty.to_string().parse::<PartitionType>().unwrap(), ty);
        }
    }
}
