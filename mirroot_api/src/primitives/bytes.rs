use std::{fmt::Display, num::ParseIntError, str::FromStr};

pub const KIB: u64 = 1 << 10;
pub const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;

/// A size in bytes, written in configuration as a plain integer or with a
/// binary suffix (`K`, `M`, `G`, `T`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(pub u64);

impl From<u64> for ByteCount {
    fn from(x: u64) -> Self {
        ByteCount(x)
    }
}

impl ByteCount {
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * MIB)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * GIB)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Rounds up to the next multiple of `alignment`.
    pub fn align_up(self, alignment: u64) -> Self {
        match self.0 % alignment {
            0 => self,
            rem => Self(self.0 + alignment - rem),
        }
    }

    /// Rounds down to a multiple of `alignment`.
    pub fn align_down(self, alignment: u64) -> Self {
        Self(self.0 - self.0 % alignment)
    }

    pub fn to_human_readable(&self) -> String {
        match self.0.trailing_zeros() {
            _ if self.0 == 0 => "0".to_owned(),
            0..=9 => format!("{}", self.0),
            10..=19 => format!("{}K", self.0 >> 10),
            20..=29 => format!("{}M", self.0 >> 20),
            30..=39 => format!("{}G", self.0 >> 30),
            _ => format!("{}T", self.0 >> 40),
        }
    }

    pub fn from_human_readable(s: &str) -> Result<Self, ParseIntError> {
        let s = s.trim();
        let shifted = |val: &str, shift: u8| Ok(Self(val.trim().parse::<u64>()? << shift));
        match s.chars().last() {
            Some('K') => shifted(&s[..s.len() - 1], 10),
            Some('M') => shifted(&s[..s.len() - 1], 20),
            Some('G') => shifted(&s[..s.len() - 1], 30),
            Some('T') => shifted(&s[..s.len() - 1], 40),
            _ => shifted(s, 0),
        }
    }
}

impl Display for ByteCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_human_readable())
    }
}

impl FromStr for ByteCount {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_human_readable(s)
    }
}

impl<'de> serde::Deserialize<'de> for ByteCount {
    fn deserialize<D>(deserializer: D) -> Result<ByteCount, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // YAML turns bare digits into numbers, so accept either shape.
        match serde_yaml::Value::deserialize(deserializer)? {
            serde_yaml::Value::String(s) => ByteCount::from_str(&s)
                .map_err(|e| serde::de::Error::custom(format!("invalid byte count '{s}': {e}"))),
            serde_yaml::Value::Number(n) => n.as_u64().map(ByteCount).ok_or_else(|| {
                serde::de::Error::custom("invalid byte count, expected unsigned integer")
            }),
            _ => Err(serde::de::Error::custom("invalid byte count")),
        }
    }
}

impl serde::Serialize for ByteCount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if self.0 % KIB != 0 {
            serializer.serialize_u64(self.0)
        } else {
            serializer.serialize_str(&self.to_human_readable())
        }
    }
}
