//! Protocol versions and version ranges.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RpcError;

/// A dotted numeric protocol version such as `1.4` or `1.5.3`.
///
/// Missing trailing components compare as zero, so `1.4 == 1.4.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RpcError::InvalidConfig(format!("invalid protocol version '{s}'"));
        let mut parts = [0u32; 3];
        let mut count = 0;
        for piece in s.trim().split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = piece.parse().map_err(|_| invalid())?;
            count += 1;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An inclusive `[min, max]` version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl VersionRange {
    pub fn new(min: ProtocolVersion, max: ProtocolVersion) -> Self {
        Self { min, max }
    }

    /// A range containing exactly one version.
    pub fn exact(v: ProtocolVersion) -> Self {
        Self { min: v, max: v }
    }

    pub fn contains(&self, v: ProtocolVersion) -> bool {
        self.min <= v && v <= self.max
    }

    /// Highest version inside both ranges, if any.
    pub fn highest_common(&self, other: &VersionRange) -> Option<ProtocolVersion> {
        let lo = self.min.max(other.min);
        let hi = self.max.min(other.max);
        (lo <= hi).then_some(hi)
    }

    /// Parameter form sent in the `server.version` handshake.
    pub fn to_param(&self) -> Value {
        if self.min == self.max {
            Value::String(self.min.to_string())
        } else {
            serde_json::json!([self.min.to_string(), self.max.to_string()])
        }
    }

    /// Parse the protocol element of a `server.version` reply: either one
    /// version string or a `[min, max]` pair.
    pub fn from_reply(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => s.parse().ok().map(Self::exact),
            Value::Array(items) if items.len() == 2 => {
                let min = items[0].as_str()?.parse().ok()?;
                let max = items[1].as_str()?.parse().ok()?;
                Some(Self::new(min, max))
            }
            _ => None,
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::new(ProtocolVersion::new(1, 4, 0), ProtocolVersion::new(1, 5, 3))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
