use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CartonError, CartonResult};

/// A semver range with `||` alternation.
///
/// Comparators inside one group are ANDed (`">=1.2,<2.0"`); groups separated
/// by `||` are ORed (`"=1.13 || >=2.0"`).
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    groups: Vec<VersionReq>,
}

impl VersionRange {
    pub fn parse(raw: &str) -> CartonResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CartonError::validation("version range must not be empty"));
        }
        let groups = trimmed
            .split("||")
            .map(|group| {
                let group = group.trim();
                VersionReq::parse(group).map_err(|err| {
                    CartonError::validation(format!("invalid version range `{raw}`: {err}"))
                })
            })
            .collect::<CartonResult<Vec<_>>>()?;
        Ok(Self {
            raw: trimmed.to_string(),
            groups,
        })
    }

    /// Range matching every version.
    pub fn any() -> Self {
        Self {
            raw: "*".to_string(),
            groups: vec![VersionReq::STAR],
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.groups.iter().any(|group| group.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// Ranges compare by their textual form; two spellings of the same range are
/// treated as different requirements.
impl PartialEq for VersionRange {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for VersionRange {}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for VersionRange {
    type Err = CartonError;

    fn from_str(value: &str) -> CartonResult<Self> {
        Self::parse(value)
    }
}

impl Serialize for VersionRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for VersionRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a version, padding partial forms: `"2"` → `2.0.0`, `"2.1"` → `2.1.0`.
pub fn parse_loose_version(raw: &str) -> CartonResult<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let core_len = trimmed
        .find(['-', '+'])
        .unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(core_len);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
        .map_err(|err| CartonError::validation(format!("invalid version `{raw}`: {err}")))
}

pub(crate) mod loose_version {
    use semver::Version;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(version: &Version, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(version)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Version, D::Error> {
        let raw = LooseRaw::deserialize(deserializer)?;
        let text = match raw {
            LooseRaw::Text(text) => text,
            LooseRaw::Number(number) => number.to_string(),
        };
        super::parse_loose_version(&text).map_err(serde::de::Error::custom)
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LooseRaw {
        Text(String),
        Number(u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> Version {
        Version::parse(raw).unwrap()
    }

    #[test]
    fn comma_groups_are_anded() {
        let range = VersionRange::parse(">=1.2,<2.0").unwrap();
        assert!(range.matches(&v("1.2.0")));
        assert!(range.matches(&v("1.9.9")));
        assert!(!range.matches(&v("2.0.0")));
        assert!(!range.matches(&v("1.1.9")));
    }

    #[test]
    fn pipes_are_ored() {
        let range = VersionRange::parse("=1.13 || >=2.1").unwrap();
        assert!(range.matches(&v("1.13.1")));
        assert!(range.matches(&v("2.3.0")));
        assert!(!range.matches(&v("2.0.0")));
    }

    #[test]
    fn partial_exact_requirement() {
        let range = VersionRange::parse("=2.0").unwrap();
        assert!(range.matches(&v("2.0.5")));
        assert!(!range.matches(&v("2.1.0")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(VersionRange::parse("").is_err());
        assert!(VersionRange::parse(">=banana").is_err());
        assert!(VersionRange::parse(">=1.0 ||").is_err());
    }

    #[test]
    fn loose_versions_are_padded() {
        assert_eq!(parse_loose_version("2").unwrap(), v("2.0.0"));
        assert_eq!(parse_loose_version("2.1").unwrap(), v("2.1.0"));
        assert_eq!(parse_loose_version("v1.13.1").unwrap(), v("1.13.1"));
        assert_eq!(parse_loose_version("2.1-rc1").unwrap(), v("2.1.0-rc1"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let range = VersionRange::parse(">=1.2, <2.0").unwrap();
        let json = serde_json::to_string(&range).unwrap();
        assert_eq!(json, "\">=1.2, <2.0\"");
        let back: VersionRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
    }
}
