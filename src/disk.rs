//! Disk inventory filtering
//!
//! A [`DiskFilter`] selects disks from a node's inventory. Every set field must
//! match (string fields are glob patterns, see [`DiskFilter::pattern`]); an
//! empty filter matches every disk. Sizes compare with an optional operator:
//!
//! ```text
//! >=10GB   at least 10 * 10^9 bytes
//! <1TiB    less than 2^40 bytes
//! 500GB    exactly 500 * 10^9 bytes (same as ==500GB)
//! ```

use std::fmt;
use std::str::FromStr;

use bytesize::ByteSize;
use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Storage medium
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    /// Solid state drive
    Ssd,
    /// Rotational drive
    Hdd,
    /// NVMe drive
    Nvme,
    /// SD card
    Sd,
}

impl FromStr for DiskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ssd" => Ok(Self::Ssd),
            "hdd" => Ok(Self::Hdd),
            "nvme" => Ok(Self::Nvme),
            "sd" => Ok(Self::Sd),
            _ => Err(Error::validation(format!(
                "invalid disk type: {s}, expected one of: ssd, hdd, nvme, sd"
            ))),
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssd => write!(f, "ssd"),
            Self::Hdd => write!(f, "hdd"),
            Self::Nvme => write!(f, "nvme"),
            Self::Sd => write!(f, "sd"),
        }
    }
}

/// One disk as reported by a node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    /// Size in bytes
    pub size: u64,
    /// Device path, e.g. `/dev/sda`
    pub name: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Kernel modalias
    pub modalias: String,
    /// Partition table UUID
    pub uuid: String,
    /// World wide ID
    pub wwid: String,
    /// Medium; `None` when the node couldn't tell
    pub disk_type: Option<DiskType>,
    /// Bus path
    pub bus_path: String,
    /// The disk Talos is installed on
    pub system_disk: bool,
}

/// Size comparison operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeOperator {
    /// `>=`
    GreaterOrEqual,
    /// `<=`
    LessOrEqual,
    /// `>`
    Greater,
    /// `<`
    Less,
    /// `==`, also used when no operator is given
    Equal,
}

impl SizeOperator {
    // Two-character operators first so `>=` isn't read as `>`.
    const TOKENS: [(&'static str, Self); 5] = [
        (">=", Self::GreaterOrEqual),
        ("<=", Self::LessOrEqual),
        ("==", Self::Equal),
        (">", Self::Greater),
        ("<", Self::Less),
    ];

    fn compare(self, actual: u64, expected: u64) -> bool {
        match self {
            Self::GreaterOrEqual => actual >= expected,
            Self::LessOrEqual => actual <= expected,
            Self::Greater => actual > expected,
            Self::Less => actual < expected,
            Self::Equal => actual == expected,
        }
    }

    fn token(self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(_, op)| *op == self)
            .map_or("==", |(token, _)| *token)
    }
}

/// Size comparison, e.g. `>=10GB`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeFilter {
    /// Comparison
    pub operator: SizeOperator,
    /// Size in bytes
    pub bytes: u64,
}

impl SizeFilter {
    /// Parse `[op]<size>` where size is human readable (`10GB`, `512MiB`, `1000`)
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        let (operator, rest) = SizeOperator::TOKENS
            .iter()
            .find_map(|(token, op)| trimmed.strip_prefix(*token).map(|rest| (*op, rest)))
            .unwrap_or((SizeOperator::Equal, trimmed));

        let rest = rest.trim();
        if rest.is_empty() {
            return Err(Error::validation(format!(
                "invalid size filter {input:?}: missing size"
            )));
        }
        if rest.starts_with(['<', '>', '=', '!']) {
            return Err(Error::validation(format!(
                "invalid size filter {input:?}: unknown operator"
            )));
        }

        let size = ByteSize::from_str(rest)
            .map_err(|e| Error::validation(format!("invalid size filter {input:?}: {e}")))?;

        Ok(Self {
            operator,
            bytes: size.as_u64(),
        })
    }

    /// Whether `size` satisfies the comparison
    pub fn matches(&self, size: u64) -> bool {
        self.operator.compare(size, self.bytes)
    }
}

impl FromStr for SizeFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SizeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.operator.token(), self.bytes)
    }
}

/// Disk selector; unset fields match anything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskFilter {
    /// Size comparison
    pub size: Option<SizeFilter>,
    /// Device path
    pub name: Option<Pattern>,
    /// Model
    pub model: Option<Pattern>,
    /// Serial number
    pub serial: Option<Pattern>,
    /// Kernel modalias
    pub modalias: Option<Pattern>,
    /// UUID
    pub uuid: Option<Pattern>,
    /// World wide ID
    pub wwid: Option<Pattern>,
    /// Medium
    pub disk_type: Option<DiskType>,
    /// Bus path
    pub bus_path: Option<Pattern>,
}

impl DiskFilter {
    /// Compile a string field pattern
    ///
    /// `*` matches any run of characters (including `/`), `?` any one
    /// character and `[...]` a character class.
    pub fn pattern(text: &str) -> Result<Pattern> {
        Pattern::new(text).map_err(|e| {
            Error::validation(format!("invalid disk pattern {text:?}: {}", e.msg))
        })
    }

    /// True if no field is set
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Whether `disk` satisfies every set field
    pub fn matches(&self, disk: &DiskRecord) -> bool {
        let text_fields = [
            (&self.name, &disk.name),
            (&self.model, &disk.model),
            (&self.serial, &disk.serial),
            (&self.modalias, &disk.modalias),
            (&self.uuid, &disk.uuid),
            (&self.wwid, &disk.wwid),
            (&self.bus_path, &disk.bus_path),
        ];

        self.size.map_or(true, |filter| filter.matches(disk.size))
            && self.disk_type.map_or(true, |t| disk.disk_type == Some(t))
            && text_fields
                .iter()
                .all(|(pattern, value)| pattern.as_ref().map_or(true, |p| p.matches(value)))
    }
}

/// First disk in inventory order matching `filter`
pub fn select_first<'a>(disks: &'a [DiskRecord], filter: &DiskFilter) -> Result<&'a DiskRecord> {
    disks
        .iter()
        .find(|disk| filter.matches(disk))
        .ok_or_else(|| {
            Error::not_found(format!(
                "no disk matches the filter ({} disks inspected)",
                disks.len()
            ))
        })
}

/// Every disk matching `filter`; an empty filter returns the whole inventory
pub fn select_all<'a>(disks: &'a [DiskRecord], filter: &DiskFilter) -> Vec<&'a DiskRecord> {
    disks.iter().filter(|disk| filter.matches(disk)).collect()
}
