//! I/O identifier parsing
//!
//! Identifiers have the canonical form `<PREFIX><group>.<index>`, e.g. `DO1.3`
//! or `LED1.2`. Group and index are both 1-based. Prefix matching is
//! case-insensitive; `Display` always produces the uppercase form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ExpioError;

/// I/O point class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IoKind {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
    Led,
}

impl IoKind {
    pub const ALL: [IoKind; 5] = [
        IoKind::DigitalInput,
        IoKind::DigitalOutput,
        IoKind::AnalogInput,
        IoKind::AnalogOutput,
        IoKind::Led,
    ];

    /// Textual prefix used in identifiers
    pub fn prefix(self) -> &'static str {
        match self {
            IoKind::DigitalInput => "DI",
            IoKind::DigitalOutput => "DO",
            IoKind::AnalogInput => "AI",
            IoKind::AnalogOutput => "AO",
            IoKind::Led => "LED",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.prefix().eq_ignore_ascii_case(prefix))
    }

    /// Inputs cannot be written
    pub fn is_read_only(self) -> bool {
        matches!(self, IoKind::DigitalInput | IoKind::AnalogInput)
    }

    pub fn is_analog(self) -> bool {
        matches!(self, IoKind::AnalogInput | IoKind::AnalogOutput)
    }
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Structured I/O identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IoId {
    pub kind: IoKind,
    /// 1-based group number
    pub group: u8,
    /// 1-based point index within the group
    pub index: u8,
}

impl IoId {
    pub fn new(kind: IoKind, group: u8, index: u8) -> Self {
        Self { kind, group, index }
    }

    pub fn di(group: u8, index: u8) -> Self {
        Self::new(IoKind::DigitalInput, group, index)
    }

    pub fn do_(group: u8, index: u8) -> Self {
        Self::new(IoKind::DigitalOutput, group, index)
    }

    pub fn ai(group: u8, index: u8) -> Self {
        Self::new(IoKind::AnalogInput, group, index)
    }

    pub fn ao(group: u8, index: u8) -> Self {
        Self::new(IoKind::AnalogOutput, group, index)
    }

    pub fn led(group: u8, index: u8) -> Self {
        Self::new(IoKind::Led, group, index)
    }

    /// Parse a textual identifier
    pub fn parse(input: &str) -> Result<Self, ExpioError> {
        let invalid = || ExpioError::unknown_address(input);
        let trimmed = input.trim();

        let (head, index) = trimmed.rsplit_once('.').ok_or_else(invalid)?;
        let index: u8 = index.parse().map_err(|_| invalid())?;

        let digits_at = head
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(invalid)?;
        let (prefix, group) = head.split_at(digits_at);
        let group: u8 = group.parse().map_err(|_| invalid())?;
        let kind = IoKind::from_prefix(prefix).ok_or_else(invalid)?;

        if group == 0 || index == 0 {
            return Err(invalid());
        }

        Ok(Self { kind, group, index })
    }
}

impl fmt::Display for IoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}.{}", self.kind.prefix(), self.group, self.index)
    }
}

impl FromStr for IoId {
    type Err = ExpioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for IoId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IoId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
