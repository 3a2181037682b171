use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ViewError;

const CLOCK_PREFIX: &str = "c:";

/// Rendered as `c:<root_number>:<tick>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClockPosition {
    pub root_number: u32,
    pub ticks: u32,
}

impl ClockPosition {
    pub fn new(root_number: u32, ticks: u32) -> Self {
        Self { root_number, ticks }
    }
}

impl fmt::Display for ClockPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CLOCK_PREFIX}{}:{}", self.root_number, self.ticks)
    }
}

impl FromStr for ClockPosition {
    type Err = ViewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ViewError::InvalidClock(s.to_string());
        let rest = s.strip_prefix(CLOCK_PREFIX).ok_or_else(invalid)?;
        let (root, ticks) = rest.split_once(':').ok_or_else(invalid)?;
        // u32::from_str accepts a leading '+', which would break the
        // one-string-per-position property.
        if !is_decimal(root) || !is_decimal(ticks) {
            return Err(invalid());
        }
        Ok(Self {
            root_number: root.parse().map_err(|_| invalid())?,
            ticks: ticks.parse().map_err(|_| invalid())?,
        })
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && (s == "0" || !s.starts_with('0'))
}

impl Serialize for ClockPosition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockPosition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The reference point of a `since` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSpec {
    Clock(ClockPosition),
    Timestamp(SystemTime),
}

impl ClockSpec {
    pub fn parse(s: &str) -> Result<Self, ViewError> {
        s.parse().map(ClockSpec::Clock)
    }
}

impl From<ClockPosition> for ClockSpec {
    fn from(pos: ClockPosition) -> Self {
        ClockSpec::Clock(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn clock_string_round_trips() {
        let pos = ClockPosition::new(3, 4_000_000_000);
        let s = pos.to_string();
        assert_eq!(s, "c:3:4000000000");
        assert_eq!(s.parse::<ClockPosition>().unwrap(), pos);
    }

    #[test]
    fn distinct_positions_render_distinct_strings() {
        let a = ClockPosition::new(1, 12);
        let b = ClockPosition::new(11, 2);
        let c = ClockPosition::new(1, 2);
        assert_ne!(a.to_string(), b.to_string());
        assert_ne!(a.to_string(), c.to_string());
    }

    #[test]
    fn malformed_clocks_are_rejected() {
        for bad in [
            "",
            "c:",
            "c:1",
            "c:1:",
            "c::2",
            "x:1:2",
            "c:1:2:3",
            "c:-1:2",
            "c:+1:2",
            "c:01:2",
            "c:1:99999999999",
            "c:1:2 ",
        ] {
            let err = bad.parse::<ClockPosition>().unwrap_err();
            assert!(matches!(err, ViewError::InvalidClock(_)), "{bad:?}");
        }
    }

    #[test]
    fn serde_uses_the_string_form() {
        let pos = ClockPosition::new(2, 9);
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, "\"c:2:9\"");
        let back: ClockPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }
}
