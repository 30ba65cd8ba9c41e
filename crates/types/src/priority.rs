//! Caller-declared urgency and priority classes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strata_errors::ConfigError;

/// Caller-declared urgency of a request
///
/// Ordered from least to most urgent, so `Priority::High > Priority::Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// No urgency declared; served in the lowest band
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl Priority {
    /// Number of distinct scheduling bands
    pub const BANDS: usize = 3;

    /// All priorities in declaration order
    pub const ALL: [Self; 4] = [Self::None, Self::Low, Self::Medium, Self::High];

    /// Scheduling band for this priority, `0` being the lowest
    ///
    /// `None` shares the lowest band with `Low`.
    #[must_use]
    pub const fn band(self) -> usize {
        match self {
            Self::None | Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(ConfigError::InvalidValue {
                field: "priority".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Priority plus the continuation flag
///
/// A continuation request belongs to work that was already admitted and is
/// now touching a second resource. Continuations are never rejected by the
/// new-work admission bound, although they still wait for a free permit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriorityClass {
    pub priority: Priority,
    #[serde(default)]
    pub continuation: bool,
}

impl PriorityClass {
    #[must_use]
    pub const fn new(priority: Priority, continuation: bool) -> Self {
        Self {
            priority,
            continuation,
        }
    }

    /// Class for re-acquisition by in-progress work
    #[must_use]
    pub const fn continuation(priority: Priority) -> Self {
        Self::new(priority, true)
    }
}

impl From<Priority> for PriorityClass {
    fn from(priority: Priority) -> Self {
        Self::new(priority, false)
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.continuation {
            write!(f, "{}+cont", self.priority)
        } else {
            write!(f, "{}", self.priority)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_scan_high_first() {
        assert_eq!(Priority::High.band(), Priority::BANDS - 1);
        assert_eq!(Priority::None.band(), Priority::Low.band());
        assert!(Priority::Medium.band() > Priority::Low.band());
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn class_display() {
        assert_eq!(PriorityClass::from(Priority::Low).to_string(), "low");
        assert_eq!(
            PriorityClass::continuation(Priority::High).to_string(),
            "high+cont"
        );
    }
}
