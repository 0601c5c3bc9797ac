//! Ban policy: how many violations are tolerated and for how long a ban lasts

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where the ban boundary sits relative to `max_violations`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThresholdMode {
    /// Ban once the count goes past the limit (limit 5 bans on the 6th hit)
    #[default]
    Exceeds,
    /// Ban as soon as the count reaches the limit (limit 5 bans on the 5th hit)
    Reaches,
}

impl ThresholdMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdMode::Exceeds => "exceeds",
            ThresholdMode::Reaches => "reaches",
        }
    }
}

impl fmt::Display for ThresholdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exceeds" | "gt" => Ok(ThresholdMode::Exceeds),
            "reaches" | "gte" => Ok(ThresholdMode::Reaches),
            other => Err(format!("unknown threshold mode '{}'", other)),
        }
    }
}

/// Escalation policy applied to every identity
#[derive(Debug, Clone)]
pub struct BanPolicy {
    /// Number of violations tolerated before a ban
    pub max_violations: u32,
    /// Boundary convention for `max_violations`
    pub mode: ThresholdMode,
    /// How long a ban lasts
    pub ban_duration: Duration,
    /// Violations older than this no longer count; also the idle TTL of a record
    pub window: Duration,
}

impl BanPolicy {
    pub fn new(max_violations: u32, ban_secs: u64, window_secs: u64) -> Self {
        Self {
            max_violations,
            mode: ThresholdMode::default(),
            ban_duration: Duration::from_secs(ban_secs),
            window: Duration::from_secs(window_secs),
        }
    }

    pub fn with_mode(mut self, mode: ThresholdMode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether `count` violations inside one window warrant a ban
    pub fn is_exceeded(&self, count: u32) -> bool {
        match self.mode {
            ThresholdMode::Exceeds => count > self.max_violations,
            ThresholdMode::Reaches => count >= self.max_violations,
        }
    }

    /// Number of violations that are forwarded before the ban kicks in
    pub fn tolerated(&self) -> u32 {
        match self.mode {
            ThresholdMode::Exceeds => self.max_violations,
            ThresholdMode::Reaches => self.max_violations.saturating_sub(1),
        }
    }
}

impl Default for BanPolicy {
    fn default() -> Self {
        use lexportal_common::constants;
        Self::new(
            constants::DEFAULT_MAX_VIOLATIONS,
            constants::DEFAULT_BAN_SECONDS,
            constants::DEFAULT_WINDOW_SECONDS,
        )
    }
}
