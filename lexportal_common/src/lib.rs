//! LexPortal Common - Shared wire types for the abuse guard
//!
//! This crate contains the JSON error shape and the constants used by both
//! the edge server and the load-test tool.

use serde::{Deserialize, Serialize};

/// JSON error body returned by the server (`{"detail": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable description of the error
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }

    /// Whether this body announces a ban
    pub fn is_ban(&self) -> bool {
        self.detail.to_lowercase().contains("banned")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Constants shared by the server and the load test
pub mod constants {
    /// Detail sent to an identity that is already banned
    pub const BANNED_MESSAGE: &str =
        "Your IP has been temporarily banned due to suspicious activity. Please try again later.";

    /// Detail sent on the request that triggered the ban
    pub const BAN_TRIGGERED_MESSAGE: &str =
        "Too many violations detected. Your IP has been temporarily banned.";

    /// Detail sent when the guard fails closed
    pub const GUARD_UNAVAILABLE_MESSAGE: &str = "Request screening is temporarily unavailable.";

    /// Redis key prefix for violation counters
    pub const VIOLATION_PREFIX: &str = "abuse:violations:";

    /// Redis key prefix for bans
    pub const BAN_PREFIX: &str = "abuse:ban:";

    /// Proxy headers consulted for the originating address
    pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
    pub const REAL_IP_HEADER: &str = "x-real-ip";

    /// Default number of tolerated violations
    pub const DEFAULT_MAX_VIOLATIONS: u32 = 5;

    /// Default ban length (15 minutes)
    pub const DEFAULT_BAN_SECONDS: u64 = 900;

    /// Default tracking window (5 minutes)
    pub const DEFAULT_WINDOW_SECONDS: u64 = 300;

    /// Default interval between sweeps of idle records
    pub const DEFAULT_SWEEP_SECONDS: u64 = 60;

    /// Health endpoint of the API
    pub const HEALTH_PATH: &str = "/api/v1/health";
}
