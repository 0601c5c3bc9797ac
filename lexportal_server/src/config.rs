//! Server configuration loaded from environment variables

use crate::abuse::blocklist::DEFAULT_SENSITIVE_PATHS;
use crate::abuse::policy::{BanPolicy, ThresholdMode};
use ipnet::IpNet;
use lexportal_common::constants;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Port for API traffic
    pub port: u16,

    /// Redis connection string; the in-memory store is used when unset
    pub redis_url: Option<String>,

    /// Bearer token for the guard admin routes (routes hidden when unset)
    pub admin_token: Option<String>,

    /// Abuse guard settings
    pub abuse: AbuseConfig,
}

/// Settings of the abuse guard
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// Master switch
    pub enabled: bool,

    /// Escalation policy
    pub policy: BanPolicy,

    /// How often idle records are swept
    pub sweep_interval: Duration,

    /// Denylist patterns (`*` suffix = prefix match)
    pub sensitive_paths: Vec<String>,

    /// Flag SQL injection fragments in query strings
    pub detect_sql_injection: bool,

    /// Identities that are never inspected
    pub trusted_ips: Vec<IpNet>,

    /// Peers whose forwarded headers are believed
    pub trusted_proxies: Vec<IpNet>,

    /// Forward requests when the guard itself fails
    pub fail_open: bool,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: BanPolicy::default(),
            sweep_interval: Duration::from_secs(constants::DEFAULT_SWEEP_SECONDS),
            sensitive_paths: DEFAULT_SENSITIVE_PATHS.iter().map(|p| p.to_string()).collect(),
            detect_sql_injection: true,
            trusted_ips: Vec::new(),
            trusted_proxies: loopback_networks(),
            fail_open: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
            redis_url: non_empty_var("REDIS_URL"),
            admin_token: non_empty_var("ADMIN_TOKEN"),
            abuse: AbuseConfig::from_env()?,
        })
    }
}

impl AbuseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_violations = parse_var("ABUSE_MAX_VIOLATIONS", constants::DEFAULT_MAX_VIOLATIONS)?;
        let ban_secs = bounded_secs(
            "ABUSE_BAN_SECONDS",
            parse_var("ABUSE_BAN_SECONDS", constants::DEFAULT_BAN_SECONDS)?,
        )?;
        let window_secs = bounded_secs(
            "ABUSE_WINDOW_SECONDS",
            parse_var("ABUSE_WINDOW_SECONDS", constants::DEFAULT_WINDOW_SECONDS)?,
        )?;
        let sweep_secs = bounded_secs(
            "ABUSE_SWEEP_SECONDS",
            parse_var("ABUSE_SWEEP_SECONDS", constants::DEFAULT_SWEEP_SECONDS)?,
        )?;
        let mode = parse_var("ABUSE_THRESHOLD_MODE", ThresholdMode::default())?;

        if max_violations == 0 {
            return Err(ConfigError::InvalidValue {
                var: "ABUSE_MAX_VIOLATIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        let sensitive_paths = match non_empty_var("ABUSE_SENSITIVE_PATHS") {
            Some(raw) => split_list(&raw),
            None => defaults.sensitive_paths,
        };

        let trusted_ips = match env::var("ABUSE_TRUSTED_IPS") {
            Ok(raw) => parse_networks("ABUSE_TRUSTED_IPS", &raw)?,
            Err(_) => defaults.trusted_ips,
        };

        let trusted_proxies = match env::var("ABUSE_TRUSTED_PROXIES") {
            Ok(raw) => parse_networks("ABUSE_TRUSTED_PROXIES", &raw)?,
            Err(_) => defaults.trusted_proxies,
        };

        Ok(Self {
            enabled: parse_bool("ABUSE_ENABLED", defaults.enabled)?,
            policy: BanPolicy::new(max_violations, ban_secs, window_secs).with_mode(mode),
            sweep_interval: Duration::from_secs(sweep_secs),
            sensitive_paths,
            detect_sql_injection: parse_bool("ABUSE_DETECT_SQLI", defaults.detect_sql_injection)?,
            trusted_ips,
            trusted_proxies,
            fail_open: parse_bool("ABUSE_FAIL_OPEN", defaults.fail_open)?,
        })
    }
}

/// Longest accepted ban, window or sweep interval (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Reject zero and anything past [`MAX_DURATION_SECS`]
fn bounded_secs(var: &'static str, secs: u64) -> Result<u64, ConfigError> {
    if (1..=MAX_DURATION_SECS).contains(&secs) {
        Ok(secs)
    } else {
        Err(ConfigError::InvalidValue {
            var,
            reason: format!("must be between 1 and {} seconds", MAX_DURATION_SECS),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty_var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match non_empty_var(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: name,
                reason: format!("'{}' is not a boolean", v),
            }),
        },
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated list of CIDRs or bare addresses
pub fn parse_networks(var: &'static str, raw: &str) -> Result<Vec<IpNet>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::InvalidValue {
                    var,
                    reason: format!("'{}' is not an IP address or CIDR", entry),
                })
        })
        .collect()
}

fn loopback_networks() -> Vec<IpNet> {
    [IpAddr::from([127, 0, 0, 1]), IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])]
        .into_iter()
        .map(IpNet::from)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: &'static str, reason: String },
}
