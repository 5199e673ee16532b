//! Environment-driven bandwidth limit configuration.
//!
//! Each setting is read from an environment variable; a value that is missing
//! falls back to its default, and one that cannot be parsed falls back to its
//! default with a warning.

use std::fmt::Debug;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::registry::LimitDomain;

pub const NETWORK_RATE_LIMIT_ENV: &str = "LIMITED_IO_NETWORK_RATE_LIMIT";
pub const DISK_RATE_LIMIT_ENV: &str = "LIMITED_IO_DISK_RATE_LIMIT";
pub const BURST_HEADROOM_ENV: &str = "LIMITED_IO_BURST_HEADROOM";

/// Extra bucket capacity on top of one second's worth of tokens.
pub const DEFAULT_BURST_HEADROOM: u64 = 32 * 1024 * 1024;

/// Controls how a config value is parsed from an environment string.
pub trait ParsableConfigValue: Debug + Sized {
    fn parse_user_value(value: &str) -> Option<Self>;

    /// Parse the value, returning the default if it is absent or can't be parsed.
    fn parse(variable_name: &str, value: Option<String>, default: Self) -> Self {
        match value {
            Some(v) => match Self::parse_user_value(&v) {
                Some(v) => {
                    info!("Config: {variable_name} = {v:?} (user set)");
                    v
                },
                None => {
                    warn!("Configuration value {v} for {variable_name} cannot be parsed into correct type; reverting to default.");
                    info!("Config: {variable_name} = {default:?} (default due to parse error)");
                    default
                },
            },
            None => {
                debug!("Config: {variable_name} = {default:?} (default)");
                default
            },
        }
    }
}

/// Types whose `FromStr` parsing is used as is.
pub trait FromStrParseable: FromStr + Debug {}

impl<T: FromStrParseable> ParsableConfigValue for T {
    fn parse_user_value(value: &str) -> Option<Self> {
        value.trim().parse::<T>().ok()
    }
}

impl FromStrParseable for u64 {}
impl FromStrParseable for usize {}

/// `None` unless the user sets a value.
impl<T: ParsableConfigValue> ParsableConfigValue for Option<T> {
    fn parse_user_value(value: &str) -> Option<Self> {
        T::parse_user_value(value).map(Some)
    }
}

/// Bandwidth ceilings for each limiting domain, in bytes per second.
///
/// A domain with no rate, or a rate of 0, is unlimited.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandwidthLimitConfig {
    pub network_rate_limit: Option<u64>,
    pub disk_rate_limit: Option<u64>,

    /// Bucket capacity beyond the per-second rate. Reads larger than
    /// `rate + burst_headroom` bytes are rejected by the limiter, so this should
    /// be at least the largest buffer callers read into.
    pub burst_headroom: u64,
}

impl Default for BandwidthLimitConfig {
    fn default() -> Self {
        Self {
            network_rate_limit: None,
            disk_rate_limit: None,
            burst_headroom: DEFAULT_BURST_HEADROOM,
        }
    }
}

impl BandwidthLimitConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            network_rate_limit: <Option<u64>>::parse(
                NETWORK_RATE_LIMIT_ENV,
                lookup(NETWORK_RATE_LIMIT_ENV),
                defaults.network_rate_limit,
            ),
            disk_rate_limit: <Option<u64>>::parse(
                DISK_RATE_LIMIT_ENV,
                lookup(DISK_RATE_LIMIT_ENV),
                defaults.disk_rate_limit,
            ),
            burst_headroom: u64::parse(BURST_HEADROOM_ENV, lookup(BURST_HEADROOM_ENV), defaults.burst_headroom),
        }
    }

    /// The configured rate for `domain`, or `None` if it is unlimited.
    pub fn rate_limit(&self, domain: LimitDomain) -> Option<u64> {
        let rate = match domain {
            LimitDomain::Network => self.network_rate_limit,
            LimitDomain::Disk => self.disk_rate_limit,
        };
        rate.filter(|&r| r > 0)
    }

    pub fn burst_for(&self, rate: u64) -> u64 {
        rate.saturating_add(self.burst_headroom)
    }
}
