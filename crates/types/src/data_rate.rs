//! Link and application data rates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Errors parsing a data rate string such as `"5Mbps"`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDataRateError {
    #[error("Empty data rate string")]
    Empty,

    #[error("Invalid number in data rate: {0}")]
    InvalidNumber(String),

    #[error("Unknown data rate unit: {0}")]
    UnknownUnit(String),

    #[error("Data rate must be positive: {0}")]
    NotPositive(String),
}

/// A data rate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DataRate(u64);

impl DataRate {
    /// Create from bits per second.
    pub const fn from_bps(bps: u64) -> Self {
        Self(bps)
    }

    /// Create from kilobits per second.
    pub const fn from_kbps(kbps: u64) -> Self {
        Self(kbps * 1_000)
    }

    /// Create from megabits per second.
    pub const fn from_mbps(mbps: u64) -> Self {
        Self(mbps * 1_000_000)
    }

    /// Bits per second.
    pub fn bps(&self) -> u64 {
        self.0
    }

    /// Bytes per second (floor).
    pub fn bytes_per_sec(&self) -> u64 {
        self.0 / 8
    }

    /// Time needed to serialize `bytes` onto a link at this rate.
    ///
    /// Rounded up to the next nanosecond. A zero rate yields `Duration::MAX`.
    pub fn tx_time(&self, bytes: u64) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        let bits = bytes as u128 * 8;
        let nanos = (bits * NANOS_PER_SEC).div_ceil(self.0 as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Time needed to accumulate `bits` at this rate (rounded up).
    pub fn time_for_bits(&self, bits: u64) -> Duration {
        if self.0 == 0 {
            return Duration::MAX;
        }
        let nanos = (bits as u128 * NANOS_PER_SEC).div_ceil(self.0 as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Bits accumulated over `elapsed` at this rate (floor).
    pub fn bits_in(&self, elapsed: Duration) -> u64 {
        let bits = elapsed.as_nanos() * self.0 as u128 / NANOS_PER_SEC;
        u64::try_from(bits).unwrap_or(u64::MAX)
    }
}

impl FromStr for DataRate {
    type Err = ParseDataRateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseDataRateError::Empty);
        }

        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);

        let value: f64 = number
            .parse()
            .map_err(|_| ParseDataRateError::InvalidNumber(number.to_string()))?;

        // Lowercase "b" is bits, uppercase "B" is bytes.
        let multiplier: f64 = match unit.trim() {
            "" | "bps" | "b/s" => 1.0,
            "kbps" | "Kbps" | "kb/s" | "Kb/s" => 1e3,
            "Mbps" | "mbps" | "Mb/s" => 1e6,
            "Gbps" | "gbps" | "Gb/s" => 1e9,
            "Bps" | "B/s" => 8.0,
            "kBps" | "KBps" | "kB/s" | "KB/s" => 8e3,
            "MBps" | "MB/s" => 8e6,
            "GBps" | "GB/s" => 8e9,
            other => return Err(ParseDataRateError::UnknownUnit(other.to_string())),
        };

        let bps = (value * multiplier).round();
        if !bps.is_finite() || bps < 1.0 {
            return Err(ParseDataRateError::NotPositive(s.to_string()));
        }

        Ok(Self(bps as u64))
    }
}

impl TryFrom<String> for DataRate {
    type Error = ParseDataRateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataRate> for String {
    fn from(rate: DataRate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bps if bps >= 1_000_000_000 && bps % 1_000_000_000 == 0 => {
                write!(f, "{}Gbps", bps / 1_000_000_000)
            }
            bps if bps >= 1_000_000 && bps % 1_000_000 == 0 => write!(f, "{}Mbps", bps / 1_000_000),
            bps if bps >= 1_000 && bps % 1_000 == 0 => write!(f, "{}kbps", bps / 1_000),
            bps => write!(f, "{}bps", bps),
        }
    }
}
