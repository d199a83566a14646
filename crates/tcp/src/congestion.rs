//! Congestion control.
//!
//! The connection owns a [`CongestionWindow`], which wraps a pluggable
//! [`CongestionControl`] strategy. Strategies only answer one question:
//! given an ACK or loss signal, what is the new window? The wrapper enforces
//! the window bounds, so a strategy cannot push the window outside
//! `[segment_size, max_cwnd]`.
//!
//! ## Supported Algorithms
//!
//! - **Reno**: slow start, additive increase of one segment per RTT,
//!   multiplicative decrease by half on triple duplicate ACK, back to one
//!   segment on timeout.
//! - **Tahoe**: like Reno, but every loss collapses the window to one segment.
//! - **Aimd**: Reno-shaped with configurable increase (segments per RTT) and
//!   decrease factor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Congestion window state handed to strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Congestion window in bytes.
    pub cwnd: u32,
    /// Slow-start threshold in bytes.
    pub ssthresh: u32,
    /// Maximum segment size in bytes.
    pub segment_size: u32,
}

impl Window {
    /// Whether the window is below the slow-start threshold.
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }
}

/// How a loss was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossSignal {
    /// Duplicate-ACK threshold reached (fast retransmit).
    TripleDuplicateAck,
    /// Retransmission timer expired.
    Timeout,
}

/// A congestion control strategy.
///
/// Strategies are consulted by the connection on every new ACK and on every
/// detected loss. They never see segments, timers or sequence numbers, so the
/// ack/retransmission logic of the connection is the same for all of them.
pub trait CongestionControl: fmt::Debug {
    /// Name used in logs and reports.
    fn name(&self) -> &'static str;

    /// New congestion window after `bytes_acked` bytes were newly acknowledged.
    fn on_ack(&mut self, window: &Window, bytes_acked: u32) -> u32;

    /// New window after a loss with `bytes_in_flight` bytes outstanding.
    fn on_loss(&mut self, window: &Window, bytes_in_flight: u32, signal: LossSignal) -> Window;
}

/// Slow start: grow by at most one segment per ACK.
fn slow_start(window: &Window, bytes_acked: u32) -> u32 {
    window
        .cwnd
        .saturating_add(bytes_acked.min(window.segment_size))
}

/// Congestion avoidance: grow by about `segments` segments per RTT.
fn congestion_avoidance(window: &Window, segments: u32) -> u32 {
    let mss = window.segment_size as u64;
    let increment = (segments as u64)
        .saturating_mul(mss * mss)
        / (window.cwnd.max(1) as u64);
    let increment = increment.max(1);
    window.cwnd.saturating_add(increment.min(u32::MAX as u64) as u32)
}

fn halved_ssthresh(window: &Window, bytes_in_flight: u32) -> u32 {
    (bytes_in_flight / 2).max(window.segment_size.saturating_mul(2))
}

/// TCP Reno.
#[derive(Debug, Default, Clone)]
pub struct Reno;

impl CongestionControl for Reno {
    fn name(&self) -> &'static str {
        "Reno"
    }

    fn on_ack(&mut self, window: &Window, bytes_acked: u32) -> u32 {
        if window.in_slow_start() {
            slow_start(window, bytes_acked)
        } else {
            congestion_avoidance(window, 1)
        }
    }

    fn on_loss(&mut self, window: &Window, bytes_in_flight: u32, signal: LossSignal) -> Window {
        let ssthresh = halved_ssthresh(window, bytes_in_flight);
        let cwnd = match signal {
            LossSignal::TripleDuplicateAck => ssthresh,
            LossSignal::Timeout => window.segment_size,
        };
        Window {
            cwnd,
            ssthresh,
            ..*window
        }
    }
}

/// TCP Tahoe.
#[derive(Debug, Default, Clone)]
pub struct Tahoe;

impl CongestionControl for Tahoe {
    fn name(&self) -> &'static str {
        "Tahoe"
    }

    fn on_ack(&mut self, window: &Window, bytes_acked: u32) -> u32 {
        if window.in_slow_start() {
            slow_start(window, bytes_acked)
        } else {
            congestion_avoidance(window, 1)
        }
    }

    fn on_loss(&mut self, window: &Window, bytes_in_flight: u32, _signal: LossSignal) -> Window {
        Window {
            cwnd: window.segment_size,
            ssthresh: halved_ssthresh(window, bytes_in_flight),
            ..*window
        }
    }
}

/// Generic additive-increase/multiplicative-decrease.
#[derive(Debug, Clone)]
pub struct Aimd {
    increase_segments: u32,
    decrease_factor: f64,
}

impl Aimd {
    /// Create an AIMD strategy.
    ///
    /// `decrease_factor` is the fraction of the flight size kept after a loss.
    pub fn new(increase_segments: u32, decrease_factor: f64) -> Self {
        Self {
            increase_segments: increase_segments.max(1),
            decrease_factor: decrease_factor.clamp(0.01, 0.99),
        }
    }
}

impl CongestionControl for Aimd {
    fn name(&self) -> &'static str {
        "Aimd"
    }

    fn on_ack(&mut self, window: &Window, bytes_acked: u32) -> u32 {
        if window.in_slow_start() {
            slow_start(window, bytes_acked)
        } else {
            congestion_avoidance(window, self.increase_segments)
        }
    }

    fn on_loss(&mut self, window: &Window, bytes_in_flight: u32, signal: LossSignal) -> Window {
        let reduced = (bytes_in_flight as f64 * self.decrease_factor) as u32;
        let ssthresh = reduced.max(window.segment_size.saturating_mul(2));
        let cwnd = match signal {
            LossSignal::TripleDuplicateAck => ssthresh,
            LossSignal::Timeout => window.segment_size,
        };
        Window {
            cwnd,
            ssthresh,
            ..*window
        }
    }
}

/// Errors parsing a congestion control name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseAlgorithmError {
    #[error("Unknown congestion control algorithm: {0}")]
    Unknown(String),

    #[error("Invalid AIMD parameters: {0} (expected aimd:<increase_segments>:<decrease_factor>)")]
    InvalidAimd(String),
}

/// Congestion control selection, resolved once when a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CongestionAlgorithm {
    #[default]
    Reno,
    Tahoe,
    Aimd {
        increase_segments: u32,
        decrease_factor: f64,
    },
}

impl CongestionAlgorithm {
    /// Instantiate the strategy.
    pub fn build(&self) -> Box<dyn CongestionControl> {
        match *self {
            CongestionAlgorithm::Reno => Box::new(Reno),
            CongestionAlgorithm::Tahoe => Box::new(Tahoe),
            CongestionAlgorithm::Aimd {
                increase_segments,
                decrease_factor,
            } => Box::new(Aimd::new(increase_segments, decrease_factor)),
        }
    }
}

impl FromStr for CongestionAlgorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "reno" | "newreno" => Ok(CongestionAlgorithm::Reno),
            "tahoe" => Ok(CongestionAlgorithm::Tahoe),
            "aimd" => Ok(CongestionAlgorithm::Aimd {
                increase_segments: 1,
                decrease_factor: 0.7,
            }),
            s if s.starts_with("aimd:") => {
                let invalid = || ParseAlgorithmError::InvalidAimd(s.to_string());
                let mut parts = s[5..].split(':');
                let increase_segments = parts
                    .next()
                    .and_then(|p| p.parse::<u32>().ok())
                    .filter(|&n| n > 0)
                    .ok_or_else(invalid)?;
                let decrease_factor = parts
                    .next()
                    .and_then(|p| p.parse::<f64>().ok())
                    .filter(|f| *f > 0.0 && *f < 1.0)
                    .ok_or_else(invalid)?;
                if parts.next().is_some() {
                    return Err(invalid());
                }
                Ok(CongestionAlgorithm::Aimd {
                    increase_segments,
                    decrease_factor,
                })
            }
            _ => Err(ParseAlgorithmError::Unknown(s.to_string())),
        }
    }
}

impl TryFrom<String> for CongestionAlgorithm {
    type Error = ParseAlgorithmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CongestionAlgorithm> for String {
    fn from(algorithm: CongestionAlgorithm) -> Self {
        algorithm.to_string()
    }
}

impl fmt::Display for CongestionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CongestionAlgorithm::Reno => write!(f, "reno"),
            CongestionAlgorithm::Tahoe => write!(f, "tahoe"),
            CongestionAlgorithm::Aimd {
                increase_segments,
                decrease_factor,
            } => write!(f, "aimd:{}:{}", increase_segments, decrease_factor),
        }
    }
}

/// A congestion window governed by a strategy and bounded by the connection.
#[derive(Debug)]
pub struct CongestionWindow {
    window: Window,
    max_cwnd: u32,
    strategy: Box<dyn CongestionControl>,
}

impl CongestionWindow {
    /// Create a window starting at `initial_cwnd` with `ssthresh = max_cwnd`.
    pub fn new(
        strategy: Box<dyn CongestionControl>,
        segment_size: u32,
        initial_cwnd: u32,
        max_cwnd: u32,
    ) -> Self {
        let segment_size = segment_size.max(1);
        let max_cwnd = max_cwnd.max(segment_size);
        Self {
            window: Window {
                cwnd: initial_cwnd.clamp(segment_size, max_cwnd),
                ssthresh: max_cwnd,
                segment_size,
            },
            max_cwnd,
            strategy,
        }
    }

    /// Current window.
    pub fn window(&self) -> Window {
        self.window
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.window.cwnd
    }

    /// Slow-start threshold in bytes.
    pub fn ssthresh(&self) -> u32 {
        self.window.ssthresh
    }

    /// Upper bound on the congestion window.
    pub fn max_cwnd(&self) -> u32 {
        self.max_cwnd
    }

    /// Name of the strategy.
    pub fn algorithm(&self) -> &'static str {
        self.strategy.name()
    }

    /// Apply a new ACK. Returns true if the window changed.
    pub fn on_ack(&mut self, bytes_acked: u32) -> bool {
        if bytes_acked == 0 {
            return false;
        }
        let cwnd = self.strategy.on_ack(&self.window, bytes_acked);
        self.apply(Window {
            cwnd,
            ..self.window
        })
    }

    /// Apply a loss signal. Returns true if the window changed.
    pub fn on_loss(&mut self, bytes_in_flight: u32, signal: LossSignal) -> bool {
        let updated = self
            .strategy
            .on_loss(&self.window, bytes_in_flight, signal);
        self.apply(updated)
    }

    fn apply(&mut self, updated: Window) -> bool {
        let mss = self.window.segment_size;
        let floor = mss.saturating_mul(2);
        let bounded = Window {
            cwnd: updated.cwnd.clamp(mss, self.max_cwnd),
            ssthresh: updated.ssthresh.clamp(floor, self.max_cwnd.max(floor)),
            segment_size: mss,
        };
        let changed = bounded != self.window;
        self.window = bounded;
        changed
    }
}
