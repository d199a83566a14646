//! Round-trip time estimation (RFC 6298).

use crate::TcpConfig;
use std::time::Duration;

/// Longest exponential backoff applied to the RTO.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Smoothed RTT estimator and retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    backoff_shift: u32,
    min_rto: Duration,
    max_rto: Duration,
    granularity: Duration,
}

impl RttEstimator {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.initial_rto.clamp(config.min_rto, config.max_rto),
            backoff_shift: 0,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            granularity: config.clock_granularity,
        }
    }

    /// Feed a valid RTT measurement.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let deviation = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                // rttvar = 3/4 rttvar + 1/4 |srtt - rtt|
                self.rttvar = (self.rttvar * 3 + deviation) / 4;
                // srtt = 7/8 srtt + 1/8 rtt
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        let rto = srtt + self.granularity.max(self.rttvar * 4);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
        self.backoff_shift = 0;
    }

    /// Double the timeout after a retransmission timeout.
    pub fn backoff(&mut self) {
        self.backoff_shift = (self.backoff_shift + 1).min(MAX_BACKOFF_SHIFT);
    }

    /// Clear the backoff once new data has been acknowledged.
    pub fn reset_backoff(&mut self) {
        self.backoff_shift = 0;
    }

    /// Current retransmission timeout including backoff.
    pub fn rto(&self) -> Duration {
        self.rto
            .checked_mul(1 << self.backoff_shift)
            .unwrap_or(self.max_rto)
            .min(self.max_rto)
    }

    /// Smoothed RTT, if any sample was taken.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}
