//! TCP configuration.

use crate::CongestionAlgorithm;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tcpsim_types::MAX_SEGMENT_PAYLOAD;

/// Per-stack TCP parameters.
///
/// Every connection created by a stack gets a copy of its config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Maximum segment size (payload bytes per segment).
    pub segment_size: u32,

    /// Initial congestion window in segments.
    pub initial_cwnd_segments: u32,

    /// Upper bound on the congestion window in bytes. Also the initial
    /// slow-start threshold.
    pub max_cwnd: u32,

    /// Bytes the application may have written but not yet acknowledged.
    pub send_buffer_size: u64,

    /// Receive buffer size in bytes. The advertised window is capped at
    /// 65535 since window scaling is not negotiated.
    pub recv_buffer_size: u32,

    /// Retransmission timeout before the first RTT sample.
    #[serde(with = "duration_millis")]
    pub initial_rto: Duration,

    /// Lower bound on the retransmission timeout.
    #[serde(with = "duration_millis")]
    pub min_rto: Duration,

    /// Upper bound on the retransmission timeout, including backoff.
    #[serde(with = "duration_millis")]
    pub max_rto: Duration,

    /// Clock granularity term of the RTO computation.
    #[serde(with = "duration_millis")]
    pub clock_granularity: Duration,

    /// Consecutive timeouts of the same data before the connection is reset.
    pub max_retransmits: u32,

    /// Duplicate ACKs that trigger fast retransmit.
    pub dup_ack_threshold: u32,

    /// Congestion control strategy for new connections.
    pub congestion_control: CongestionAlgorithm,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            segment_size: 536,
            initial_cwnd_segments: 10,
            max_cwnd: 1 << 20,
            send_buffer_size: 131_072,
            recv_buffer_size: 131_072,
            initial_rto: Duration::from_secs(1),
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            clock_granularity: Duration::from_millis(1),
            max_retransmits: 6,
            dup_ack_threshold: 3,
            congestion_control: CongestionAlgorithm::Reno,
        }
    }
}

impl TcpConfig {
    /// Set the maximum segment size, bounded by what one IPv4 datagram
    /// can carry.
    pub fn with_segment_size(mut self, segment_size: u32) -> Self {
        self.segment_size = segment_size.clamp(1, MAX_SEGMENT_PAYLOAD);
        self
    }

    /// Set the congestion control strategy.
    pub fn with_congestion_control(mut self, algorithm: CongestionAlgorithm) -> Self {
        self.congestion_control = algorithm;
        self
    }

    /// Set the initial congestion window in segments.
    pub fn with_initial_cwnd_segments(mut self, segments: u32) -> Self {
        self.initial_cwnd_segments = segments.max(1);
        self
    }

    /// Set the maximum congestion window in bytes.
    pub fn with_max_cwnd(mut self, max_cwnd: u32) -> Self {
        self.max_cwnd = max_cwnd;
        self
    }

    /// Set the send buffer size.
    pub fn with_send_buffer_size(mut self, bytes: u64) -> Self {
        self.send_buffer_size = bytes;
        self
    }

    /// Set the receive buffer size.
    pub fn with_recv_buffer_size(mut self, bytes: u32) -> Self {
        self.recv_buffer_size = bytes;
        self
    }

    /// Set the minimum retransmission timeout.
    pub fn with_min_rto(mut self, min_rto: Duration) -> Self {
        self.min_rto = min_rto;
        self
    }

    /// Set the number of timeouts tolerated before reset.
    pub fn with_max_retransmits(mut self, max_retransmits: u32) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    /// Initial congestion window in bytes.
    pub fn initial_cwnd(&self) -> u32 {
        self.initial_cwnd_segments
            .saturating_mul(self.segment_size)
    }

    /// Receive window advertised in segment headers.
    pub fn advertised_window(&self) -> u16 {
        self.recv_buffer_size.min(u16::MAX as u32) as u16
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TcpConfig::default();
        assert_eq!(config.initial_cwnd(), 5360);
        assert_eq!(config.advertised_window(), 65535);
        assert_eq!(config.congestion_control, CongestionAlgorithm::Reno);
    }

    #[test]
    fn test_builders() {
        let config = TcpConfig::default()
            .with_segment_size(512)
            .with_congestion_control(CongestionAlgorithm::Tahoe)
            .with_min_rto(Duration::from_millis(200));
        assert_eq!(config.segment_size, 512);
        assert_eq!(config.initial_cwnd(), 5120);
        assert_eq!(config.congestion_control, CongestionAlgorithm::Tahoe);
        assert_eq!(config.min_rto, Duration::from_millis(200));
    }

    #[test]
    fn test_segment_size_is_bounded() {
        assert_eq!(TcpConfig::default().with_segment_size(0).segment_size, 1);
        assert_eq!(
            TcpConfig::default().with_segment_size(u32::MAX).segment_size,
            MAX_SEGMENT_PAYLOAD
        );
    }
}
