//! Traffic generation.
//!
//! A [`TrafficGenerator`] is a lazy schedule of application writes. During
//! an "on" period it emits one packet every `packet_size * 8 / rate`; the
//! first packet of a period comes one such interval after the period
//! starts. Bits accumulated in an on period that ends mid-packet carry
//! over, so the long-run rate is `rate * on / (on + off)`.

use std::iter::FusedIterator;
use std::time::Duration;
use tcpsim_types::DataRate;
use thiserror::Error;

/// Errors constructing a generator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeneratorError {
    #[error("Packet size must be positive")]
    ZeroPacketSize,

    #[error("Data rate must be positive")]
    ZeroRate,

    #[error("On period must be positive")]
    ZeroOnPeriod,

    #[error("Stop time {stop:?} is before start time {start:?}")]
    StopBeforeStart { start: Duration, stop: Duration },
}

/// Shape of the generated traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficPattern {
    /// Send continuously at `rate`.
    ConstantBitRate { rate: DataRate },

    /// Alternate `on` periods sending at `rate` with silent `off` periods.
    /// The first on period begins after one off period.
    OnOff {
        rate: DataRate,
        on: Duration,
        off: Duration,
    },
}

impl TrafficPattern {
    pub fn rate(&self) -> DataRate {
        match self {
            TrafficPattern::ConstantBitRate { rate } | TrafficPattern::OnOff { rate, .. } => *rate,
        }
    }
}

/// One application write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    /// Simulation time of the write.
    pub at: Duration,
    /// Bytes written.
    pub bytes: u64,
}

/// Lazy sequence of writes between `start` (exclusive) and `stop`
/// (exclusive).
#[derive(Debug, Clone)]
pub struct TrafficGenerator {
    pattern: TrafficPattern,
    packet_size: u64,
    stop: Duration,
    /// Time the last packet finished accumulating (or the current on period
    /// began).
    cursor: Duration,
    /// End of the current on period; `None` for constant bit rate.
    on_end: Option<Duration>,
    residual_bits: u64,
    done: bool,
}

impl TrafficGenerator {
    pub fn new(
        pattern: TrafficPattern,
        packet_size: u64,
        start: Duration,
        stop: Duration,
    ) -> Result<Self, GeneratorError> {
        if packet_size == 0 {
            return Err(GeneratorError::ZeroPacketSize);
        }
        if pattern.rate().bps() == 0 {
            return Err(GeneratorError::ZeroRate);
        }
        if stop < start {
            return Err(GeneratorError::StopBeforeStart { start, stop });
        }
        let (cursor, on_end) = match pattern {
            TrafficPattern::ConstantBitRate { .. } => (start, None),
            TrafficPattern::OnOff { on, off, .. } => {
                if on.is_zero() {
                    return Err(GeneratorError::ZeroOnPeriod);
                }
                let begin = start.saturating_add(off);
                (begin, Some(begin.saturating_add(on)))
            }
        };
        Ok(Self {
            pattern,
            packet_size,
            stop,
            cursor,
            on_end,
            residual_bits: 0,
            done: false,
        })
    }

    pub fn pattern(&self) -> &TrafficPattern {
        &self.pattern
    }

    pub fn packet_size(&self) -> u64 {
        self.packet_size
    }

    /// Interval between packets while sending.
    pub fn interval(&self) -> Duration {
        self.pattern.rate().time_for_bits(self.packet_size * 8)
    }

    fn finish(&mut self) -> Option<SendRequest> {
        self.done = true;
        None
    }
}

impl Iterator for TrafficGenerator {
    type Item = SendRequest;

    fn next(&mut self) -> Option<SendRequest> {
        if self.done {
            return None;
        }
        let rate = self.pattern.rate();
        let packet_bits = self.packet_size * 8;

        loop {
            if self.cursor >= self.stop {
                return self.finish();
            }
            let needed = packet_bits.saturating_sub(self.residual_bits);
            let at = self.cursor.saturating_add(rate.time_for_bits(needed));

            match (self.on_end, self.pattern) {
                (Some(on_end), TrafficPattern::OnOff { on, off, .. }) if at > on_end => {
                    // Period ends mid-packet: keep what accumulated.
                    let accumulated = rate.bits_in(on_end.saturating_sub(self.cursor));
                    self.residual_bits = (self.residual_bits + accumulated).min(packet_bits - 1);
                    self.cursor = on_end.saturating_add(off);
                    self.on_end = Some(self.cursor.saturating_add(on));
                }
                _ => {
                    if at >= self.stop {
                        return self.finish();
                    }
                    self.residual_bits = 0;
                    self.cursor = at;
                    return Some(SendRequest {
                        at,
                        bytes: self.packet_size,
                    });
                }
            }
        }
    }
}

impl FusedIterator for TrafficGenerator {}
