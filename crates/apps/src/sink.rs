//! Packet sink: counts bytes delivered on a listening port.

use indexmap::IndexMap;
use std::time::Duration;
use tcpsim_types::FlowId;
use tracing::{debug, trace};

/// Receives and discards data, keeping counts.
///
/// Bytes delivered while the sink is not running (before start or after
/// stop) are ignored.
#[derive(Debug, Clone)]
pub struct PacketSink {
    port: u16,
    running: bool,
    total_bytes: u64,
    first_rx: Option<Duration>,
    last_rx: Option<Duration>,
    per_flow: IndexMap<FlowId, u64>,
}

impl PacketSink {
    /// Create a sink for `port`. It counts nothing until started.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            running: false,
            total_bytes: 0,
            first_rx: None,
            last_rx: None,
            per_flow: IndexMap::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self, now: Duration) {
        debug!(port = self.port, ?now, "Sink started");
        self.running = true;
    }

    pub fn stop(&mut self, now: Duration) {
        debug!(port = self.port, ?now, total_bytes = self.total_bytes, "Sink stopped");
        self.running = false;
    }

    /// Record `bytes` delivered on `flow` (the sink-side flow id).
    pub fn on_receive(&mut self, flow: FlowId, bytes: u64, now: Duration) {
        if !self.running {
            trace!(port = self.port, %flow, bytes, "Sink not running, ignoring data");
            return;
        }
        self.total_bytes += bytes;
        *self.per_flow.entry(flow).or_insert(0) += bytes;
        self.first_rx.get_or_insert(now);
        self.last_rx = Some(now);
    }

    /// Total bytes received while running.
    pub fn total_received(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes received per flow, in order of first arrival.
    pub fn per_flow(&self) -> &IndexMap<FlowId, u64> {
        &self.per_flow
    }

    pub fn first_rx(&self) -> Option<Duration> {
        self.first_rx
    }

    pub fn last_rx(&self) -> Option<Duration> {
        self.last_rx
    }

    /// Average goodput between first and last delivery, in bits per second.
    pub fn goodput_bps(&self) -> f64 {
        match (self.first_rx, self.last_rx) {
            (Some(first), Some(last)) if last > first => {
                self.total_bytes as f64 * 8.0 / (last - first).as_secs_f64()
            }
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn flow(port: u16) -> FlowId {
        FlowId::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 9),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), port),
        )
    }

    #[test]
    fn test_counts_only_while_running() {
        let mut sink = PacketSink::new(9);
        sink.on_receive(flow(1), 100, Duration::from_secs(0));
        assert_eq!(sink.total_received(), 0);

        sink.start(Duration::from_secs(0));
        sink.on_receive(flow(1), 100, Duration::from_secs(1));
        sink.on_receive(flow(2), 50, Duration::from_secs(2));
        sink.on_receive(flow(1), 25, Duration::from_secs(3));
        sink.stop(Duration::from_secs(4));
        sink.on_receive(flow(1), 1000, Duration::from_secs(5));

        assert_eq!(sink.total_received(), 175);
        assert_eq!(sink.per_flow()[&flow(1)], 125);
        assert_eq!(sink.per_flow()[&flow(2)], 50);
        assert_eq!(sink.first_rx(), Some(Duration::from_secs(1)));
        assert_eq!(sink.last_rx(), Some(Duration::from_secs(3)));
        assert!((sink.goodput_bps() - 700.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_sink() {
        let sink = PacketSink::new(9);
        assert_eq!(sink.goodput_bps(), 0.0);
        assert!(sink.per_flow().is_empty());
    }
}
