//! Metrics collection and the end-of-run report.

use hdrhistogram::{CreationError, Histogram};
use indexmap::IndexMap;
use std::net::SocketAddrV4;
use std::time::Duration;
use tcpsim_core::{Action, RetransmitKind};
use tcpsim_simulation::SimulationObserver;
use tcpsim_types::{DeviceId, FlowId, NodeId, Packet};

/// Counters for one connection, keyed by the flow id of the endpoint that
/// reported them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowMetrics {
    pub rtt_samples: u64,
    last_rtt: Option<Duration>,
    /// Sum of absolute differences between consecutive RTT samples.
    rtt_deltas: Duration,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    /// Packets of this flow dropped by a full transmit queue.
    pub queue_drops: u64,
}

impl FlowMetrics {
    fn record_rtt(&mut self, rtt: Duration) {
        if let Some(last) = self.last_rtt {
            self.rtt_deltas += if rtt > last { rtt - last } else { last - rtt };
        }
        self.last_rtt = Some(rtt);
        self.rtt_samples += 1;
    }

    /// Mean absolute change between consecutive RTT samples.
    pub fn delay_variation(&self) -> Duration {
        match self.rtt_samples {
            0 | 1 => Duration::ZERO,
            n => self.rtt_deltas / u32::try_from(n - 1).unwrap_or(u32::MAX),
        }
    }
}

/// Collects TCP metrics from runner notifications.
pub struct MetricsCollector {
    /// RTT samples in microseconds.
    rtt: Histogram<u64>,
    fast_retransmits: u64,
    timeout_retransmits: u64,
    retransmitted_bytes: u64,
    connections_established: u64,
    connections_reset: u64,
    queue_drops: u64,
    /// Congestion window of each flow over time.
    cwnd_trace: Vec<(Duration, FlowId, u32)>,
    per_flow: IndexMap<FlowId, FlowMetrics>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("rtt_samples", &self.rtt.len())
            .field("fast_retransmits", &self.fast_retransmits)
            .field("timeout_retransmits", &self.timeout_retransmits)
            .field("queue_drops", &self.queue_drops)
            .finish()
    }
}

impl MetricsCollector {
    pub fn new() -> Result<Self, CreationError> {
        Ok(Self {
            rtt: Histogram::new(3)?,
            fast_retransmits: 0,
            timeout_retransmits: 0,
            retransmitted_bytes: 0,
            connections_established: 0,
            connections_reset: 0,
            queue_drops: 0,
            cwnd_trace: Vec::new(),
            per_flow: IndexMap::new(),
        })
    }

    /// Counters reported by the endpoint whose flow id is `flow`, in order of
    /// first appearance.
    pub fn per_flow(&self) -> &IndexMap<FlowId, FlowMetrics> {
        &self.per_flow
    }

    /// Counters for `flow`, with queue drops summed over both directions.
    pub fn flow(&self, flow: FlowId) -> FlowMetrics {
        let mut metrics = self.per_flow.get(&flow).cloned().unwrap_or_default();
        if let Some(reverse) = self.per_flow.get(&flow.reversed()) {
            metrics.queue_drops += reverse.queue_drops;
        }
        metrics
    }

    pub fn rtt_histogram(&self) -> &Histogram<u64> {
        &self.rtt
    }

    pub fn cwnd_trace(&self) -> &[(Duration, FlowId, u32)] {
        &self.cwnd_trace
    }

    /// Largest congestion window reached by `flow`.
    pub fn max_cwnd(&self, flow: FlowId) -> Option<u32> {
        self.cwnd_trace
            .iter()
            .filter(|(_, f, _)| *f == flow)
            .map(|(_, _, cwnd)| *cwnd)
            .max()
    }

    /// Latest congestion window of `flow`.
    pub fn final_cwnd(&self, flow: FlowId) -> Option<u32> {
        self.cwnd_trace
            .iter()
            .rev()
            .find(|(_, f, _)| *f == flow)
            .map(|(_, _, cwnd)| *cwnd)
    }

    pub fn fast_retransmits(&self) -> u64 {
        self.fast_retransmits
    }

    pub fn timeout_retransmits(&self) -> u64 {
        self.timeout_retransmits
    }

    pub fn retransmitted_bytes(&self) -> u64 {
        self.retransmitted_bytes
    }

    pub fn connections_established(&self) -> u64 {
        self.connections_established
    }

    pub fn connections_reset(&self) -> u64 {
        self.connections_reset
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops
    }
}

impl SimulationObserver for MetricsCollector {
    fn on_action(&mut self, now: Duration, _node: NodeId, action: &Action) {
        match action {
            Action::RttSampled { flow, rtt } => {
                self.rtt.saturating_record(rtt.as_micros() as u64);
                self.per_flow.entry(*flow).or_default().record_rtt(*rtt);
            }
            Action::Retransmitted { flow, kind, bytes } => {
                let counters = self.per_flow.entry(*flow).or_default();
                match kind {
                    RetransmitKind::Fast => {
                        self.fast_retransmits += 1;
                        counters.fast_retransmits += 1;
                    }
                    RetransmitKind::Timeout => {
                        self.timeout_retransmits += 1;
                        counters.timeout_retransmits += 1;
                    }
                }
                self.retransmitted_bytes += u64::from(*bytes);
            }
            Action::CongestionWindowChanged { flow, cwnd, .. } => {
                self.cwnd_trace.push((now, *flow, *cwnd));
            }
            Action::ConnectionEstablished { .. } => self.connections_established += 1,
            Action::ConnectionClosed { reset: true, .. } => self.connections_reset += 1,
            _ => {}
        }
    }

    fn on_drop(&mut self, _now: Duration, _device: DeviceId, packet: &Packet) {
        self.queue_drops += 1;
        let flow = FlowId::new(
            SocketAddrV4::new(packet.src(), packet.tcp().src_port),
            SocketAddrV4::new(packet.dst(), packet.tcp().dst_port),
        );
        self.per_flow.entry(flow).or_default().queue_drops += 1;
    }
}

/// One sender's share of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowReport {
    /// Sender-side flow id.
    pub flow: FlowId,
    pub offered_bytes: u64,
    pub received_bytes: u64,
    /// Received bits over the sender's active period, per second.
    pub throughput_bps: f64,
    /// Data and ACK packets of this connection dropped at a full queue.
    pub queue_drops: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    /// Mean absolute change between consecutive RTT samples.
    pub delay_variation: Duration,
    pub max_cwnd: Option<u32>,
}

/// Summary of one scenario run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    pub seed: u64,
    /// Simulated time covered.
    pub simulated_duration: Duration,
    /// Host time the run took.
    pub wall_duration: Duration,

    /// Bytes the sender tried to write.
    pub offered_bytes: u64,
    /// Bytes the sender's socket accepted.
    pub accepted_bytes: u64,
    /// Writes refused by a full send buffer.
    pub rejected_writes: u64,
    /// Bytes counted by the sink.
    pub received_bytes: u64,
    /// Sink goodput between first and last delivery, in bits per second.
    pub goodput_bps: f64,

    pub packets_transmitted: u64,
    pub queue_drops: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub retransmitted_bytes: u64,
    pub connections_reset: u64,

    pub rtt_samples: u64,
    pub rtt_min: Duration,
    pub rtt_p50: Duration,
    pub rtt_p90: Duration,
    pub rtt_p99: Duration,
    pub rtt_max: Duration,

    /// First sender's largest and final congestion window, in bytes.
    pub max_cwnd: Option<u32>,
    pub final_cwnd: Option<u32>,

    /// One entry per sender, in install order.
    pub flows: Vec<FlowReport>,

    pub events_processed: u64,
}

impl ScenarioReport {
    /// RTT quantiles from a histogram of microsecond samples.
    pub(crate) fn with_rtt(mut self, rtt: &Histogram<u64>) -> Self {
        self.rtt_samples = rtt.len();
        if !rtt.is_empty() {
            self.rtt_min = Duration::from_micros(rtt.min());
            self.rtt_p50 = Duration::from_micros(rtt.value_at_quantile(0.50));
            self.rtt_p90 = Duration::from_micros(rtt.value_at_quantile(0.90));
            self.rtt_p99 = Duration::from_micros(rtt.value_at_quantile(0.99));
            self.rtt_max = Duration::from_micros(rtt.max());
        }
        self
    }

    /// Fraction of offered bytes that reached the sink.
    pub fn delivery_ratio(&self) -> f64 {
        if self.offered_bytes == 0 {
            0.0
        } else {
            self.received_bytes as f64 / self.offered_bytes as f64
        }
    }

    pub fn print_summary(&self) {
        println!("\n═══════════════════════════════════════════");
        println!("         TCP SIMULATION REPORT             ");
        println!("═══════════════════════════════════════════");
        println!();
        println!("Traffic:");
        println!("  Offered:    {} bytes", self.offered_bytes);
        println!("  Accepted:   {} bytes", self.accepted_bytes);
        println!("  Rejected:   {} writes", self.rejected_writes);
        println!("  Received:   {} bytes", self.received_bytes);
        println!("  Delivered:  {:.2}%", self.delivery_ratio() * 100.0);
        println!("  Goodput:    {:.3} Mbps", self.goodput_bps / 1_000_000.0);
        println!();
        println!("Link:");
        println!("  Packets:    {}", self.packets_transmitted);
        println!("  Drops:      {}", self.queue_drops);
        println!();
        println!("TCP:");
        println!("  Fast retransmits:    {}", self.fast_retransmits);
        println!("  Timeout retransmits: {}", self.timeout_retransmits);
        println!("  Retransmitted bytes: {}", self.retransmitted_bytes);
        println!("  Resets:              {}", self.connections_reset);
        if let (Some(max), Some(last)) = (self.max_cwnd, self.final_cwnd) {
            println!("  cwnd max/final:      {} / {} bytes", max, last);
        }
        if self.flows.len() > 1 {
            println!();
            println!("Per flow:");
            for (i, flow) in self.flows.iter().enumerate() {
                println!(
                    "  Flow {} ({}): {:.3} Mbps, {} drops, {} retransmits, jitter {:.3}ms",
                    i + 1,
                    flow.flow.local,
                    flow.throughput_bps / 1_000_000.0,
                    flow.queue_drops,
                    flow.fast_retransmits + flow.timeout_retransmits,
                    flow.delay_variation.as_secs_f64() * 1000.0
                );
            }
        }
        println!();
        println!("RTT ({} samples):", self.rtt_samples);
        println!("  Min:  {:.3}ms", self.rtt_min.as_secs_f64() * 1000.0);
        println!("  P50:  {:.3}ms", self.rtt_p50.as_secs_f64() * 1000.0);
        println!("  P90:  {:.3}ms", self.rtt_p90.as_secs_f64() * 1000.0);
        println!("  P99:  {:.3}ms", self.rtt_p99.as_secs_f64() * 1000.0);
        println!("  Max:  {:.3}ms", self.rtt_max.as_secs_f64() * 1000.0);
        println!();
        println!(
            "Duration: {:.2}s (simulated: {:.3}s, {} events, seed {})",
            self.wall_duration.as_secs_f64(),
            self.simulated_duration.as_secs_f64(),
            self.events_processed,
            self.seed
        );
        println!("═══════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tcpsim_types::{PacketUid, TcpFlags, TcpSegment};

    fn flow() -> FlowId {
        FlowId::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 49153),
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 2), 9),
        )
    }

    #[test]
    fn test_collects_tcp_actions() {
        let mut metrics = MetricsCollector::new().unwrap();
        let node = NodeId(0);
        let t = Duration::from_secs(1);
        for ms in [4, 5, 6, 40] {
            metrics.on_action(
                t,
                node,
                &Action::RttSampled {
                    flow: flow(),
                    rtt: Duration::from_millis(ms),
                },
            );
        }
        metrics.on_action(
            t,
            node,
            &Action::Retransmitted {
                flow: flow(),
                kind: RetransmitKind::Fast,
                bytes: 512,
            },
        );
        metrics.on_action(
            t,
            node,
            &Action::Retransmitted {
                flow: flow(),
                kind: RetransmitKind::Timeout,
                bytes: 512,
            },
        );
        for cwnd in [5120, 10240, 2048] {
            metrics.on_action(
                t,
                node,
                &Action::CongestionWindowChanged {
                    flow: flow(),
                    cwnd,
                    ssthresh: 65535,
                },
            );
        }

        assert_eq!(metrics.rtt_histogram().len(), 4);
        assert_eq!(metrics.fast_retransmits(), 1);
        assert_eq!(metrics.timeout_retransmits(), 1);
        assert_eq!(metrics.retransmitted_bytes(), 1024);
        assert_eq!(metrics.max_cwnd(flow()), Some(10240));
        assert_eq!(metrics.final_cwnd(flow()), Some(2048));
        assert_eq!(metrics.final_cwnd(flow().reversed()), None);
    }

    #[test]
    fn test_per_flow_counters() {
        let mut metrics = MetricsCollector::new().unwrap();
        let node = NodeId(0);
        let t = Duration::from_secs(1);
        for ms in [10, 14, 11, 11] {
            metrics.on_action(
                t,
                node,
                &Action::RttSampled {
                    flow: flow(),
                    rtt: Duration::from_millis(ms),
                },
            );
        }
        metrics.on_action(
            t,
            node,
            &Action::Retransmitted {
                flow: flow(),
                kind: RetransmitKind::Fast,
                bytes: 512,
            },
        );

        let data = Packet::new(
            PacketUid(1),
            *flow().local.ip(),
            *flow().remote.ip(),
            segment(flow(), 512),
        )
        .unwrap();
        let ack = Packet::new(
            PacketUid(2),
            *flow().remote.ip(),
            *flow().local.ip(),
            segment(flow().reversed(), 0),
        )
        .unwrap();
        let device = DeviceId::new(node, 0);
        metrics.on_drop(t, device, &data);
        metrics.on_drop(t, device, &data);
        metrics.on_drop(t, device, &ack);

        let counters = metrics.flow(flow());
        assert_eq!(counters.rtt_samples, 4);
        // |14-10| + |11-14| + |11-11| over three steps
        assert_eq!(counters.delay_variation(), Duration::from_millis(7) / 3);
        assert_eq!(counters.fast_retransmits, 1);
        assert_eq!(counters.queue_drops, 3);
        assert_eq!(metrics.queue_drops(), 3);
        assert_eq!(metrics.per_flow().len(), 2);
    }

    fn segment(flow: FlowId, payload_len: u32) -> TcpSegment {
        TcpSegment {
            src_port: flow.local.port(),
            dst_port: flow.remote.port(),
            seq: 1,
            ack: 1,
            flags: TcpFlags::ACK,
            window: 65535,
            payload_len,
        }
    }

    #[test]
    fn test_report_rtt_quantiles() {
        let mut histogram = Histogram::<u64>::new(3).unwrap();
        for us in 1..=100u64 {
            histogram.record(us * 1000).unwrap();
        }
        let report = empty_report().with_rtt(&histogram);
        assert_eq!(report.rtt_samples, 100);
        assert_eq!(report.rtt_min, Duration::from_millis(1));
        // 3 significant digits
        let p50 = report.rtt_p50.as_micros() as i64;
        assert!((p50 - 50_000).abs() <= 50, "p50 = {p50}");
        assert!(report.rtt_max >= Duration::from_millis(100));
    }

    fn empty_report() -> ScenarioReport {
        ScenarioReport {
            seed: 0,
            simulated_duration: Duration::ZERO,
            wall_duration: Duration::ZERO,
            offered_bytes: 0,
            accepted_bytes: 0,
            rejected_writes: 0,
            received_bytes: 0,
            goodput_bps: 0.0,
            packets_transmitted: 0,
            queue_drops: 0,
            fast_retransmits: 0,
            timeout_retransmits: 0,
            retransmitted_bytes: 0,
            connections_reset: 0,
            rtt_samples: 0,
            rtt_min: Duration::ZERO,
            rtt_p50: Duration::ZERO,
            rtt_p90: Duration::ZERO,
            rtt_p99: Duration::ZERO,
            rtt_max: Duration::ZERO,
            max_cwnd: None,
            final_cwnd: None,
            flows: Vec::new(),
            events_processed: 0,
        }
    }
}
