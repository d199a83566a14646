//! Two-node bulk transfer scenario.
//!
//! ```text
//!   node 0 (senders)                      node 1 (sink)
//!   10.1.1.1 ────── point-to-point ────── 10.1.1.2:9
//! ```
//!
//! Every sender opens its own connection from an ephemeral port; they share
//! the link and its transmit queue.

use crate::config::{ConfigError, ScenarioConfig};
use crate::metrics::{FlowReport, MetricsCollector, ScenarioReport};
use hdrhistogram::CreationError;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tcpsim_apps::TrafficPattern;
use tcpsim_simulation::{
    Ipv4AddressAllocator, PacketTracer, PcapTracer, SenderSpec, SimulationError,
    SimulationRunner, TopologyError, TraceError,
};
use tcpsim_types::{AppId, NodeId};
use thiserror::Error;
use tracing::info;

/// Errors building or running a scenario.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("Failed to create RTT histogram: {0}")]
    Metrics(#[from] CreationError),

    #[error("Application {app} on node {node} is missing")]
    MissingApp { node: NodeId, app: AppId },
}

/// A built scenario, ready to run.
#[derive(Debug)]
pub struct Scenario {
    config: ScenarioConfig,
    runner: SimulationRunner<MetricsCollector>,
    sender_node: NodeId,
    senders: Vec<AppId>,
    sink: (NodeId, AppId),
}

impl Scenario {
    /// Build the topology and install the senders and the sink.
    pub fn build(config: ScenarioConfig) -> Result<Self, ScenarioError> {
        config.validate()?;

        let mut runner = SimulationRunner::with_observer(config.seed, MetricsCollector::new()?);
        runner.set_tcp_config(config.tcp.clone());

        let sender_node = runner.add_node();
        let sink_node = runner.add_node();
        let channel = runner.add_point_to_point(sender_node, sink_node, &config.link)?;

        let mut pool = Ipv4AddressAllocator::new(config.network, config.prefix_len)?;
        let [sender_addr, sink_addr] = runner.assign_addresses(channel, &mut pool)?;

        let remote = SocketAddrV4::new(sink_addr, config.sink_port);
        let senders = (0..config.flows)
            .map(|_| {
                runner.install_sender(
                    sender_node,
                    SenderSpec {
                        local: sender_addr,
                        remote,
                        pattern: TrafficPattern::ConstantBitRate {
                            rate: config.app_rate,
                        },
                        packet_size: config.payload_size,
                    },
                    config.sender_start,
                    config.simulation_time,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sink_app = runner.install_sink(
            sink_node,
            config.sink_port,
            config.sink_start,
            config.simulation_time,
        )?;

        if let Some(pcap) = &config.pcap {
            info!(dir = %pcap.dir.display(), prefix = %pcap.prefix, "Packet capture enabled");
            runner.set_tracer(PcapTracer::files(pcap.dir.clone(), pcap.prefix.clone()));
        }

        info!(
            seed = config.seed,
            %sender_addr,
            %sink_addr,
            data_rate = %config.link.data_rate,
            delay = ?config.link.delay,
            app_rate = %config.app_rate,
            flows = config.flows,
            congestion_control = %config.tcp.congestion_control,
            "Scenario built"
        );

        Ok(Self {
            config,
            runner,
            sender_node,
            senders,
            sink: (sink_node, sink_app),
        })
    }

    /// Replace the packet tracer, e.g. to capture into memory.
    pub fn set_tracer(&mut self, tracer: impl PacketTracer + 'static) {
        self.runner.set_tracer(tracer);
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    pub fn runner(&self) -> &SimulationRunner<MetricsCollector> {
        &self.runner
    }

    /// Run to the end of the simulation time and summarize.
    pub fn run(&mut self) -> Result<ScenarioReport, ScenarioError> {
        let wall_start = Instant::now();
        info!(
            until = ?self.config.simulation_time,
            "Starting simulation"
        );
        self.runner.run_until(self.config.simulation_time)?;
        self.runner.finish()?;
        let report = self.report(wall_start.elapsed())?;
        info!(
            received = report.received_bytes,
            drops = report.queue_drops,
            retransmits = report.fast_retransmits + report.timeout_retransmits,
            "Scenario complete"
        );
        Ok(report)
    }

    fn report(&self, wall_duration: Duration) -> Result<ScenarioReport, ScenarioError> {
        let (sink_node, sink_app) = self.sink;
        let sink = self
            .runner
            .sink(sink_node, sink_app)
            .ok_or(ScenarioError::MissingApp {
                node: sink_node,
                app: sink_app,
            })?;
        let metrics = self.runner.observer();
        let stats = self.runner.stats();
        let active = self
            .config
            .simulation_time
            .saturating_sub(self.config.sender_start)
            .as_secs_f64();

        let mut offered_bytes = 0;
        let mut accepted_bytes = 0;
        let mut rejected_writes = 0;
        let mut flows = Vec::with_capacity(self.senders.len());
        for &app in &self.senders {
            let sender = self
                .runner
                .sender(self.sender_node, app)
                .ok_or(ScenarioError::MissingApp {
                    node: self.sender_node,
                    app,
                })?;
            offered_bytes += sender.stats().bytes_offered;
            accepted_bytes += sender.stats().bytes_accepted;
            rejected_writes += sender.stats().writes_rejected;

            // A sender that never connected has nothing to report per flow.
            let Some(flow) = sender.flow() else {
                continue;
            };
            let received_bytes = sink
                .per_flow()
                .get(&flow.reversed())
                .copied()
                .unwrap_or(0);
            let counters = metrics.flow(flow);
            flows.push(FlowReport {
                flow,
                offered_bytes: sender.stats().bytes_offered,
                received_bytes,
                throughput_bps: if active > 0.0 {
                    received_bytes as f64 * 8.0 / active
                } else {
                    0.0
                },
                queue_drops: counters.queue_drops,
                fast_retransmits: counters.fast_retransmits,
                timeout_retransmits: counters.timeout_retransmits,
                delay_variation: counters.delay_variation(),
                max_cwnd: metrics.max_cwnd(flow),
            });
        }
        let first = flows.first().map(|f| f.flow);

        let report = ScenarioReport {
            seed: self.runner.seed(),
            simulated_duration: self.runner.now(),
            wall_duration,
            offered_bytes,
            accepted_bytes,
            rejected_writes,
            received_bytes: sink.total_received(),
            goodput_bps: sink.goodput_bps(),
            packets_transmitted: stats.packets_transmitted,
            queue_drops: stats.queue_drops,
            fast_retransmits: metrics.fast_retransmits(),
            timeout_retransmits: metrics.timeout_retransmits(),
            retransmitted_bytes: metrics.retransmitted_bytes(),
            connections_reset: metrics.connections_reset(),
            rtt_samples: 0,
            rtt_min: Duration::ZERO,
            rtt_p50: Duration::ZERO,
            rtt_p90: Duration::ZERO,
            rtt_p99: Duration::ZERO,
            rtt_max: Duration::ZERO,
            max_cwnd: first.and_then(|f| metrics.max_cwnd(f)),
            final_cwnd: first.and_then(|f| metrics.final_cwnd(f)),
            flows,
            events_processed: stats.events_processed,
        };
        Ok(report.with_rtt(metrics.rtt_histogram()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PcapOutput;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tcpsim_simulation::{LinkConfig, SharedBuffer};
    use tcpsim_types::{DataRate, DeviceId};
    use tracing_test::traced_test;

    /// In-memory captures keyed by device.
    type Captures = Arc<Mutex<BTreeMap<DeviceId, SharedBuffer>>>;

    fn memory_tracer() -> (PcapTracer<SharedBuffer>, Captures) {
        let captures = Captures::default();
        let inner = captures.clone();
        let tracer = PcapTracer::new(move |device| {
            let buffer = SharedBuffer::new();
            inner
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .insert(device, buffer.clone());
            Ok(buffer)
        });
        (tracer, captures)
    }

    fn capture_bytes(captures: &Captures) -> Vec<Vec<u8>> {
        captures
            .lock()
            .unwrap()
            .values()
            .map(SharedBuffer::contents)
            .collect()
    }

    #[traced_test]
    #[test]
    fn test_default_scenario_delivers_offered_load() {
        let config = ScenarioConfig::default().with_pcap(None);
        let mut scenario = Scenario::build(config).unwrap();
        let report = scenario.run().unwrap();

        // 1 Mbps for 9 s in 1024-byte writes
        assert_eq!(report.offered_bytes, 1098 * 1024);
        assert_eq!(report.accepted_bytes, report.offered_bytes);
        assert_eq!(report.rejected_writes, 0);
        assert!(
            report.received_bytes + 2048 >= 1_124_352,
            "received {}",
            report.received_bytes
        );
        assert!(report.received_bytes <= 1_125_000);
        assert_eq!(report.queue_drops, 0);
        assert_eq!(report.timeout_retransmits, 0);
        assert_eq!(report.connections_reset, 0);
        assert!(report.rtt_samples > 0);
        assert!(report.rtt_min >= Duration::from_millis(4));
        assert_eq!(report.simulated_duration, Duration::from_secs(10));
        assert_eq!(report.flows.len(), 1);
        assert_eq!(report.flows[0].received_bytes, report.received_bytes);
        assert_eq!(report.flows[0].queue_drops, 0);
        assert!(logs_contain("Scenario complete"));
    }

    #[test]
    fn test_bottleneck_drops_packets() {
        let link = LinkConfig::default()
            .with_data_rate(DataRate::from_kbps(256))
            .with_queue_size(Some(5));
        let config = ScenarioConfig::default()
            .with_link(link)
            .with_pcap(None);
        let offered = config.offered_bytes();
        let mut scenario = Scenario::build(config).unwrap();
        let report = scenario.run().unwrap();

        assert!(report.queue_drops > 0);
        assert!(report.received_bytes < offered);
        assert!(report.received_bytes > 0);
        assert!(report.fast_retransmits + report.timeout_retransmits > 0);
    }

    #[test]
    fn test_small_receive_buffer_recovers_with_fast_retransmit() {
        let link = LinkConfig::default()
            .with_data_rate(DataRate::from_kbps(256))
            .with_queue_size(Some(5));
        let base = ScenarioConfig::default();
        let tcp = base.tcp.clone().with_recv_buffer_size(16_384);
        let config = base.with_link(link).with_tcp(tcp).with_pcap(None);
        let mut scenario = Scenario::build(config).unwrap();
        let report = scenario.run().unwrap();

        assert!(report.queue_drops > 0);
        assert!(
            report.fast_retransmits > 0,
            "fast {} timeout {}",
            report.fast_retransmits,
            report.timeout_retransmits
        );
    }

    #[test]
    fn test_parallel_flows_share_the_link() {
        let link = LinkConfig::default()
            .with_data_rate(DataRate::from_mbps(2))
            .with_queue_size(Some(10));
        let config = ScenarioConfig::default()
            .with_flows(5)
            .with_link(link)
            .with_simulation_time(Duration::from_secs(3))
            .with_pcap(None);
        let mut scenario = Scenario::build(config).unwrap();
        let report = scenario.run().unwrap();

        assert_eq!(report.flows.len(), 5);
        let mut ports: Vec<_> = report.flows.iter().map(|f| f.flow.local.port()).collect();
        ports.dedup();
        assert_eq!(ports.len(), 5);

        // 1 Mbps for 2 s in 1024-byte writes, per sender
        assert!(report.flows.iter().all(|f| f.offered_bytes == 244 * 1024));
        assert_eq!(report.offered_bytes, 5 * 244 * 1024);
        assert!(report.flows.iter().all(|f| f.received_bytes > 0));
        assert!(report.flows.iter().all(|f| f.throughput_bps > 0.0));
        assert_eq!(
            report.flows.iter().map(|f| f.received_bytes).sum::<u64>(),
            report.received_bytes
        );
        // Offered load is 2.5x the link rate
        assert!(report.queue_drops > 0);
        assert_eq!(
            report.flows.iter().map(|f| f.queue_drops).sum::<u64>(),
            report.queue_drops
        );
        assert!(report.flows.iter().any(|f| f.delay_variation > Duration::ZERO));
    }

    #[test]
    fn test_captures_are_deterministic() {
        let run = |seed: u64| {
            let config = ScenarioConfig::new(seed)
                .with_simulation_time(Duration::from_secs(2))
                .with_pcap(None);
            let mut scenario = Scenario::build(config).unwrap();
            let (tracer, captures) = memory_tracer();
            scenario.set_tracer(tracer);
            let report = scenario.run().unwrap();
            (report, capture_bytes(&captures))
        };

        let (first_report, first) = run(42);
        let (second_report, second) = run(42);
        let (_, other) = run(43);

        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|bytes| bytes.len() > 24));
        assert_eq!(first, second);
        assert_eq!(first_report.received_bytes, second_report.received_bytes);
        assert_eq!(first_report.rtt_p50, second_report.rtt_p50);
        // Initial sequence numbers come from the seed
        assert_ne!(first, other);
    }

    #[test]
    fn test_writes_capture_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScenarioConfig::default()
            .with_simulation_time(Duration::from_secs(2))
            .with_pcap(Some(PcapOutput {
                dir: dir.path().to_path_buf(),
                prefix: "tcp-reno-simulation".to_string(),
            }));
        let mut scenario = Scenario::build(config).unwrap();
        scenario.run().unwrap();

        for name in ["tcp-reno-simulation-0-0.pcap", "tcp-reno-simulation-1-0.pcap"] {
            let bytes = std::fs::read(dir.path().join(name)).unwrap();
            assert_eq!(&bytes[..4], &0xa1b2_c3d4u32.to_le_bytes());
            assert!(bytes.len() > 24, "{name} has no records");
        }
    }

    #[test]
    fn test_unwritable_capture_dir_fails_at_finish() {
        let config = ScenarioConfig::default()
            .with_simulation_time(Duration::from_secs(2))
            .with_pcap(Some(PcapOutput {
                dir: "/nonexistent/tcpsim".into(),
                prefix: "run".to_string(),
            }));
        let mut scenario = Scenario::build(config).unwrap();
        assert!(matches!(scenario.run(), Err(ScenarioError::Trace(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ScenarioConfig::default().with_payload_size(0);
        assert!(matches!(
            Scenario::build(config),
            Err(ScenarioError::Config(_))
        ));
    }
}
