//! tcpsim CLI
//!
//! Run the two-node TCP transfer with configurable parameters.
//!
//! # Example
//!
//! ```bash
//! # Reference run: 1 Mbps of 1024-byte writes over a 5 Mbps / 2 ms link
//! tcpsim --seed 42
//!
//! # Congested bottleneck with a small queue and no captures
//! tcpsim --data-rate 256Kbps --queue-size 5 --no-pcap
//!
//! # Five parallel flows competing for a 2 Mbps link
//! tcpsim --flows 5 --data-rate 2Mbps -t 3
//!
//! # Start from a scenario file, override one value
//! tcpsim --config scenario.toml --congestion-control tahoe
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tcpsim_simulator::{Scenario, ScenarioConfig, ScenarioFile};
use tcpsim_tcp::CongestionAlgorithm;
use tcpsim_types::DataRate;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// tcpsim
///
/// Simulates a TCP bulk transfer between two nodes joined by a
/// point-to-point link. Reproducible when the same seed is used.
#[derive(Parser, Debug)]
#[command(name = "tcpsim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Application write size in bytes [default: 1024]
    #[arg(long)]
    payload_size: Option<u64>,

    /// TCP segment size in bytes [default: 512]
    #[arg(long)]
    segment_size: Option<u32>,

    /// Simulation time in seconds [default: 10]
    #[arg(short = 't', long)]
    simulation_time: Option<f64>,

    /// Random seed for reproducible results. When omitted, a random seed is used.
    #[arg(long)]
    seed: Option<u64>,

    /// Link data rate, e.g. "5Mbps" [default: 5Mbps]
    #[arg(long)]
    data_rate: Option<DataRate>,

    /// Link propagation delay in milliseconds [default: 2]
    #[arg(long)]
    delay_ms: Option<f64>,

    /// Sender application rate [default: 1Mbps]
    #[arg(long)]
    app_rate: Option<DataRate>,

    /// Number of parallel senders sharing the link [default: 1]
    #[arg(long)]
    flows: Option<usize>,

    /// Transmit queue size in packets, 0 for unbounded [default: 100]
    #[arg(long)]
    queue_size: Option<usize>,

    /// Congestion control: reno, tahoe, aimd or aimd:<segments>:<factor> [default: reno]
    #[arg(long)]
    congestion_control: Option<CongestionAlgorithm>,

    /// Capture file prefix [default: tcp-reno-simulation]
    #[arg(long)]
    pcap_prefix: Option<String>,

    /// Directory for capture files [default: .]
    #[arg(long)]
    pcap_dir: Option<PathBuf>,

    /// Do not write capture files
    #[arg(long)]
    no_pcap: bool,

    /// TOML scenario file. Flags override its values.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ScenarioFile {
        ScenarioFile {
            seed: self.seed,
            payload_size: self.payload_size,
            segment_size: self.segment_size,
            simulation_time: self.simulation_time,
            data_rate: self.data_rate,
            delay_ms: self.delay_ms,
            app_rate: self.app_rate,
            flows: self.flows,
            queue_size: self.queue_size,
            congestion_control: self.congestion_control,
            pcap: self.no_pcap.then_some(false),
            pcap_prefix: self.pcap_prefix.clone(),
            pcap_dir: self.pcap_dir.clone(),
            tcp: None,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,tcpsim_simulator=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ScenarioConfig::new(rand::random());
    if let Some(path) = &args.config {
        let file = ScenarioFile::load(path)?;
        config = file
            .apply(config)
            .with_context(|| format!("invalid scenario file {}", path.display()))?;
    }
    let config = args.overrides().apply(config)?;

    info!(
        seed = config.seed,
        payload_size = config.payload_size,
        segment_size = config.segment_size(),
        simulation_time_secs = config.simulation_time.as_secs_f64(),
        data_rate = %config.link.data_rate,
        app_rate = %config.app_rate,
        flows = config.flows,
        pcap = config.pcap.is_some(),
        "Configuration"
    );

    let mut scenario = Scenario::build(config)?;
    let report = scenario.run()?;
    report.print_summary();

    Ok(())
}
