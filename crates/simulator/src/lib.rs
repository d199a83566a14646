//! tcpsim scenario driver
//!
//! Builds the two-node TCP bulk transfer on top of `tcpsim-simulation`,
//! runs it and summarizes what happened.
//!
//! - **Configuration**: defaults, a TOML scenario file and command-line
//!   overrides, layered in that order
//! - **Scenario**: topology, addressing, applications and packet capture
//! - **Metrics**: RTT percentiles, retransmissions, congestion window,
//!   goodput and a per-flow breakdown when several senders share the link
//!
//! # Example
//!
//! ```no_run
//! use tcpsim_simulator::{Scenario, ScenarioConfig};
//!
//! let config = ScenarioConfig::new(12345).with_pcap(None);
//! let mut scenario = Scenario::build(config)?;
//! let report = scenario.run()?;
//! report.print_summary();
//! # Ok::<(), tcpsim_simulator::ScenarioError>(())
//! ```

pub mod config;
pub mod metrics;
pub mod scenario;

pub use config::{ConfigError, PcapOutput, ScenarioConfig, ScenarioFile};
pub use metrics::{FlowMetrics, FlowReport, MetricsCollector, ScenarioReport};
pub use scenario::{Scenario, ScenarioError};
