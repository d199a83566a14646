//! Configuration types for the simulator.
//!
//! [`ScenarioConfig`] holds validated, typed values. [`ScenarioFile`] is
//! the loose form read from TOML or assembled from command-line flags;
//! every field is optional and [`ScenarioFile::apply`] overlays the ones
//! that are set.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcpsim_simulation::LinkConfig;
use tcpsim_tcp::{CongestionAlgorithm, TcpConfig, EPHEMERAL_PORT_START};
use tcpsim_types::{DataRate, MAX_SEGMENT_PAYLOAD};
use thiserror::Error;

/// Errors loading or validating a scenario configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Where packet captures go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcapOutput {
    pub dir: PathBuf,
    /// File name prefix; files are `<prefix>-<node>-<device>.pcap`.
    pub prefix: String,
}

impl Default for PcapOutput {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            prefix: "tcp-reno-simulation".to_string(),
        }
    }
}

/// Configuration for a simulation run.
#[derive(Clone, Debug, PartialEq)]
pub struct ScenarioConfig {
    /// Random seed for deterministic simulation.
    pub seed: u64,

    /// Bytes per application write.
    pub payload_size: u64,

    /// Both applications stop at this time, and the run ends.
    pub simulation_time: Duration,

    /// When the sender starts writing.
    pub sender_start: Duration,

    /// When the sink starts counting.
    pub sink_start: Duration,

    /// Port the sink listens on.
    pub sink_port: u16,

    /// Each sender's constant data rate.
    pub app_rate: DataRate,

    /// Parallel senders on node 0, all writing to the one sink.
    pub flows: usize,

    /// Point-to-point link between the two nodes.
    pub link: LinkConfig,

    /// Network both devices are addressed from.
    pub network: Ipv4Addr,
    pub prefix_len: u8,

    /// TCP parameters for both nodes.
    pub tcp: TcpConfig,

    /// Packet capture; `None` disables it.
    pub pcap: Option<PcapOutput>,
}

impl ScenarioConfig {
    /// Create a configuration with the given seed and default parameters.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            payload_size: 1024,
            simulation_time: Duration::from_secs(10),
            sender_start: Duration::from_secs(1),
            sink_start: Duration::ZERO,
            sink_port: 9,
            app_rate: DataRate::from_mbps(1),
            flows: 1,
            link: LinkConfig::default(),
            network: Ipv4Addr::new(10, 1, 1, 0),
            prefix_len: 24,
            tcp: TcpConfig::default().with_segment_size(512),
            pcap: Some(PcapOutput::default()),
        }
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the application write size.
    pub fn with_payload_size(mut self, bytes: u64) -> Self {
        self.payload_size = bytes;
        self
    }

    /// Set the TCP segment size.
    pub fn with_segment_size(mut self, bytes: u32) -> Self {
        self.tcp.segment_size = bytes;
        self
    }

    /// Set the simulation duration.
    pub fn with_simulation_time(mut self, time: Duration) -> Self {
        self.simulation_time = time;
        self
    }

    /// Set the sender's data rate.
    pub fn with_app_rate(mut self, rate: DataRate) -> Self {
        self.app_rate = rate;
        self
    }

    /// Set the number of parallel senders.
    pub fn with_flows(mut self, flows: usize) -> Self {
        self.flows = flows;
        self
    }

    /// Set the link parameters.
    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    /// Set the congestion control algorithm.
    pub fn with_congestion_control(mut self, algorithm: CongestionAlgorithm) -> Self {
        self.tcp.congestion_control = algorithm;
        self
    }

    /// Set the TCP parameters.
    pub fn with_tcp(mut self, tcp: TcpConfig) -> Self {
        self.tcp = tcp;
        self
    }

    /// Enable or disable packet capture.
    pub fn with_pcap(mut self, pcap: Option<PcapOutput>) -> Self {
        self.pcap = pcap;
        self
    }

    /// TCP segment size.
    pub fn segment_size(&self) -> u32 {
        self.tcp.segment_size
    }

    /// Bytes each sender offers between its start and the end of the run.
    pub fn offered_bytes(&self) -> u64 {
        let active = self.simulation_time.saturating_sub(self.sender_start);
        self.app_rate.bits_in(active) / 8
    }

    /// Check values that would fail or make no sense once running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payload_size == 0 {
            return Err(ConfigError::invalid("payload_size", "must be positive"));
        }
        if self.tcp.segment_size == 0 {
            return Err(ConfigError::invalid("segment_size", "must be positive"));
        }
        if self.tcp.segment_size > MAX_SEGMENT_PAYLOAD {
            return Err(ConfigError::invalid(
                "segment_size",
                format!(
                    "{} exceeds the largest IPv4 payload of {MAX_SEGMENT_PAYLOAD}",
                    self.tcp.segment_size
                ),
            ));
        }
        if self.simulation_time.is_zero() {
            return Err(ConfigError::invalid("simulation_time", "must be positive"));
        }
        if self.sender_start > self.simulation_time {
            return Err(ConfigError::invalid(
                "simulation_time",
                format!(
                    "{:?} ends before the sender starts at {:?}",
                    self.simulation_time, self.sender_start
                ),
            ));
        }
        if self.sink_start > self.simulation_time {
            return Err(ConfigError::invalid(
                "simulation_time",
                format!(
                    "{:?} ends before the sink starts at {:?}",
                    self.simulation_time, self.sink_start
                ),
            ));
        }
        let max_flows = (u16::MAX - EPHEMERAL_PORT_START) as usize + 1;
        if !(1..=max_flows).contains(&self.flows) {
            return Err(ConfigError::invalid(
                "flows",
                format!("{} is outside 1..={max_flows}", self.flows),
            ));
        }
        if self.app_rate.bps() == 0 {
            return Err(ConfigError::invalid("app_rate", "must be positive"));
        }
        if self.link.data_rate.bps() == 0 {
            return Err(ConfigError::invalid("data_rate", "must be positive"));
        }
        if !(1..=30).contains(&self.prefix_len) {
            return Err(ConfigError::invalid(
                "prefix_len",
                format!("/{} leaves no room for two hosts", self.prefix_len),
            ));
        }
        if let Some(pcap) = &self.pcap {
            if pcap.prefix.is_empty() {
                return Err(ConfigError::invalid("pcap_prefix", "must not be empty"));
            }
        }
        Ok(())
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self::new(12345)
    }
}

/// Optional overrides, as read from a TOML file.
///
/// ```toml
/// seed = 7
/// simulation_time = 20.0
/// data_rate = "10Mbps"
/// congestion_control = "tahoe"
/// queue_size = 0          # unbounded
/// flows = 5
///
/// [tcp]
/// max_retransmits = 4
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioFile {
    pub seed: Option<u64>,
    pub payload_size: Option<u64>,
    pub segment_size: Option<u32>,
    /// Seconds.
    pub simulation_time: Option<f64>,
    pub data_rate: Option<DataRate>,
    pub delay_ms: Option<f64>,
    pub app_rate: Option<DataRate>,
    pub flows: Option<usize>,
    /// Packets; 0 means unbounded.
    pub queue_size: Option<usize>,
    pub congestion_control: Option<CongestionAlgorithm>,
    pub pcap: Option<bool>,
    pub pcap_prefix: Option<String>,
    pub pcap_dir: Option<PathBuf>,
    /// Full TCP parameters. Applied before `segment_size` and
    /// `congestion_control`, which win when both are set.
    pub tcp: Option<TcpConfig>,
}

impl ScenarioFile {
    /// Read a TOML scenario file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay the fields that are set onto `config`.
    pub fn apply(&self, mut config: ScenarioConfig) -> Result<ScenarioConfig, ConfigError> {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(tcp) = &self.tcp {
            config.tcp = tcp.clone();
        }
        if let Some(bytes) = self.payload_size {
            config.payload_size = bytes;
        }
        if let Some(bytes) = self.segment_size {
            config.tcp.segment_size = bytes;
        }
        if let Some(secs) = self.simulation_time {
            config.simulation_time = seconds("simulation_time", secs)?;
        }
        if let Some(rate) = self.data_rate {
            config.link.data_rate = rate;
        }
        if let Some(ms) = self.delay_ms {
            config.link.delay = seconds("delay_ms", ms / 1000.0)?;
        }
        if let Some(rate) = self.app_rate {
            config.app_rate = rate;
        }
        if let Some(flows) = self.flows {
            config.flows = flows;
        }
        if let Some(packets) = self.queue_size {
            config.link.queue_size = (packets > 0).then_some(packets);
        }
        if let Some(algorithm) = self.congestion_control {
            config.tcp.congestion_control = algorithm;
        }
        match self.pcap {
            Some(false) => config.pcap = None,
            Some(true) if config.pcap.is_none() => config.pcap = Some(PcapOutput::default()),
            _ => {}
        }
        if let Some(pcap) = config.pcap.as_mut() {
            if let Some(prefix) = &self.pcap_prefix {
                pcap.prefix = prefix.clone();
            }
            if let Some(dir) = &self.pcap_dir {
                pcap.dir = dir.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("{secs} is not a non-negative number"),
        ));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::invalid(field, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_scenario() {
        let config = ScenarioConfig::default();
        assert_eq!(config.payload_size, 1024);
        assert_eq!(config.segment_size(), 512);
        assert_eq!(config.simulation_time, Duration::from_secs(10));
        assert_eq!(config.link.data_rate, DataRate::from_mbps(5));
        assert_eq!(config.link.delay, Duration::from_millis(2));
        assert_eq!(config.link.queue_size, Some(100));
        assert_eq!(config.app_rate, DataRate::from_mbps(1));
        assert_eq!(config.tcp.congestion_control, CongestionAlgorithm::Reno);
        assert_eq!(
            config.pcap.as_ref().map(|p| p.prefix.as_str()),
            Some("tcp-reno-simulation")
        );
        assert_eq!(config.offered_bytes(), 1_125_000);
        assert_eq!(config.flows, 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_and_apply_file() {
        let file: ScenarioFile = toml::from_str(
            r#"
            seed = 7
            simulation_time = 20.5
            data_rate = "10Mbps"
            delay_ms = 5
            queue_size = 0
            congestion_control = "aimd:2:0.8"
            pcap_prefix = "run"
            flows = 5

            [tcp]
            max_retransmits = 4
            segment_size = 1000
            "#,
        )
        .unwrap();
        let config = file.apply(ScenarioConfig::default()).unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.simulation_time, Duration::from_millis(20_500));
        assert_eq!(config.link.data_rate, DataRate::from_mbps(10));
        assert_eq!(config.link.delay, Duration::from_millis(5));
        assert_eq!(config.link.queue_size, None);
        assert_eq!(config.tcp.max_retransmits, 4);
        assert_eq!(config.segment_size(), 1000);
        assert_eq!(
            config.tcp.congestion_control,
            CongestionAlgorithm::Aimd {
                increase_segments: 2,
                decrease_factor: 0.8
            }
        );
        assert_eq!(config.pcap.unwrap().prefix, "run");
        assert_eq!(config.flows, 5);
        // Untouched fields keep their defaults
        assert_eq!(config.payload_size, 1024);
    }

    #[test]
    fn test_later_overlay_wins() {
        let file = ScenarioFile {
            payload_size: Some(2048),
            segment_size: Some(1400),
            ..Default::default()
        };
        let flags = ScenarioFile {
            payload_size: Some(512),
            pcap: Some(false),
            ..Default::default()
        };
        let config = flags
            .apply(file.apply(ScenarioConfig::default()).unwrap())
            .unwrap();
        assert_eq!(config.payload_size, 512);
        assert_eq!(config.segment_size(), 1400);
        assert!(config.pcap.is_none());
    }

    #[test]
    fn test_rejects_unknown_fields_and_bad_values() {
        assert!(toml::from_str::<ScenarioFile>("payload = 3").is_err());
        assert!(toml::from_str::<ScenarioFile>("data_rate = \"fast\"").is_err());

        let negative = ScenarioFile {
            simulation_time: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            negative.apply(ScenarioConfig::default()),
            Err(ConfigError::Invalid {
                field: "simulation_time",
                ..
            })
        ));

        let too_short = ScenarioFile {
            simulation_time: Some(0.5),
            ..Default::default()
        };
        assert!(too_short.apply(ScenarioConfig::default()).is_err());

        let no_flows = ScenarioFile {
            flows: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            no_flows.apply(ScenarioConfig::default()),
            Err(ConfigError::Invalid { field: "flows", .. })
        ));

        let empty = ScenarioFile {
            payload_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            empty.apply(ScenarioConfig::default()),
            Err(ConfigError::Invalid {
                field: "payload_size",
                ..
            })
        ));
    }

    #[test]
    fn test_segment_size_must_fit_ipv4() {
        let largest = ScenarioConfig::default().with_segment_size(MAX_SEGMENT_PAYLOAD);
        largest.validate().unwrap();

        for bytes in [MAX_SEGMENT_PAYLOAD + 1, 70_000, 3_000_000_000] {
            assert!(matches!(
                ScenarioConfig::default().with_segment_size(bytes).validate(),
                Err(ConfigError::Invalid {
                    field: "segment_size",
                    ..
                })
            ));
        }

        let flag = ScenarioFile {
            segment_size: Some(3_000_000_000),
            ..Default::default()
        };
        assert!(flag.apply(ScenarioConfig::default()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ScenarioFile::load(Path::new("/nonexistent/scenario.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
