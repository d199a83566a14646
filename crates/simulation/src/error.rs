//! Simulation errors.

use std::net::Ipv4Addr;
use std::time::Duration;
use tcpsim_apps::GeneratorError;
use tcpsim_tcp::TcpError;
use tcpsim_types::{AppId, ChannelId, DeviceId, NodeId, PacketError};
use thiserror::Error;

/// Invalid event times. Fatal: reported before simulated time advances.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulingError {
    #[error("Cannot schedule at {at:?}: simulated time is already {now:?}")]
    InPast { at: Duration, now: Duration },

    #[error("Negative delay: {0}s")]
    NegativeDelay(f64),

    #[error("Delay is not a finite number: {0}")]
    NonFiniteDelay(f64),

    #[error("Simulated clock overflow: {now:?} + {delay:?}")]
    Overflow { now: Duration, delay: Duration },

    #[error("Stop time {stop:?} is before start time {start:?}")]
    StopBeforeStart { start: Duration, stop: Duration },
}

/// Errors building or addressing the topology.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Unknown application {app} on node {node}")]
    UnknownApp { node: NodeId, app: AppId },

    #[error("Cannot connect node {0} to itself")]
    SelfLink(NodeId),

    #[error("Address pool {network}/{prefix_len} exhausted")]
    AddressesExhausted { network: Ipv4Addr, prefix_len: u8 },

    #[error("Invalid prefix length /{0}")]
    InvalidPrefix(u8),

    #[error("Node {node} has no route to {dst}")]
    NoRoute { node: NodeId, dst: Ipv4Addr },
}

/// Packet capture failures.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Capture I/O error on {device}: {source}")]
    Io {
        device: DeviceId,
        #[source]
        source: std::io::Error,
    },
}

/// Umbrella error for setting up and running a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error(transparent)]
    Tcp(#[from] TcpError),

    #[error(transparent)]
    Generator(#[from] GeneratorError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}
