//! Deterministic discrete-event network simulation.
//!
//! Given the same seed and the same topology build order, a run produces
//! identical results, down to the bytes of its packet captures.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  SimulationRunner                       │
//! │                                                         │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Scheduler (BTreeMap<EventKey, Event>)          │ │
//! │  │     Ordered by: time, priority, sequence           │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │  NetDevice / PointToPointChannel  →  Node          │ │
//! │  │  (queue, tx time, delay)             (TcpStack,    │ │
//! │  │                                       apps)        │ │
//! │  └────────────────────────┬───────────────────────────┘ │
//! │                           │                             │
//! │                           ▼                             │
//! │  ┌────────────────────────────────────────────────────┐ │
//! │  │     Actions → schedule new events                  │ │
//! │  └────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod error;
mod event_queue;
mod link;
mod node;
mod observer;
mod runner;
mod scheduler;
mod stats;
mod trace;

pub use error::{SchedulingError, SimulationError, TopologyError, TraceError};
pub use event_queue::{EventHandle, EventKey, EventQueue};
pub use link::{
    DeviceStats, DropTailQueue, LinkConfig, NetDevice, PointToPointChannel, TransmitOutcome,
    DEFAULT_QUEUE_SIZE,
};
pub use node::{Application, Ipv4AddressAllocator, Node, Route};
pub use observer::{NoopObserver, SimulationObserver};
pub use runner::{SenderSpec, SimulationRunner};
pub use scheduler::{Prioritized, Scheduler, SchedulerStats};
pub use stats::SimulationStats;
pub use trace::{
    pcap_path, Direction, PacketTracer, PcapTracer, PcapWriter, SharedBuffer, LINKTYPE_PPP,
};
