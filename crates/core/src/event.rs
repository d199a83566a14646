//! Events dispatched by the scheduler.

use crate::TimerId;
use tcpsim_types::{AppId, DeviceId, NodeId, Packet};

/// Priority class for events scheduled at the same instant.
///
/// Lower values are dispatched first. Within one class, events at the same
/// time are dispatched in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Device bookkeeping that must settle before anything else observes the
    /// same instant (a transmitter becoming idle).
    Internal = 0,

    /// Everything else: arrivals, timers, application activity.
    Normal = 1,
}

/// All events the simulation can schedule.
///
/// Events are **passive data**: they name the node/device/application they
/// target by id, and the runner looks the target up when the event fires.
/// Nothing here borrows simulation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Application lifecycle
    // ═══════════════════════════════════════════════════════════════════════
    /// Start an installed application.
    ApplicationStart { node: NodeId, app: AppId },

    /// Let a traffic generator emit its next send request.
    ApplicationSend { node: NodeId, app: AppId },

    /// Stop an application. Stopped applications never restart.
    ApplicationStop { node: NodeId, app: AppId },

    // ═══════════════════════════════════════════════════════════════════════
    // Link layer
    // ═══════════════════════════════════════════════════════════════════════
    /// A device finished serializing its current packet onto the wire.
    TransmitComplete { device: DeviceId },

    /// A packet finished propagating and arrives at a device.
    PacketArrival { device: DeviceId, packet: Packet },

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol timers
    // ═══════════════════════════════════════════════════════════════════════
    /// A protocol timer fired on a node.
    Timer { node: NodeId, timer: TimerId },
}

impl Event {
    /// Priority class used for same-instant ordering.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::TransmitComplete { .. } => EventPriority::Internal,
            _ => EventPriority::Normal,
        }
    }

    /// Node the event is delivered to.
    pub fn node(&self) -> NodeId {
        match self {
            Event::ApplicationStart { node, .. }
            | Event::ApplicationSend { node, .. }
            | Event::ApplicationStop { node, .. }
            | Event::Timer { node, .. } => *node,
            Event::TransmitComplete { device } | Event::PacketArrival { device, .. } => {
                device.node
            }
        }
    }

    /// Get a human-readable name for this event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ApplicationStart { .. } => "ApplicationStart",
            Event::ApplicationSend { .. } => "ApplicationSend",
            Event::ApplicationStop { .. } => "ApplicationStop",
            Event::TransmitComplete { .. } => "TransmitComplete",
            Event::PacketArrival { .. } => "PacketArrival",
            Event::Timer { .. } => "Timer",
        }
    }
}
