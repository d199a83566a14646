//! Hooks for watching a run.

use std::time::Duration;
use tcpsim_core::{Action, Event};
use tcpsim_types::{DeviceId, NodeId, Packet};

/// Receives notifications as the runner processes events.
///
/// Every method defaults to doing nothing.
pub trait SimulationObserver {
    /// An event is about to be dispatched.
    fn on_event(&mut self, _now: Duration, _event: &Event) {}

    /// A node's stack emitted an action.
    fn on_action(&mut self, _now: Duration, _node: NodeId, _action: &Action) {}

    /// A device started putting a packet on the wire.
    fn on_transmit(&mut self, _now: Duration, _device: DeviceId, _packet: &Packet) {}

    /// A packet arrived at a device.
    fn on_receive(&mut self, _now: Duration, _device: DeviceId, _packet: &Packet) {}

    /// A device's transmit queue was full.
    fn on_drop(&mut self, _now: Duration, _device: DeviceId, _packet: &Packet) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SimulationObserver for NoopObserver {}
