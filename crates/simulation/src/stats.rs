//! Runner statistics.

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Total actions generated by node stacks.
    pub actions_generated: u64,
    /// Packets put on a wire.
    pub packets_transmitted: u64,
    /// Packets that arrived at a device.
    pub packets_received: u64,
    /// Packets dropped by full transmit queues.
    pub queue_drops: u64,
    /// Segments a node had no route for.
    pub routing_drops: u64,
    /// Packets that arrived at a node they were not addressed to.
    pub misdelivered: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
}

impl SimulationStats {
    /// All packets lost inside the network.
    pub fn packets_dropped(&self) -> u64 {
        self.queue_drops + self.routing_drops + self.misdelivered
    }

    /// Fraction of offered packets that made it onto a wire.
    pub fn delivery_rate(&self) -> f64 {
        let offered = self.packets_transmitted + self.queue_drops;
        if offered == 0 {
            1.0
        } else {
            self.packets_transmitted as f64 / offered as f64
        }
    }
}
