//! Timer identifiers.

use tcpsim_types::FlowId;

/// Identifies a protocol timer on a node.
///
/// A node has at most one pending timer per id: setting a timer that is
/// already pending replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Retransmission timeout of one TCP connection.
    Retransmit(FlowId),
}

impl TimerId {
    /// Connection the timer belongs to.
    pub fn flow(&self) -> FlowId {
        match self {
            TimerId::Retransmit(flow) => *flow,
        }
    }
}
