//! TCP errors.

use crate::TcpState;
use std::net::Ipv4Addr;
use tcpsim_types::{FlowId, TcpFlags};
use thiserror::Error;

/// Errors raised by the TCP stack.
///
/// Segment-level errors never abort the simulation: the stack logs them,
/// answers with RST where appropriate and counts them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TcpError {
    #[error("No connection for flow {0}")]
    UnknownConnection(FlowId),

    #[error("Unexpected segment [{flags}] in state {state}")]
    UnexpectedSegment { state: TcpState, flags: TcpFlags },

    #[error("Send buffer full: requested {requested} bytes, {available} available")]
    SendBufferFull { requested: u64, available: u64 },

    #[error("Connection {0} is closing")]
    ConnectionClosing(FlowId),

    #[error("Port {0} already in use")]
    PortInUse(u16),

    #[error("Address {0} is not assigned to this node")]
    AddressNotLocal(Ipv4Addr),

    #[error("Ephemeral ports exhausted")]
    PortsExhausted,
}

impl TcpError {
    /// Whether the error came from a received segment (as opposed to an
    /// application call).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            TcpError::UnknownConnection(_) | TcpError::UnexpectedSegment { .. }
        )
    }
}
