//! Actions returned by protocol state machines.

use crate::TimerId;
use std::net::Ipv4Addr;
use std::time::Duration;
use tcpsim_types::{FlowId, TcpSegment};

/// Why a segment was sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetransmitKind {
    /// Third duplicate ACK or a partial ACK during recovery.
    Fast,
    /// Retransmission timer expired.
    Timeout,
}

/// Outputs of a protocol state machine.
///
/// Actions are **commands** for the runner: the state machine never touches
/// devices, the clock or applications itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Hand a segment to the IP layer for transmission.
    SendSegment {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: TcpSegment,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Set (or replace) a timer.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a timer if it is pending.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Application notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// In-order bytes are ready for the application bound to `flow`.
    DeliverData { flow: FlowId, bytes: u64 },

    /// Handshake completed.
    ConnectionEstablished { flow: FlowId },

    /// Connection reached CLOSED; `reset` is true when it ended by RST.
    ConnectionClosed { flow: FlowId, reset: bool },

    // ═══════════════════════════════════════════════════════════════════════
    // Observations
    // ═══════════════════════════════════════════════════════════════════════
    /// Congestion window or slow-start threshold changed.
    CongestionWindowChanged { flow: FlowId, cwnd: u32, ssthresh: u32 },

    /// A valid RTT sample was taken.
    RttSampled { flow: FlowId, rtt: Duration },

    /// A data segment was retransmitted.
    Retransmitted {
        flow: FlowId,
        kind: RetransmitKind,
        bytes: u32,
    },
}

impl Action {
    /// Get a human-readable name for this action type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::SendSegment { .. } => "SendSegment",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::DeliverData { .. } => "DeliverData",
            Action::ConnectionEstablished { .. } => "ConnectionEstablished",
            Action::ConnectionClosed { .. } => "ConnectionClosed",
            Action::CongestionWindowChanged { .. } => "CongestionWindowChanged",
            Action::RttSampled { .. } => "RttSampled",
            Action::Retransmitted { .. } => "Retransmitted",
        }
    }
}
