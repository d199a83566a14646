//! On/off TCP sender.

use crate::generator::{SendRequest, TrafficGenerator};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tcpsim_types::FlowId;
use tracing::{debug, trace};

/// Lifecycle of a sender. Senders are not restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Running,
    Stopped,
}

/// Sender counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Writes attempted.
    pub writes: u64,
    /// Bytes the application tried to write.
    pub bytes_offered: u64,
    /// Bytes accepted by the socket.
    pub bytes_accepted: u64,
    /// Writes rejected by the socket (send buffer full or closing).
    pub writes_rejected: u64,
}

/// Opens one connection at start, writes the generator's requests into it
/// and closes it at stop.
///
/// The sender does not touch the TCP stack itself: the runner asks it what
/// to do and reports results back.
#[derive(Debug, Clone)]
pub struct OnOffSender {
    local: Ipv4Addr,
    remote: SocketAddrV4,
    generator: TrafficGenerator,
    state: SenderState,
    flow: Option<FlowId>,
    pending: Option<SendRequest>,
    stats: SenderStats,
}

impl OnOffSender {
    pub fn new(local: Ipv4Addr, remote: SocketAddrV4, generator: TrafficGenerator) -> Self {
        Self {
            local,
            remote,
            generator,
            state: SenderState::Idle,
            flow: None,
            pending: None,
            stats: SenderStats::default(),
        }
    }

    pub fn local(&self) -> Ipv4Addr {
        self.local
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn flow(&self) -> Option<FlowId> {
        self.flow
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Start sending. Returns the time of the first write, if any.
    ///
    /// Only the first call has an effect.
    pub fn start(&mut self, now: Duration) -> Option<Duration> {
        if self.state != SenderState::Idle {
            return None;
        }
        self.state = SenderState::Running;
        self.pending = self.generator.next();
        debug!(
            local = %self.local,
            remote = %self.remote,
            ?now,
            first_write = ?self.pending.map(|r| r.at),
            "Sender started"
        );
        self.pending.map(|r| r.at)
    }

    /// Connection opened for this sender.
    pub fn set_flow(&mut self, flow: FlowId) {
        self.flow = Some(flow);
    }

    /// Take the write due at `now`. Returns it with the time of the next
    /// write, if any.
    pub fn take_due(&mut self, now: Duration) -> Option<(SendRequest, Option<Duration>)> {
        if self.state != SenderState::Running {
            return None;
        }
        let request = self.pending.filter(|r| r.at <= now)?;
        self.pending = self.generator.next();
        Some((request, self.pending.map(|r| r.at)))
    }

    /// Record the outcome of a write.
    pub fn record_write(&mut self, bytes: u64, accepted: bool) {
        self.stats.writes += 1;
        self.stats.bytes_offered += bytes;
        if accepted {
            self.stats.bytes_accepted += bytes;
        } else {
            self.stats.writes_rejected += 1;
            trace!(remote = %self.remote, bytes, "Write rejected");
        }
    }

    /// Stop sending. Returns the connection to close, if one is open.
    pub fn stop(&mut self, now: Duration) -> Option<FlowId> {
        if self.state == SenderState::Stopped {
            return None;
        }
        self.state = SenderState::Stopped;
        self.pending = None;
        debug!(remote = %self.remote, ?now, stats = ?self.stats, "Sender stopped");
        self.flow
    }
}
