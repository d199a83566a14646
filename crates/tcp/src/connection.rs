//! A single TCP connection.
//!
//! # Model
//!
//! The connection keeps positions as 64-bit offsets from its initial
//! sequence numbers (see [`crate::seq`]). Payload is virtual: only byte
//! counts move, never buffers.
//!
//! ```text
//!   offset 0        1 ......................... write_end   fin_offset
//!          SYN      first data byte            (app data)   FIN
//!
//!   snd_una <= snd_nxt <= snd_max <= write_end (+1 once FIN is sent)
//! ```
//!
//! Loss recovery is NewReno without window inflation: the third duplicate
//! ACK retransmits the first unacknowledged segment and records
//! `recover = snd_max`; partial ACKs below `recover` retransmit the next
//! hole; the first ACK at or beyond `recover` ends recovery. A timeout
//! resets `snd_nxt` to `snd_una` and resends everything (go-back-N).

use crate::congestion::{CongestionWindow, LossSignal};
use crate::reassembly::Reassembly;
use crate::rtt::RttEstimator;
use crate::seq::{to_offset, to_wire};
use crate::{TcpConfig, TcpError};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tcpsim_core::{Action, RetransmitKind, TimerId};
use tcpsim_types::{FlowId, TcpFlags, TcpSegment};
use tracing::{debug, trace, warn};

/// Connection state.
///
/// `Closing` covers every state between the first FIN (ours or the peer's)
/// and CLOSED; which half is done is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    SynSent,
    SynReceived,
    Established,
    Closing,
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RCVD",
            TcpState::Established => "ESTABLISHED",
            TcpState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for a transmitted, unacknowledged segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentSegment {
    pub len: u32,
    pub sent_at: Duration,
    pub retransmitted: bool,
}

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Payload bytes accepted from the application.
    pub bytes_written: u64,
    /// Payload bytes acknowledged by the peer.
    pub bytes_acked: u64,
    /// In-order payload bytes delivered to the local application.
    pub bytes_delivered: u64,
    /// Segments transmitted, including retransmissions and pure ACKs.
    pub segments_sent: u64,
    pub fast_retransmits: u64,
    pub timeout_retransmits: u64,
    pub timeouts: u64,
    pub duplicate_acks: u64,
    /// Application writes rejected because the send buffer was full.
    pub rejected_writes: u64,
}

/// One end of a TCP connection.
#[derive(Debug)]
pub struct TcpConnection {
    flow: FlowId,
    state: TcpState,
    config: TcpConfig,
    now: Duration,

    // ─── Send side (offsets from iss) ───
    iss: u32,
    snd_una: u64,
    snd_nxt: u64,
    snd_max: u64,
    /// One past the last byte written by the application.
    write_end: u64,
    /// Offset of our FIN once the application closed.
    fin_offset: Option<u64>,
    unacked: BTreeMap<u64, SentSegment>,
    peer_window: u32,
    congestion: CongestionWindow,
    rtt: RttEstimator,
    /// End offset and send time of the segment being timed.
    timed: Option<(u64, Duration)>,
    dup_acks: u32,
    /// Active fast recovery: `snd_max` when it began.
    recover: Option<u64>,
    /// `snd_max` at the last timeout; duplicate ACKs below it are stale.
    timeout_high: u64,
    retries: u32,
    timer_armed: bool,

    // ─── Receive side (offsets from irs) ───
    irs: u32,
    rcv_nxt: u64,
    reassembly: Reassembly,
    fin_received: bool,
    ack_pending: bool,

    reset: bool,
    stats: ConnectionStats,
}

impl TcpConnection {
    fn new(flow: FlowId, config: TcpConfig, iss: u32, state: TcpState, now: Duration) -> Self {
        let congestion = CongestionWindow::new(
            config.congestion_control.build(),
            config.segment_size,
            config.initial_cwnd(),
            config.max_cwnd,
        );
        let rtt = RttEstimator::new(&config);
        Self {
            flow,
            state,
            now,
            iss,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            write_end: 1,
            fin_offset: None,
            unacked: BTreeMap::new(),
            peer_window: config.segment_size,
            congestion,
            rtt,
            timed: None,
            dup_acks: 0,
            recover: None,
            timeout_high: 0,
            retries: 0,
            timer_armed: false,
            irs: 0,
            rcv_nxt: 0,
            reassembly: Reassembly::new(),
            fin_received: false,
            ack_pending: false,
            reset: false,
            stats: ConnectionStats::default(),
            config,
        }
    }

    /// Open a connection actively: returns the connection in SYN_SENT and
    /// the SYN to send.
    pub fn connect(flow: FlowId, config: TcpConfig, iss: u32, now: Duration) -> (Self, Vec<Action>) {
        let mut conn = Self::new(flow, config, iss, TcpState::SynSent, now);
        let mut actions = Vec::new();
        conn.send_syn(&mut actions);
        conn.timed = Some((1, now));
        debug!(flow = %flow, iss, "Connecting");
        (conn, actions)
    }

    /// Accept a SYN on a listening port: returns the connection in
    /// SYN_RCVD and the SYN|ACK to send.
    pub fn accept(
        flow: FlowId,
        config: TcpConfig,
        iss: u32,
        syn: &TcpSegment,
        now: Duration,
    ) -> (Self, Vec<Action>) {
        let mut conn = Self::new(flow, config, iss, TcpState::SynReceived, now);
        conn.irs = syn.seq;
        conn.rcv_nxt = 1;
        conn.peer_window = syn.window as u32;
        let mut actions = Vec::new();
        conn.send_syn(&mut actions);
        conn.timed = Some((1, now));
        debug!(flow = %flow, iss, irs = syn.seq, "Accepted connection");
        (conn, actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn flow(&self) -> FlowId {
        self.flow
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.congestion.cwnd()
    }

    /// Slow-start threshold in bytes.
    pub fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh()
    }

    /// Name of the congestion control strategy.
    pub fn congestion_algorithm(&self) -> &'static str {
        self.congestion.algorithm()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.srtt()
    }

    /// Sequence space sent but not yet acknowledged.
    pub fn bytes_in_flight(&self) -> u64 {
        self.snd_nxt.saturating_sub(self.snd_una)
    }

    /// Payload bytes written but not yet acknowledged.
    pub fn buffered_bytes(&self) -> u64 {
        self.write_end.saturating_sub(self.snd_una.max(1))
    }

    /// Free space in the send buffer.
    pub fn send_space(&self) -> u64 {
        self.config
            .send_buffer_size
            .saturating_sub(self.buffered_bytes())
    }

    /// Segments awaiting acknowledgement, keyed by offset.
    pub fn unacked(&self) -> &BTreeMap<u64, SentSegment> {
        &self.unacked
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Whether the connection ended by RST (sent or received).
    pub fn was_reset(&self) -> bool {
        self.reset
    }

    fn timer_id(&self) -> TimerId {
        TimerId::Retransmit(self.flow)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Application calls
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue `bytes` of application data.
    ///
    /// Writes are all-or-nothing: a write larger than the free send buffer
    /// space is rejected with [`TcpError::SendBufferFull`]. Data written
    /// before the handshake completes is held until it does.
    pub fn write(&mut self, bytes: u64, now: Duration) -> Result<Vec<Action>, TcpError> {
        self.now = now;
        if self.state == TcpState::Closed || self.fin_offset.is_some() {
            return Err(TcpError::ConnectionClosing(self.flow));
        }
        let available = self.send_space();
        if bytes > available {
            self.stats.rejected_writes += 1;
            return Err(TcpError::SendBufferFull {
                requested: bytes,
                available,
            });
        }
        self.write_end += bytes;
        self.stats.bytes_written += bytes;

        let mut actions = Vec::new();
        self.try_output(&mut actions);
        Ok(actions)
    }

    /// Close the sending half. Buffered data is sent before the FIN.
    pub fn close(&mut self, now: Duration) -> Vec<Action> {
        self.now = now;
        let mut actions = Vec::new();
        if self.fin_offset.is_some() || self.state == TcpState::Closed {
            return actions;
        }
        self.fin_offset = Some(self.write_end);
        match self.state {
            TcpState::SynSent => {
                // Nothing was exchanged yet.
                self.enter_closed(false, &mut actions);
            }
            TcpState::Established => {
                self.state = TcpState::Closing;
                self.try_output(&mut actions);
            }
            // SYN_RCVD moves to Closing once the handshake completes.
            TcpState::SynReceived | TcpState::Closing | TcpState::Closed => {}
        }
        debug!(flow = %self.flow, state = %self.state, "Close requested");
        actions
    }

    /// Send RST and close immediately.
    pub fn abort(&mut self, now: Duration) -> Vec<Action> {
        self.now = now;
        let mut actions = Vec::new();
        if self.state == TcpState::Closed {
            return actions;
        }
        let segment = self.segment(
            self.snd_nxt,
            TcpFlags::RST | TcpFlags::ACK,
            0,
        );
        self.emit(segment, &mut actions);
        self.enter_closed(true, &mut actions);
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Segment processing
    // ═══════════════════════════════════════════════════════════════════════

    /// Process a segment addressed to this connection.
    ///
    /// An `Err` means the segment does not fit the connection's state; the
    /// caller decides whether to reset.
    pub fn on_segment(&mut self, seg: &TcpSegment, now: Duration) -> Result<Vec<Action>, TcpError> {
        self.now = now;
        let mut actions = Vec::new();

        if seg.flags.contains(TcpFlags::RST) {
            debug!(flow = %self.flow, state = %self.state, "Connection reset by peer");
            self.enter_closed(true, &mut actions);
            return Ok(actions);
        }

        match self.state {
            TcpState::Closed => return Err(self.unexpected(seg)),
            TcpState::SynSent => return self.on_syn_sent(seg, actions),
            TcpState::SynReceived => {
                if seg.flags.contains(TcpFlags::SYN) && !seg.flags.contains(TcpFlags::ACK) {
                    // Our SYN|ACK was lost
                    self.send_syn(&mut actions);
                    return Ok(actions);
                }
                if !seg.flags.contains(TcpFlags::ACK) {
                    return Err(self.unexpected(seg));
                }
                let ack = to_offset(self.iss, self.snd_una, seg.ack);
                if ack < 1 || ack > self.snd_max {
                    return Err(self.unexpected(seg));
                }
                self.complete_handshake(&mut actions);
            }
            TcpState::Established | TcpState::Closing => {
                if seg.flags.contains(TcpFlags::SYN) {
                    // Retransmitted SYN|ACK: our handshake ACK was lost.
                    self.send_ack(&mut actions);
                    return Ok(actions);
                }
                if !seg.flags.contains(TcpFlags::ACK) {
                    return Err(self.unexpected(seg));
                }
            }
        }

        self.process_ack(seg, &mut actions);
        self.process_data(seg, &mut actions);
        self.try_output(&mut actions);
        if self.ack_pending {
            self.send_ack(&mut actions);
        }
        self.check_closed(&mut actions);
        Ok(actions)
    }

    fn on_syn_sent(&mut self, seg: &TcpSegment, mut actions: Vec<Action>) -> Result<Vec<Action>, TcpError> {
        if !(seg.flags.contains(TcpFlags::SYN) && seg.flags.contains(TcpFlags::ACK)) {
            return Err(self.unexpected(seg));
        }
        if to_offset(self.iss, 0, seg.ack) != 1 {
            return Err(self.unexpected(seg));
        }
        self.irs = seg.seq;
        self.rcv_nxt = 1;
        self.peer_window = seg.window as u32;
        self.complete_handshake(&mut actions);
        self.send_ack(&mut actions);
        self.try_output(&mut actions);
        Ok(actions)
    }

    /// SYN acknowledged: move to ESTABLISHED (or Closing if the application
    /// already closed).
    fn complete_handshake(&mut self, actions: &mut Vec<Action>) {
        self.snd_una = 1;
        self.unacked.remove(&0);
        if let Some((end, sent_at)) = self.timed.take() {
            if end <= 1 {
                self.take_rtt_sample(self.now.saturating_sub(sent_at), actions);
            }
        }
        self.retries = 0;
        self.rtt.reset_backoff();
        self.cancel_timer(actions);
        self.state = if self.fin_offset.is_some() {
            TcpState::Closing
        } else {
            TcpState::Established
        };
        debug!(flow = %self.flow, "Connection established");
        actions.push(Action::ConnectionEstablished { flow: self.flow });
    }

    fn process_ack(&mut self, seg: &TcpSegment, actions: &mut Vec<Action>) {
        let ack = to_offset(self.iss, self.snd_una, seg.ack);
        if ack > self.snd_max {
            trace!(flow = %self.flow, ack, snd_max = self.snd_max, "ACK for unsent data");
            self.ack_pending = true;
            return;
        }
        let window = seg.window as u32;

        if ack > self.snd_una {
            self.on_new_ack(ack, actions);
        } else if ack == self.snd_una
            && seg.is_pure_ack()
            && self.snd_max > self.snd_una
            && window == self.peer_window
        {
            self.on_duplicate_ack(actions);
        }
        self.peer_window = window;
    }

    fn on_new_ack(&mut self, ack: u64, actions: &mut Vec<Action>) {
        if let Some((end, sent_at)) = self.timed {
            if ack >= end {
                self.timed = None;
                self.take_rtt_sample(self.now.saturating_sub(sent_at), actions);
            }
        }

        let data_end = self.write_end;
        let data_acked = ack.min(data_end).saturating_sub(self.snd_una.max(1));
        self.stats.bytes_acked += data_acked;

        self.snd_una = ack;
        if self.snd_nxt < ack {
            self.snd_nxt = ack;
        }
        self.release_acked(ack);
        self.dup_acks = 0;
        self.retries = 0;
        self.rtt.reset_backoff();

        match self.recover {
            Some(recover) if ack < recover => {
                // Partial ACK: the next hole was lost too.
                self.retransmit_head(RetransmitKind::Fast, actions);
            }
            Some(_) => {
                self.recover = None;
                trace!(flow = %self.flow, "Fast recovery complete");
            }
            None => {
                let acked = data_acked.min(u32::MAX as u64) as u32;
                if self.congestion.on_ack(acked) {
                    self.report_window(actions);
                }
            }
        }

        if self.snd_una < self.snd_max {
            self.arm_timer(actions);
        } else {
            self.cancel_timer(actions);
        }
    }

    fn on_duplicate_ack(&mut self, actions: &mut Vec<Action>) {
        self.dup_acks += 1;
        self.stats.duplicate_acks += 1;
        if self.dup_acks != self.config.dup_ack_threshold
            || self.recover.is_some()
            || self.snd_una < self.timeout_high
        {
            return;
        }

        let flight = self.snd_max.saturating_sub(self.snd_una);
        debug!(
            flow = %self.flow,
            snd_una = self.snd_una,
            flight,
            "Triple duplicate ACK, fast retransmit"
        );
        if self
            .congestion
            .on_loss(flight.min(u32::MAX as u64) as u32, LossSignal::TripleDuplicateAck)
        {
            self.report_window(actions);
        }
        self.recover = Some(self.snd_max);
        self.retransmit_head(RetransmitKind::Fast, actions);
        self.arm_timer(actions);
    }

    fn process_data(&mut self, seg: &TcpSegment, actions: &mut Vec<Action>) {
        if !matches!(self.state, TcpState::Established | TcpState::Closing) {
            return;
        }
        let start = to_offset(self.irs, self.rcv_nxt, seg.seq);
        let len = seg.payload_len as u64;
        let end = start + len;

        if len > 0 {
            self.ack_pending = true;
            if self.fin_received || end <= self.rcv_nxt {
                trace!(flow = %self.flow, start, end, "Duplicate data");
            } else if start > self.rcv_nxt {
                if end - self.rcv_nxt <= self.config.recv_buffer_size as u64 {
                    self.reassembly.insert(start, end);
                    trace!(
                        flow = %self.flow,
                        start,
                        end,
                        rcv_nxt = self.rcv_nxt,
                        held = self.reassembly.buffered_bytes(),
                        "Out-of-order data"
                    );
                }
            } else {
                let before = self.rcv_nxt;
                self.rcv_nxt = self.reassembly.advance(end);
                let delivered = self.rcv_nxt - before;
                self.stats.bytes_delivered += delivered;
                actions.push(Action::DeliverData {
                    flow: self.flow,
                    bytes: delivered,
                });
            }
        }

        if seg.flags.contains(TcpFlags::FIN) {
            self.ack_pending = true;
            if !self.fin_received && end == self.rcv_nxt {
                self.rcv_nxt += 1;
                self.fin_received = true;
                debug!(flow = %self.flow, "Peer closed");
                if self.fin_offset.is_none() {
                    self.fin_offset = Some(self.write_end);
                }
                self.state = TcpState::Closing;
            }
        }
    }

    fn check_closed(&mut self, actions: &mut Vec<Action>) {
        if self.state != TcpState::Closing || !self.fin_received {
            return;
        }
        if let Some(fin) = self.fin_offset {
            if self.snd_una > fin {
                self.enter_closed(false, actions);
            }
        }
    }

    fn enter_closed(&mut self, reset: bool, actions: &mut Vec<Action>) {
        if self.state == TcpState::Closed {
            return;
        }
        self.state = TcpState::Closed;
        self.reset = reset;
        self.cancel_timer(actions);
        self.unacked.clear();
        debug!(flow = %self.flow, reset, "Connection closed");
        actions.push(Action::ConnectionClosed {
            flow: self.flow,
            reset,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    /// Retransmission timer expired.
    pub fn on_timeout(&mut self, now: Duration) -> Vec<Action> {
        self.now = now;
        self.timer_armed = false;
        let mut actions = Vec::new();
        if self.state == TcpState::Closed || self.snd_una >= self.snd_max {
            return actions;
        }

        self.retries += 1;
        if self.retries > self.config.max_retransmits {
            warn!(
                flow = %self.flow,
                retries = self.retries - 1,
                "Retransmission limit reached, resetting connection"
            );
            return self.abort(now);
        }

        self.stats.timeouts += 1;
        self.rtt.backoff();
        self.timed = None;
        self.dup_acks = 0;
        self.recover = None;

        match self.state {
            TcpState::SynSent | TcpState::SynReceived => {
                debug!(flow = %self.flow, rto = ?self.rtt.rto(), "SYN timeout");
                self.send_syn(&mut actions);
            }
            TcpState::Established | TcpState::Closing => {
                let flight = self.snd_max.saturating_sub(self.snd_una);
                debug!(
                    flow = %self.flow,
                    snd_una = self.snd_una,
                    flight,
                    rto = ?self.rtt.rto(),
                    "Retransmission timeout"
                );
                if self
                    .congestion
                    .on_loss(flight.min(u32::MAX as u64) as u32, LossSignal::Timeout)
                {
                    self.report_window(&mut actions);
                }
                self.timeout_high = self.snd_max;
                for segment in self.unacked.values_mut() {
                    segment.retransmitted = true;
                }
                self.snd_nxt = self.snd_una;
                self.try_output(&mut actions);
            }
            TcpState::Closed => {}
        }
        actions
    }

    fn arm_timer(&mut self, actions: &mut Vec<Action>) {
        self.timer_armed = true;
        actions.push(Action::SetTimer {
            id: self.timer_id(),
            duration: self.rtt.rto(),
        });
    }

    fn cancel_timer(&mut self, actions: &mut Vec<Action>) {
        if self.timer_armed {
            self.timer_armed = false;
            actions.push(Action::CancelTimer { id: self.timer_id() });
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Output
    // ═══════════════════════════════════════════════════════════════════════

    /// Send as much as the windows allow, then the FIN if due.
    fn try_output(&mut self, actions: &mut Vec<Action>) {
        if !matches!(self.state, TcpState::Established | TcpState::Closing) {
            return;
        }
        let mss = self.config.segment_size as u64;
        loop {
            let flight = self.snd_nxt - self.snd_una;
            if self.snd_nxt < self.write_end {
                let window = self.congestion.cwnd().min(self.peer_window) as u64;
                if flight >= window {
                    break;
                }
                let usable = window - flight;
                let remaining = self.write_end - self.snd_nxt;
                let len = mss.min(remaining).min(usable);
                // No runts while data is in flight and more is queued.
                if len < mss && len < remaining && flight > 0 {
                    break;
                }
                let offset = self.snd_nxt;
                self.send_data(offset, len as u32, RetransmitKind::Timeout, actions);
                self.snd_nxt += len;
            } else {
                if let Some(fin) = self.fin_offset {
                    if self.snd_nxt == fin {
                        self.send_fin(actions);
                        self.snd_nxt = fin + 1;
                    }
                }
                break;
            }
        }
        if self.snd_una < self.snd_max && !self.timer_armed {
            self.arm_timer(actions);
        }
    }

    /// Resend the first unacknowledged segment.
    fn retransmit_head(&mut self, kind: RetransmitKind, actions: &mut Vec<Action>) {
        let offset = self.snd_una;
        if Some(offset) == self.fin_offset {
            self.send_fin(actions);
            return;
        }
        let remaining = self.write_end.saturating_sub(offset);
        if remaining == 0 {
            return;
        }
        let len = self
            .unacked
            .get(&offset)
            .map(|s| s.len as u64)
            .unwrap_or(self.config.segment_size as u64)
            .min(remaining);
        self.send_data(offset, len as u32, kind, actions);
    }

    /// Emit a data segment at `offset`. `kind` labels it if it turns out
    /// to be a retransmission.
    fn send_data(&mut self, offset: u64, len: u32, kind: RetransmitKind, actions: &mut Vec<Action>) {
        let end = offset + len as u64;
        let is_retransmission = offset < self.snd_max;

        if is_retransmission {
            match kind {
                RetransmitKind::Fast => self.stats.fast_retransmits += 1,
                RetransmitKind::Timeout => self.stats.timeout_retransmits += 1,
            }
            actions.push(Action::Retransmitted {
                flow: self.flow,
                kind,
                bytes: len,
            });
            // Karn: never time a retransmitted segment.
            if matches!(self.timed, Some((timed_end, _)) if timed_end > offset) {
                self.timed = None;
            }
        } else if self.timed.is_none() {
            self.timed = Some((end, self.now));
        }

        self.unacked
            .retain(|&start, _| start <= offset || start >= end);
        self.unacked.insert(
            offset,
            SentSegment {
                len,
                sent_at: self.now,
                retransmitted: is_retransmission,
            },
        );
        self.snd_max = self.snd_max.max(end);

        let segment = self.segment(offset, TcpFlags::ACK, len);
        self.emit(segment, actions);
    }

    fn send_fin(&mut self, actions: &mut Vec<Action>) {
        let Some(fin) = self.fin_offset else {
            return;
        };
        self.snd_max = self.snd_max.max(fin + 1);
        let segment = self.segment(fin, TcpFlags::FIN | TcpFlags::ACK, 0);
        self.emit(segment, actions);
    }

    fn send_syn(&mut self, actions: &mut Vec<Action>) {
        let flags = match self.state {
            TcpState::SynReceived => TcpFlags::SYN | TcpFlags::ACK,
            _ => TcpFlags::SYN,
        };
        self.snd_nxt = self.snd_nxt.max(1);
        self.snd_max = self.snd_max.max(1);
        let segment = self.segment(0, flags, 0);
        self.emit(segment, actions);
        self.arm_timer(actions);
    }

    fn send_ack(&mut self, actions: &mut Vec<Action>) {
        let segment = self.segment(self.snd_nxt, TcpFlags::ACK, 0);
        self.emit(segment, actions);
    }

    fn segment(&self, offset: u64, flags: TcpFlags, payload_len: u32) -> TcpSegment {
        let ack = if flags.contains(TcpFlags::ACK) {
            to_wire(self.irs, self.rcv_nxt)
        } else {
            0
        };
        TcpSegment {
            src_port: self.flow.local.port(),
            dst_port: self.flow.remote.port(),
            seq: to_wire(self.iss, offset),
            ack,
            flags,
            window: self.receive_window(),
            payload_len,
        }
    }

    /// In-order data is handed to the application as it arrives, so the
    /// window stays at the full buffer. Out-of-order bytes held for
    /// reassembly do not shrink it; duplicate ACKs must carry an unchanged
    /// window to count toward fast retransmit.
    fn receive_window(&self) -> u16 {
        self.config.advertised_window()
    }

    fn emit(&mut self, segment: TcpSegment, actions: &mut Vec<Action>) {
        if segment.flags.contains(TcpFlags::ACK) {
            self.ack_pending = false;
        }
        self.stats.segments_sent += 1;
        actions.push(Action::SendSegment {
            src: *self.flow.local.ip(),
            dst: *self.flow.remote.ip(),
            segment,
        });
    }

    fn release_acked(&mut self, ack: u64) {
        let keep = self.unacked.split_off(&ack);
        let straddling = self
            .unacked
            .iter()
            .next_back()
            .filter(|&(&start, s)| start + s.len as u64 > ack)
            .map(|(&start, &s)| (start, s));
        self.unacked = keep;
        // A segment only partly acknowledged stays outstanding from `ack`.
        if let Some((start, segment)) = straddling {
            let len = (start + segment.len as u64 - ack) as u32;
            self.unacked.entry(ack).or_insert(SentSegment { len, ..segment });
        }
    }

    fn take_rtt_sample(&mut self, rtt: Duration, actions: &mut Vec<Action>) {
        self.rtt.sample(rtt);
        trace!(flow = %self.flow, ?rtt, rto = ?self.rtt.rto(), "RTT sample");
        actions.push(Action::RttSampled {
            flow: self.flow,
            rtt,
        });
    }

    fn report_window(&self, actions: &mut Vec<Action>) {
        actions.push(Action::CongestionWindowChanged {
            flow: self.flow,
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
        });
    }

    fn unexpected(&self, seg: &TcpSegment) -> TcpError {
        TcpError::UnexpectedSegment {
            state: self.state,
            flags: seg.flags,
        }
    }
}
