//! Per-node TCP stack.
//!
//! Demultiplexes segments to connections, accepts SYNs on listening ports
//! and answers stray segments with RST. One stack per node.

use crate::connection::{ConnectionStats, TcpConnection, TcpState};
use crate::{TcpConfig, TcpError};
use indexmap::IndexMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tcpsim_core::{Action, StateMachine, TimerId};
use tcpsim_types::{FlowId, NodeId, TcpFlags, TcpSegment};
use tracing::{debug, trace, warn};

/// First ephemeral port handed out by `connect`.
pub const EPHEMERAL_PORT_START: u16 = 49153;

/// Inputs to the TCP stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackInput {
    /// A segment arrived from the network.
    Segment {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: TcpSegment,
    },
    /// A timer set by this stack fired.
    Timer(TimerId),
}

/// Stack-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    pub connections_opened: u64,
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub connections_reset: u64,
    /// Segments that matched no connection or did not fit its state.
    pub protocol_errors: u64,
    pub resets_sent: u64,
}

/// Summary kept after a connection is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConnection {
    pub flow: FlowId,
    pub reset: bool,
    pub stats: ConnectionStats,
}

/// TCP for one node.
pub struct TcpStack {
    node: NodeId,
    config: TcpConfig,
    now: Duration,
    rng: ChaCha8Rng,
    addresses: Vec<Ipv4Addr>,
    listeners: BTreeSet<u16>,
    connections: IndexMap<FlowId, TcpConnection>,
    closed: Vec<ClosedConnection>,
    next_port: u16,
    stats: StackStats,
}

impl std::fmt::Debug for TcpStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpStack")
            .field("node", &self.node)
            .field("addresses", &self.addresses)
            .field("listeners", &self.listeners)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl TcpStack {
    /// Create a stack. `seed` drives initial sequence numbers.
    pub fn new(node: NodeId, config: TcpConfig, seed: u64) -> Self {
        Self {
            node,
            config,
            now: Duration::ZERO,
            rng: ChaCha8Rng::seed_from_u64(seed),
            addresses: Vec::new(),
            listeners: BTreeSet::new(),
            connections: IndexMap::new(),
            closed: Vec::new(),
            next_port: EPHEMERAL_PORT_START,
            stats: StackStats::default(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// Replace the config used for new connections.
    pub fn set_config(&mut self, config: TcpConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Assign an address to this node.
    pub fn add_address(&mut self, addr: Ipv4Addr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    pub fn addresses(&self) -> &[Ipv4Addr] {
        &self.addresses
    }

    /// Accept connections on `port`.
    pub fn listen(&mut self, port: u16) -> Result<(), TcpError> {
        if !self.listeners.insert(port) {
            return Err(TcpError::PortInUse(port));
        }
        debug!(node = %self.node, port, "Listening");
        Ok(())
    }

    /// Stop accepting new connections on `port`. Established connections
    /// are unaffected.
    pub fn unlisten(&mut self, port: u16) {
        self.listeners.remove(&port);
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.listeners.contains(&port)
    }

    /// Open a connection from `local` to `remote`.
    pub fn connect(
        &mut self,
        local: Ipv4Addr,
        remote: SocketAddrV4,
    ) -> Result<(FlowId, Vec<Action>), TcpError> {
        if !self.addresses.contains(&local) {
            return Err(TcpError::AddressNotLocal(local));
        }
        let port = self.allocate_port(local, remote)?;
        let flow = FlowId::new(SocketAddrV4::new(local, port), remote);
        let iss = self.rng.gen::<u32>();
        let (conn, actions) = TcpConnection::connect(flow, self.config.clone(), iss, self.now);
        self.connections.insert(flow, conn);
        self.stats.connections_opened += 1;
        Ok((flow, actions))
    }

    /// Queue application data on a connection.
    pub fn send(&mut self, flow: FlowId, bytes: u64) -> Result<Vec<Action>, TcpError> {
        let now = self.now;
        let conn = self
            .connections
            .get_mut(&flow)
            .ok_or(TcpError::UnknownConnection(flow))?;
        conn.write(bytes, now)
    }

    /// Close the sending half of a connection.
    pub fn close(&mut self, flow: FlowId) -> Result<Vec<Action>, TcpError> {
        let now = self.now;
        let conn = self
            .connections
            .get_mut(&flow)
            .ok_or(TcpError::UnknownConnection(flow))?;
        let actions = conn.close(now);
        self.reap(flow);
        Ok(actions)
    }

    /// Reset a connection.
    pub fn abort(&mut self, flow: FlowId) -> Result<Vec<Action>, TcpError> {
        let now = self.now;
        let conn = self
            .connections
            .get_mut(&flow)
            .ok_or(TcpError::UnknownConnection(flow))?;
        let actions = conn.abort(now);
        self.stats.resets_sent += 1;
        self.reap(flow);
        Ok(actions)
    }

    pub fn connection(&self, flow: &FlowId) -> Option<&TcpConnection> {
        self.connections.get(flow)
    }

    /// Open connections in creation order.
    pub fn connections(&self) -> impl Iterator<Item = &TcpConnection> {
        self.connections.values()
    }

    /// Connections that reached CLOSED, in closing order.
    pub fn closed_connections(&self) -> &[ClosedConnection] {
        &self.closed
    }

    fn allocate_port(&mut self, local: Ipv4Addr, remote: SocketAddrV4) -> Result<u16, TcpError> {
        let span = (u16::MAX - EPHEMERAL_PORT_START) as u32 + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            let flow = FlowId::new(SocketAddrV4::new(local, port), remote);
            if !self.listeners.contains(&port) && !self.connections.contains_key(&flow) {
                return Ok(port);
            }
        }
        Err(TcpError::PortsExhausted)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Input handling
    // ═══════════════════════════════════════════════════════════════════════

    fn on_segment(&mut self, src: Ipv4Addr, dst: Ipv4Addr, segment: TcpSegment) -> Vec<Action> {
        let flow = FlowId::new(
            SocketAddrV4::new(dst, segment.dst_port),
            SocketAddrV4::new(src, segment.src_port),
        );
        let now = self.now;

        if let Some(conn) = self.connections.get_mut(&flow) {
            let actions = match conn.on_segment(&segment, now) {
                Ok(actions) => actions,
                Err(error) => {
                    warn!(
                        node = %self.node,
                        flow = %flow,
                        %error,
                        "Protocol error, resetting connection"
                    );
                    self.stats.protocol_errors += 1;
                    self.stats.resets_sent += 1;
                    conn.abort(now)
                }
            };
            self.reap(flow);
            return actions;
        }

        if segment.flags.contains(TcpFlags::RST) {
            trace!(node = %self.node, flow = %flow, "RST for unknown connection dropped");
            return vec![];
        }

        let is_syn = segment.flags.contains(TcpFlags::SYN) && !segment.flags.contains(TcpFlags::ACK);
        if is_syn && self.listeners.contains(&segment.dst_port) {
            let iss = self.rng.gen::<u32>();
            let (conn, actions) =
                TcpConnection::accept(flow, self.config.clone(), iss, &segment, now);
            self.connections.insert(flow, conn);
            self.stats.connections_accepted += 1;
            return actions;
        }

        let error = TcpError::UnknownConnection(flow);
        warn!(node = %self.node, %error, flags = %segment.flags, "Protocol error, sending RST");
        self.stats.protocol_errors += 1;
        self.stats.resets_sent += 1;
        vec![Action::SendSegment {
            src: dst,
            dst: src,
            segment: reset_for(&segment),
        }]
    }

    fn on_timer(&mut self, id: TimerId) -> Vec<Action> {
        let flow = id.flow();
        let now = self.now;
        let Some(conn) = self.connections.get_mut(&flow) else {
            trace!(node = %self.node, flow = %flow, "Timer for closed connection ignored");
            return vec![];
        };
        let actions = conn.on_timeout(now);
        if conn.state() == TcpState::Closed {
            self.stats.resets_sent += 1;
        }
        self.reap(flow);
        actions
    }

    /// Remove `flow` if it reached CLOSED.
    fn reap(&mut self, flow: FlowId) {
        let closed = self
            .connections
            .get(&flow)
            .map(|c| c.is_closed())
            .unwrap_or(false);
        if !closed {
            return;
        }
        if let Some(conn) = self.connections.shift_remove(&flow) {
            let reset = conn.was_reset();
            self.stats.connections_closed += 1;
            if reset {
                self.stats.connections_reset += 1;
            }
            self.closed.push(ClosedConnection {
                flow,
                reset,
                stats: *conn.stats(),
            });
        }
    }
}

/// RST answering a segment that matched no connection (RFC 793).
fn reset_for(segment: &TcpSegment) -> TcpSegment {
    let (seq, ack, flags) = if segment.flags.contains(TcpFlags::ACK) {
        (segment.ack, 0, TcpFlags::RST)
    } else {
        (
            0,
            segment.seq.wrapping_add(segment.seq_len()),
            TcpFlags::RST | TcpFlags::ACK,
        )
    };
    TcpSegment {
        src_port: segment.dst_port,
        dst_port: segment.src_port,
        seq,
        ack,
        flags,
        window: 0,
        payload_len: 0,
    }
}

impl StateMachine for TcpStack {
    type Input = StackInput;

    fn handle(&mut self, input: StackInput) -> Vec<Action> {
        match input {
            StackInput::Segment { src, dst, segment } => self.on_segment(src, dst, segment),
            StackInput::Timer(id) => self.on_timer(id),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 2);
    const PORT: u16 = 9;

    fn make_stack(node: u32, addr: Ipv4Addr, seed: u64) -> TcpStack {
        let mut stack = TcpStack::new(NodeId(node), TcpConfig::default().with_segment_size(512), seed);
        stack.add_address(addr);
        stack
    }

    fn segments(actions: &[Action]) -> Vec<StackInput> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::SendSegment { src, dst, segment } => Some(StackInput::Segment {
                    src: *src,
                    dst: *dst,
                    segment: *segment,
                }),
                _ => None,
            })
            .collect()
    }

    fn first_segment(actions: &[Action]) -> TcpSegment {
        match segments(actions).into_iter().next() {
            Some(StackInput::Segment { segment, .. }) => segment,
            _ => panic!("no segment in {:?}", actions),
        }
    }

    /// Deliver segments back and forth until both stacks are quiet.
    /// Returns every action produced on the way.
    fn exchange(client: &mut TcpStack, server: &mut TcpStack, initial: Vec<Action>) -> Vec<Action> {
        let mut all = initial.clone();
        let mut to_server = segments(&initial);
        let mut to_client = Vec::new();
        let mut now = client.now();
        while !to_server.is_empty() || !to_client.is_empty() {
            now += Duration::from_millis(1);
            for input in std::mem::take(&mut to_server) {
                server.set_time(now);
                let actions = server.handle(input);
                to_client.extend(segments(&actions));
                all.extend(actions);
            }
            for input in std::mem::take(&mut to_client) {
                client.set_time(now);
                let actions = client.handle(input);
                to_server.extend(segments(&actions));
                all.extend(actions);
            }
        }
        all
    }

    #[test]
    fn test_listen_twice_fails() {
        let mut stack = make_stack(1, SERVER, 1);
        stack.listen(PORT).unwrap();
        assert_eq!(stack.listen(PORT), Err(TcpError::PortInUse(PORT)));
        stack.unlisten(PORT);
        assert!(!stack.is_listening(PORT));
        stack.listen(PORT).unwrap();
    }

    #[test]
    fn test_connect_requires_local_address() {
        let mut stack = make_stack(0, CLIENT, 1);
        let err = stack
            .connect(SERVER, SocketAddrV4::new(CLIENT, PORT))
            .unwrap_err();
        assert_eq!(err, TcpError::AddressNotLocal(SERVER));
    }

    #[test]
    fn test_ephemeral_ports_increment() {
        let mut stack = make_stack(0, CLIENT, 1);
        let remote = SocketAddrV4::new(SERVER, PORT);
        let (a, _) = stack.connect(CLIENT, remote).unwrap();
        let (b, _) = stack.connect(CLIENT, remote).unwrap();
        assert_eq!(a.local.port(), EPHEMERAL_PORT_START);
        assert_eq!(b.local.port(), EPHEMERAL_PORT_START + 1);
        assert_eq!(stack.stats().connections_opened, 2);
    }

    #[test]
    fn test_isn_depends_on_seed() {
        let remote = SocketAddrV4::new(SERVER, PORT);
        let syn = |seed| {
            let mut stack = make_stack(0, CLIENT, seed);
            let (_, actions) = stack.connect(CLIENT, remote).unwrap();
            first_segment(&actions).seq
        };
        assert_eq!(syn(7), syn(7));
        assert_ne!(syn(7), syn(8));
    }

    #[traced_test]
    #[test]
    fn test_unknown_connection_gets_rst() {
        let mut server = make_stack(1, SERVER, 1);
        let stray = TcpSegment {
            src_port: 40000,
            dst_port: PORT,
            seq: 100,
            ack: 555,
            flags: TcpFlags::ACK,
            window: 1000,
            payload_len: 10,
        };
        let actions = server.handle(StackInput::Segment {
            src: CLIENT,
            dst: SERVER,
            segment: stray,
        });
        let rst = first_segment(&actions);
        assert_eq!(rst.flags, TcpFlags::RST);
        assert_eq!(rst.seq, 555);
        assert_eq!(rst.dst_port, 40000);
        assert_eq!(server.stats().protocol_errors, 1);
        assert!(logs_contain("Protocol error"));
    }

    #[test]
    fn test_syn_to_closed_port_is_reset() {
        let mut server = make_stack(1, SERVER, 1);
        let syn = TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq: 100,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 1000,
            payload_len: 0,
        };
        let actions = server.handle(StackInput::Segment {
            src: CLIENT,
            dst: SERVER,
            segment: syn,
        });
        let rst = first_segment(&actions);
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.ack, 101);
    }

    #[test]
    fn test_rst_for_unknown_connection_is_dropped() {
        let mut server = make_stack(1, SERVER, 1);
        let rst = TcpSegment {
            src_port: 40000,
            dst_port: PORT,
            seq: 100,
            ack: 0,
            flags: TcpFlags::RST,
            window: 0,
            payload_len: 0,
        };
        let actions = server.handle(StackInput::Segment {
            src: CLIENT,
            dst: SERVER,
            segment: rst,
        });
        assert!(actions.is_empty());
        assert_eq!(server.stats().protocol_errors, 0);
    }

    #[test]
    fn test_timer_for_unknown_flow_is_ignored() {
        let mut stack = make_stack(0, CLIENT, 1);
        let flow = FlowId::new(
            SocketAddrV4::new(CLIENT, 50000),
            SocketAddrV4::new(SERVER, PORT),
        );
        assert!(stack.handle(StackInput::Timer(TimerId::Retransmit(flow))).is_empty());
    }

    #[test]
    fn test_transfer_and_close() {
        let mut client = make_stack(0, CLIENT, 1);
        let mut server = make_stack(1, SERVER, 2);
        server.listen(PORT).unwrap();

        let (flow, actions) = client.connect(CLIENT, SocketAddrV4::new(SERVER, PORT)).unwrap();
        let actions = exchange(&mut client, &mut server, actions);
        assert!(actions.contains(&Action::ConnectionEstablished { flow }));
        assert!(actions.contains(&Action::ConnectionEstablished {
            flow: flow.reversed()
        }));
        assert_eq!(server.stats().connections_accepted, 1);

        let actions = client.send(flow, 10_000).unwrap();
        let actions = exchange(&mut client, &mut server, actions);
        let delivered: u64 = actions
            .iter()
            .filter_map(|a| match a {
                Action::DeliverData { flow: f, bytes } if *f == flow.reversed() => Some(*bytes),
                _ => None,
            })
            .sum();
        assert_eq!(delivered, 10_000);

        let actions = client.close(flow).unwrap();
        exchange(&mut client, &mut server, actions);
        assert!(client.connection(&flow).is_none());
        assert!(server.connection(&flow.reversed()).is_none());

        let closed = &client.closed_connections()[0];
        assert_eq!(closed.flow, flow);
        assert!(!closed.reset);
        assert_eq!(closed.stats.bytes_acked, 10_000);
        assert_eq!(server.closed_connections()[0].stats.bytes_delivered, 10_000);
    }
}
