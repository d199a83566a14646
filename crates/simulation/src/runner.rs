//! Deterministic simulation runner.
//!
//! Owns the scheduler, the topology and every node's stack and
//! applications. Events are dispatched one at a time; stack outputs are
//! executed as actions before the next event is looked at.

use crate::error::{SchedulingError, SimulationError, TopologyError, TraceError};
use crate::event_queue::EventHandle;
use crate::link::{LinkConfig, NetDevice, Offer, PointToPointChannel, TransmitOutcome};
use crate::node::{Application, Ipv4AddressAllocator, Node, Route};
use crate::observer::{NoopObserver, SimulationObserver};
use crate::scheduler::{Scheduler, SchedulerStats};
use crate::stats::SimulationStats;
use crate::trace::{Direction, PacketTracer};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tcpsim_apps::{OnOffSender, PacketSink, SenderState, TrafficGenerator, TrafficPattern};
use tcpsim_core::{Action, Event, StateMachine, TimerId};
use tcpsim_tcp::{StackInput, TcpConfig, TcpError};
use tcpsim_types::{AppId, ChannelId, DeviceId, NodeId, Packet, PacketUid};
use tracing::{debug, info, trace, warn};

/// Parameters of an on/off sender application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderSpec {
    /// Local address the connection is opened from.
    pub local: Ipv4Addr,
    /// Where the data goes.
    pub remote: SocketAddrV4,
    pub pattern: TrafficPattern,
    /// Bytes per write.
    pub packet_size: u64,
}

/// Deterministic simulation runner.
///
/// Processes events in deterministic order and executes actions.
/// Given the same seed and the same build order, produces identical
/// results every run.
pub struct SimulationRunner<O: SimulationObserver = NoopObserver> {
    /// Event queue and virtual clock.
    scheduler: Scheduler<Event>,

    /// Seeds per-node stacks (seeded for determinism).
    rng: ChaCha8Rng,
    seed: u64,

    /// Config given to stacks of new nodes.
    tcp_config: TcpConfig,

    /// All nodes, indexed by `NodeId`.
    nodes: Vec<Node>,
    devices: BTreeMap<DeviceId, NetDevice>,
    /// Indexed by `ChannelId`.
    channels: Vec<PointToPointChannel>,

    /// Timer registry for cancellation support.
    /// Maps (node, timer_id) -> pending event.
    timers: HashMap<(NodeId, TimerId), EventHandle>,

    next_packet_uid: u64,
    tracer: Option<Box<dyn PacketTracer>>,
    observer: O,
    stats: SimulationStats,
}

impl<O: SimulationObserver> std::fmt::Debug for SimulationRunner<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationRunner")
            .field("now", &self.scheduler.now())
            .field("seed", &self.seed)
            .field("nodes", &self.nodes.len())
            .field("channels", &self.channels.len())
            .field("pending_events", &self.scheduler.pending())
            .finish()
    }
}

impl SimulationRunner<NoopObserver> {
    /// Create a runner with no observer.
    pub fn new(seed: u64) -> Self {
        Self::with_observer(seed, NoopObserver)
    }
}

impl<O: SimulationObserver> SimulationRunner<O> {
    pub fn with_observer(seed: u64, observer: O) -> Self {
        info!(seed, "Created simulation runner");
        Self {
            scheduler: Scheduler::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            tcp_config: TcpConfig::default(),
            nodes: Vec::new(),
            devices: BTreeMap::new(),
            channels: Vec::new(),
            timers: HashMap::new(),
            next_packet_uid: 0,
            tracer: None,
            observer,
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Topology
    // ═══════════════════════════════════════════════════════════════════════

    /// Set the TCP config for every node, existing and future. Connections
    /// already open keep theirs.
    pub fn set_tcp_config(&mut self, config: TcpConfig) {
        for node in &mut self.nodes {
            node.stack_mut().set_config(config.clone());
        }
        self.tcp_config = config;
    }

    pub fn add_node(&mut self) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let stack_seed = self.rng.gen::<u64>();
        let stack = tcpsim_tcp::TcpStack::new(id, self.tcp_config.clone(), stack_seed);
        self.nodes.push(Node::new(id, stack));
        debug!(node = %id, "Node added");
        id
    }

    /// Join two nodes with a point-to-point link. Each node gets a new
    /// device.
    pub fn add_point_to_point(
        &mut self,
        a: NodeId,
        b: NodeId,
        config: &LinkConfig,
    ) -> Result<ChannelId, TopologyError> {
        if a == b {
            return Err(TopologyError::SelfLink(a));
        }
        self.node(a)?;
        self.node(b)?;

        let channel = ChannelId(self.channels.len() as u32);
        let dev_a = self.node_mut(a)?.next_device();
        let dev_b = self.node_mut(b)?.next_device();
        self.devices
            .insert(dev_a, NetDevice::new(dev_a, channel, config));
        self.devices
            .insert(dev_b, NetDevice::new(dev_b, channel, config));
        self.channels
            .push(PointToPointChannel::new(channel, dev_a, dev_b, config.delay));

        if let Some(tracer) = self.tracer.as_mut() {
            tracer.attach(dev_a);
            tracer.attach(dev_b);
        }
        debug!(
            %channel,
            a = %dev_a,
            b = %dev_b,
            data_rate = %config.data_rate,
            delay = ?config.delay,
            "Point-to-point link added"
        );
        Ok(channel)
    }

    /// Give `device` an address. Adds a connected route for its network.
    pub fn assign_address(
        &mut self,
        device: DeviceId,
        addr: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), TopologyError> {
        if prefix_len > 32 {
            return Err(TopologyError::InvalidPrefix(prefix_len));
        }
        self.devices
            .get_mut(&device)
            .ok_or(TopologyError::UnknownDevice(device))?
            .set_address(addr, prefix_len);
        let node = self.node_mut(device.node)?;
        node.stack_mut().add_address(addr);
        node.add_route(Route::new(addr, prefix_len, device));
        debug!(%device, %addr, prefix_len, "Address assigned");
        Ok(())
    }

    /// Address both ends of a channel from `pool`.
    pub fn assign_addresses(
        &mut self,
        channel: ChannelId,
        pool: &mut Ipv4AddressAllocator,
    ) -> Result<[Ipv4Addr; 2], TopologyError> {
        let ends = self
            .channels
            .get(channel.0 as usize)
            .map(|c| c.ends())
            .ok_or(TopologyError::UnknownChannel(channel))?;
        let mut assigned = [Ipv4Addr::UNSPECIFIED; 2];
        for (slot, device) in assigned.iter_mut().zip(ends) {
            let addr = pool.allocate()?;
            self.assign_address(device, addr, pool.prefix_len())?;
            *slot = addr;
        }
        Ok(assigned)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Applications
    // ═══════════════════════════════════════════════════════════════════════

    /// Install a sink listening on `port`. It counts bytes between `start`
    /// and `stop`.
    pub fn install_sink(
        &mut self,
        node: NodeId,
        port: u16,
        start: Duration,
        stop: Duration,
    ) -> Result<AppId, SimulationError> {
        check_window(self.now(), start, stop)?;
        let n = self.node_mut(node)?;
        n.stack_mut().listen(port)?;
        let app = n.add_app(Application::Sink(PacketSink::new(port)));
        self.schedule_app(node, app, start, stop)?;
        info!(node = %node, %app, port, ?start, ?stop, "Sink installed");
        Ok(app)
    }

    /// Install an on/off sender. It connects at `start`, writes until
    /// `stop` and then closes its connection.
    pub fn install_sender(
        &mut self,
        node: NodeId,
        spec: SenderSpec,
        start: Duration,
        stop: Duration,
    ) -> Result<AppId, SimulationError> {
        check_window(self.now(), start, stop)?;
        let generator = TrafficGenerator::new(spec.pattern, spec.packet_size, start, stop)?;
        let n = self.node_mut(node)?;
        if !n.is_local(spec.local) {
            return Err(TcpError::AddressNotLocal(spec.local).into());
        }
        let sender = OnOffSender::new(spec.local, spec.remote, generator);
        let app = n.add_app(Application::Sender(sender));
        self.schedule_app(node, app, start, stop)?;
        info!(
            node = %node,
            %app,
            remote = %spec.remote,
            rate = %spec.pattern.rate(),
            packet_size = spec.packet_size,
            ?start,
            ?stop,
            "Sender installed"
        );
        Ok(app)
    }

    fn schedule_app(
        &mut self,
        node: NodeId,
        app: AppId,
        start: Duration,
        stop: Duration,
    ) -> Result<(), SchedulingError> {
        self.scheduler
            .schedule_at(start, Event::ApplicationStart { node, app })?;
        self.scheduler
            .schedule_at(stop, Event::ApplicationStop { node, app })?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Tracing
    // ═══════════════════════════════════════════════════════════════════════

    /// Trace every device, including ones added later.
    pub fn set_tracer(&mut self, tracer: impl PacketTracer + 'static) {
        let mut tracer: Box<dyn PacketTracer> = Box::new(tracer);
        for &device in self.devices.keys() {
            tracer.attach(device);
        }
        self.tracer = Some(tracer);
    }

    /// Flush traces. Reports the first capture error of the run.
    pub fn finish(&mut self) -> Result<(), TraceError> {
        info!(
            now = ?self.now(),
            events = self.stats.events_processed,
            drops = self.stats.packets_dropped(),
            "Simulation finished"
        );
        match self.tracer.as_mut() {
            Some(tracer) => tracer.finish(),
            None => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Running
    // ═══════════════════════════════════════════════════════════════════════

    /// Run all events up to and including `end_time`, then advance the
    /// clock to `end_time`.
    pub fn run_until(&mut self, end_time: Duration) -> Result<(), SimulationError> {
        trace!(
            end_time_secs = end_time.as_secs_f64(),
            "Running simulation step"
        );
        while let Some(event) = self.scheduler.pop_until(end_time) {
            self.process_event(event)?;
        }
        debug!(
            remaining_events = self.scheduler.pending(),
            "Time limit reached"
        );
        self.scheduler.advance_to(end_time);
        Ok(())
    }

    /// Run until no events remain.
    pub fn run(&mut self) -> Result<(), SimulationError> {
        while let Some(event) = self.scheduler.pop_next() {
            self.process_event(event)?;
        }
        Ok(())
    }

    /// Offer a packet to a device for transmission.
    pub fn transmit(
        &mut self,
        device: DeviceId,
        packet: Packet,
    ) -> Result<TransmitOutcome, SimulationError> {
        let now = self.now();
        let dev = self
            .devices
            .get_mut(&device)
            .ok_or(TopologyError::UnknownDevice(device))?;
        match dev.offer(packet) {
            Offer::Start(packet) => {
                let arrival_at = self.start_transmission(device, packet)?;
                Ok(TransmitOutcome::Started { arrival_at })
            }
            Offer::Queued(depth) => {
                trace!(%device, depth, "Packet queued");
                Ok(TransmitOutcome::Queued { depth })
            }
            Offer::Dropped(packet) => {
                self.stats.queue_drops += 1;
                debug!(%device, %packet, "Transmit queue full, packet dropped");
                self.observer.on_drop(now, device, &packet);
                Ok(TransmitOutcome::Dropped)
            }
        }
    }

    /// Allocate the next packet uid.
    pub fn next_packet_uid(&mut self) -> PacketUid {
        let uid = PacketUid(self.next_packet_uid);
        self.next_packet_uid += 1;
        uid
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.scheduler.now()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn scheduler_stats(&self) -> &SchedulerStats {
        self.scheduler.stats()
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn tcp_config(&self) -> &TcpConfig {
        &self.tcp_config
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, TopologyError> {
        self.nodes
            .get(id.index())
            .ok_or(TopologyError::UnknownNode(id))
    }

    pub fn device(&self, id: DeviceId) -> Option<&NetDevice> {
        self.devices.get(&id)
    }

    /// Devices ordered by node, then by position on the node.
    pub fn devices(&self) -> impl Iterator<Item = &NetDevice> {
        self.devices.values()
    }

    pub fn channels(&self) -> &[PointToPointChannel] {
        &self.channels
    }

    pub fn sink(&self, node: NodeId, app: AppId) -> Option<&PacketSink> {
        match self.nodes.get(node.index())?.app(app)? {
            Application::Sink(sink) => Some(sink),
            Application::Sender(_) => None,
        }
    }

    pub fn sender(&self, node: NodeId, app: AppId) -> Option<&OnOffSender> {
        match self.nodes.get(node.index())?.app(app)? {
            Application::Sender(sender) => Some(sender),
            Application::Sink(_) => None,
        }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, TopologyError> {
        self.nodes
            .get_mut(id.index())
            .ok_or(TopologyError::UnknownNode(id))
    }

    fn sender_mut(&mut self, node: NodeId, app: AppId) -> Result<&mut OnOffSender, TopologyError> {
        match self.node_mut(node)?.app_mut(app)? {
            Application::Sender(sender) => Ok(sender),
            Application::Sink(_) => Err(TopologyError::UnknownApp { node, app }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════

    fn process_event(&mut self, event: Event) -> Result<(), SimulationError> {
        let now = self.now();
        trace!(
            time = ?now,
            node = %event.node(),
            event = event.type_name(),
            "Processing event"
        );
        self.stats.events_processed += 1;
        self.observer.on_event(now, &event);

        match event {
            Event::ApplicationStart { node, app } => self.start_app(node, app),
            Event::ApplicationSend { node, app } => self.app_send(node, app),
            Event::ApplicationStop { node, app } => self.stop_app(node, app),
            Event::TransmitComplete { device } => {
                let next = self
                    .devices
                    .get_mut(&device)
                    .ok_or(TopologyError::UnknownDevice(device))?
                    .complete();
                if let Some(packet) = next {
                    self.start_transmission(device, packet)?;
                }
                Ok(())
            }
            Event::PacketArrival { device, packet } => self.receive(device, packet),
            Event::Timer { node, timer } => {
                self.timers.remove(&(node, timer));
                self.handle_stack(node, StackInput::Timer(timer))
            }
        }
    }

    fn start_app(&mut self, node: NodeId, app: AppId) -> Result<(), SimulationError> {
        let now = self.now();
        let sender = match self.node_mut(node)?.app_mut(app)? {
            Application::Sink(sink) => {
                sink.start(now);
                return Ok(());
            }
            Application::Sender(sender) => sender,
        };
        if sender.state() != SenderState::Idle {
            return Ok(());
        }
        let first_write = sender.start(now);
        let (local, remote) = (sender.local(), sender.remote());

        let stack = self.node_mut(node)?.stack_mut();
        stack.set_time(now);
        match stack.connect(local, remote) {
            Ok((flow, actions)) => {
                debug!(node = %node, %flow, "Sender connecting");
                self.sender_mut(node, app)?.set_flow(flow);
                self.process_actions(node, actions)?;
            }
            Err(error) => warn!(node = %node, %app, %error, "Sender could not connect"),
        }

        if let Some(at) = first_write {
            self.scheduler
                .schedule_at(at, Event::ApplicationSend { node, app })?;
        }
        Ok(())
    }

    fn app_send(&mut self, node: NodeId, app: AppId) -> Result<(), SimulationError> {
        let now = self.now();
        let sender = self.sender_mut(node, app)?;
        let Some((request, next_write)) = sender.take_due(now) else {
            return Ok(());
        };

        let accepted = match sender.flow() {
            Some(flow) => {
                let stack = self.node_mut(node)?.stack_mut();
                stack.set_time(now);
                match stack.send(flow, request.bytes) {
                    Ok(actions) => {
                        self.process_actions(node, actions)?;
                        true
                    }
                    Err(error) => {
                        trace!(node = %node, %flow, %error, "Write rejected");
                        false
                    }
                }
            }
            None => false,
        };
        self.sender_mut(node, app)?
            .record_write(request.bytes, accepted);

        if let Some(at) = next_write {
            self.scheduler
                .schedule_at(at, Event::ApplicationSend { node, app })?;
        }
        Ok(())
    }

    fn stop_app(&mut self, node: NodeId, app: AppId) -> Result<(), SimulationError> {
        let now = self.now();
        let n = self.node_mut(node)?;
        let flow = match n.app_mut(app)? {
            Application::Sink(sink) => {
                sink.stop(now);
                let port = sink.port();
                n.stack_mut().unlisten(port);
                return Ok(());
            }
            Application::Sender(sender) => sender.stop(now),
        };
        let Some(flow) = flow else {
            return Ok(());
        };

        let stack = n.stack_mut();
        stack.set_time(now);
        match stack.close(flow) {
            Ok(actions) => self.process_actions(node, actions)?,
            Err(error) => debug!(node = %node, %flow, %error, "Connection already gone at stop"),
        }
        Ok(())
    }

    fn receive(&mut self, device: DeviceId, packet: Packet) -> Result<(), SimulationError> {
        let now = self.now();
        self.devices
            .get_mut(&device)
            .ok_or(TopologyError::UnknownDevice(device))?
            .record_rx(&packet);
        self.stats.packets_received += 1;
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.record(now, device, Direction::Receive, &packet);
        }
        self.observer.on_receive(now, device, &packet);
        debug!(%device, %packet, "Packet received");

        let node = device.node;
        if !self.node(node)?.is_local(packet.dst()) {
            trace!(%device, dst = %packet.dst(), "Packet not addressed to this node, dropped");
            self.stats.misdelivered += 1;
            return Ok(());
        }
        self.handle_stack(
            node,
            StackInput::Segment {
                src: packet.src(),
                dst: packet.dst(),
                segment: *packet.tcp(),
            },
        )
    }

    fn handle_stack(&mut self, node: NodeId, input: StackInput) -> Result<(), SimulationError> {
        let now = self.now();
        let stack = self.node_mut(node)?.stack_mut();
        stack.set_time(now);
        let actions = stack.handle(input);
        self.process_actions(node, actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action execution
    // ═══════════════════════════════════════════════════════════════════════

    fn process_actions(&mut self, node: NodeId, actions: Vec<Action>) -> Result<(), SimulationError> {
        let now = self.now();
        for action in actions {
            self.stats.actions_generated += 1;
            self.observer.on_action(now, node, &action);
            self.process_action(node, action)?;
        }
        Ok(())
    }

    fn process_action(&mut self, node: NodeId, action: Action) -> Result<(), SimulationError> {
        match action {
            Action::SendSegment { src, dst, segment } => {
                let device = match self.node(node)?.route(dst) {
                    Ok(device) => device,
                    Err(error) => {
                        warn!(%error, "Segment dropped");
                        self.stats.routing_drops += 1;
                        return Ok(());
                    }
                };
                let uid = self.next_packet_uid();
                self.transmit(device, Packet::new(uid, src, dst, segment)?)?;
            }

            Action::SetTimer { id, duration } => {
                if let Some(previous) = self.timers.remove(&(node, id)) {
                    self.scheduler.cancel(previous);
                }
                let handle = self
                    .scheduler
                    .schedule(duration, Event::Timer { node, timer: id })?;
                self.timers.insert((node, id), handle);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(handle) = self.timers.remove(&(node, id)) {
                    if self.scheduler.cancel(handle) {
                        self.stats.timers_cancelled += 1;
                    }
                }
            }

            Action::DeliverData { flow, bytes } => {
                let now = self.now();
                match self.node_mut(node)?.sink_mut(flow.local.port()) {
                    Some(sink) => sink.on_receive(flow, bytes, now),
                    None => trace!(node = %node, %flow, bytes, "No application bound, data discarded"),
                }
            }

            Action::ConnectionEstablished { flow } => {
                debug!(node = %node, %flow, "Connection established");
            }

            Action::ConnectionClosed { flow, reset } => {
                debug!(node = %node, %flow, reset, "Connection closed");
            }

            Action::CongestionWindowChanged {
                flow,
                cwnd,
                ssthresh,
            } => {
                trace!(node = %node, %flow, cwnd, ssthresh, "Congestion window changed");
            }

            Action::RttSampled { flow, rtt } => {
                trace!(node = %node, %flow, ?rtt, "RTT sample");
            }

            Action::Retransmitted { flow, kind, bytes } => {
                debug!(node = %node, %flow, ?kind, bytes, "Segment retransmitted");
            }
        }
        Ok(())
    }

    /// Put `packet` on the wire at `device`. Returns its arrival time at
    /// the peer.
    fn start_transmission(
        &mut self,
        device: DeviceId,
        packet: Packet,
    ) -> Result<Duration, SimulationError> {
        let now = self.now();
        let dev = self
            .devices
            .get_mut(&device)
            .ok_or(TopologyError::UnknownDevice(device))?;
        let tx_time = dev.begin(&packet);
        let channel = self
            .channels
            .get(dev.channel().0 as usize)
            .ok_or(TopologyError::UnknownDevice(device))?;
        let peer = channel
            .peer(device)
            .ok_or(TopologyError::UnknownDevice(device))?;
        let in_flight = tx_time.saturating_add(channel.delay());

        self.stats.packets_transmitted += 1;
        if let Some(tracer) = self.tracer.as_mut() {
            tracer.record(now, device, Direction::Transmit, &packet);
        }
        self.observer.on_transmit(now, device, &packet);
        trace!(%device, %peer, tx_time = ?tx_time, %packet, "Transmission started");

        self.scheduler
            .schedule(tx_time, Event::TransmitComplete { device })?;
        let arrival = self.scheduler.schedule(
            in_flight,
            Event::PacketArrival {
                device: peer,
                packet,
            },
        )?;
        Ok(arrival.time())
    }
}

fn check_window(now: Duration, start: Duration, stop: Duration) -> Result<(), SchedulingError> {
    if start < now {
        return Err(SchedulingError::InPast { at: start, now });
    }
    if stop < start {
        return Err(SchedulingError::StopBeforeStart { start, stop });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcpsim_core::RetransmitKind;
    use tcpsim_types::{DataRate, TcpFlags, TcpSegment};
    use tracing_test::traced_test;

    const PORT: u16 = 9;

    #[derive(Debug, Default)]
    struct Recorder {
        transmits: Vec<(Duration, DeviceId)>,
        receives: Vec<(Duration, DeviceId)>,
        drops: u64,
        timeouts: u64,
    }

    impl SimulationObserver for Recorder {
        fn on_transmit(&mut self, now: Duration, device: DeviceId, _packet: &Packet) {
            self.transmits.push((now, device));
        }

        fn on_receive(&mut self, now: Duration, device: DeviceId, _packet: &Packet) {
            self.receives.push((now, device));
        }

        fn on_drop(&mut self, _now: Duration, _device: DeviceId, _packet: &Packet) {
            self.drops += 1;
        }

        fn on_action(&mut self, _now: Duration, _node: NodeId, action: &Action) {
            if let Action::Retransmitted {
                kind: RetransmitKind::Timeout,
                ..
            } = action
            {
                self.timeouts += 1;
            }
        }
    }

    struct TwoNodes {
        runner: SimulationRunner<Recorder>,
        a: NodeId,
        b: NodeId,
        addrs: [Ipv4Addr; 2],
    }

    fn two_nodes(link: LinkConfig) -> TwoNodes {
        let mut runner = SimulationRunner::with_observer(42, Recorder::default());
        let a = runner.add_node();
        let b = runner.add_node();
        let channel = runner.add_point_to_point(a, b, &link).unwrap();
        let mut pool = Ipv4AddressAllocator::new(Ipv4Addr::new(10, 1, 1, 0), 24).unwrap();
        let addrs = runner.assign_addresses(channel, &mut pool).unwrap();
        TwoNodes {
            runner,
            a,
            b,
            addrs,
        }
    }

    fn data_packet(runner: &mut SimulationRunner<Recorder>, addrs: [Ipv4Addr; 2], len: u32) -> Packet {
        let uid = runner.next_packet_uid();
        Packet::new(
            uid,
            addrs[0],
            addrs[1],
            TcpSegment {
                src_port: 50000,
                dst_port: PORT,
                seq: 1,
                ack: 0,
                flags: TcpFlags::ACK,
                window: 65535,
                payload_len: len,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_addresses_and_routes() {
        let net = two_nodes(LinkConfig::default());
        assert_eq!(
            net.addrs,
            [Ipv4Addr::new(10, 1, 1, 1), Ipv4Addr::new(10, 1, 1, 2)]
        );
        let a = net.runner.node(net.a).unwrap();
        assert!(a.is_local(net.addrs[0]));
        assert_eq!(
            a.route(net.addrs[1]).unwrap(),
            DeviceId::new(net.a, 0)
        );
    }

    #[test]
    fn test_packet_arrives_after_delay_plus_tx_time() {
        let link = LinkConfig::default().with_queue_size(None);
        let mut net = two_nodes(link);
        // 458 payload bytes: 500 bytes on the wire, 800us at 5 Mbps
        let packet = data_packet(&mut net.runner, net.addrs, 458);
        let outcome = net.runner.transmit(DeviceId::new(net.a, 0), packet).unwrap();
        let expected = Duration::from_micros(2_800);
        assert_eq!(outcome, TransmitOutcome::Started { arrival_at: expected });

        net.runner.run_until(Duration::from_millis(100)).unwrap();

        let at_b: Vec<_> = net
            .runner
            .observer()
            .receives
            .iter()
            .filter(|(_, d)| d.node == net.b)
            .collect();
        assert_eq!(at_b, vec![&(expected, DeviceId::new(net.b, 0))]);
        let device = net.runner.device(DeviceId::new(net.b, 0)).unwrap();
        assert_eq!(device.stats().rx_packets, 1);
        assert_eq!(device.stats().rx_bytes, 500);
        assert_eq!(net.runner.now(), Duration::from_millis(100));
    }

    #[traced_test]
    #[test]
    fn test_stray_segment_gets_reset() {
        let mut net = two_nodes(LinkConfig::default());
        let packet = data_packet(&mut net.runner, net.addrs, 100);
        net.runner.transmit(DeviceId::new(net.a, 0), packet).unwrap();
        net.runner.run().unwrap();

        // Node 1 has no listener: it answers with RST
        let back_at_a = net
            .runner
            .observer()
            .receives
            .iter()
            .filter(|(_, d)| d.node == net.a)
            .count();
        assert_eq!(back_at_a, 1);
        assert_eq!(
            net.runner.node(net.b).unwrap().stack().stats().resets_sent,
            1
        );
        assert!(logs_contain("Packet received"));
    }

    #[test]
    fn test_back_to_back_packets_queue_and_drop() {
        let link = LinkConfig::default().with_queue_size(Some(1));
        let mut net = two_nodes(link);
        let device = DeviceId::new(net.a, 0);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let packet = data_packet(&mut net.runner, net.addrs, 458);
            outcomes.push(net.runner.transmit(device, packet).unwrap());
        }
        assert!(matches!(outcomes[0], TransmitOutcome::Started { .. }));
        assert_eq!(outcomes[1], TransmitOutcome::Queued { depth: 1 });
        assert_eq!(outcomes[2], TransmitOutcome::Dropped);

        net.runner.run_until(Duration::from_millis(10)).unwrap();
        let transmits: Vec<Duration> = net
            .runner
            .observer()
            .transmits
            .iter()
            .filter(|(_, d)| *d == device)
            .map(|(t, _)| *t)
            .collect();
        // Second packet starts when the first finishes serializing
        assert_eq!(transmits, vec![Duration::ZERO, Duration::from_micros(800)]);
        assert_eq!(net.runner.stats().queue_drops, 1);
        assert_eq!(net.runner.observer().drops, 1);
        assert_eq!(net.runner.device(device).unwrap().stats().queue_drops, 1);
    }

    #[test]
    fn test_tcp_transfer_reaches_sink() {
        let mut net = two_nodes(LinkConfig::default());
        let sink = net
            .runner
            .install_sink(net.b, PORT, Duration::ZERO, Duration::from_secs(5))
            .unwrap();
        let spec = SenderSpec {
            local: net.addrs[0],
            remote: SocketAddrV4::new(net.addrs[1], PORT),
            pattern: TrafficPattern::ConstantBitRate {
                rate: DataRate::from_mbps(1),
            },
            packet_size: 1024,
        };
        let sender = net
            .runner
            .install_sender(net.a, spec, Duration::from_secs(1), Duration::from_secs(3))
            .unwrap();

        net.runner.run_until(Duration::from_secs(5)).unwrap();

        let sender = net.runner.sender(net.a, sender).unwrap();
        // floor(2s / 8.192ms) writes
        assert_eq!(sender.stats().writes, 244);
        assert_eq!(sender.stats().bytes_accepted, 244 * 1024);
        let sink = net.runner.sink(net.b, sink).unwrap();
        assert_eq!(sink.total_received(), 244 * 1024);
        assert_eq!(net.runner.stats().queue_drops, 0);
        assert_eq!(net.runner.observer().timeouts, 0);

        let client = net.runner.node(net.a).unwrap().stack();
        assert_eq!(client.closed_connections().len(), 1);
        assert!(!client.closed_connections()[0].reset);
    }

    #[test]
    fn test_same_seed_same_run() {
        let run = |seed: u64| {
            let mut runner = SimulationRunner::with_observer(seed, Recorder::default());
            let a = runner.add_node();
            let b = runner.add_node();
            let channel = runner
                .add_point_to_point(a, b, &LinkConfig::default())
                .unwrap();
            let mut pool = Ipv4AddressAllocator::new(Ipv4Addr::new(10, 1, 1, 0), 24).unwrap();
            let addrs = runner.assign_addresses(channel, &mut pool).unwrap();
            runner
                .install_sink(b, PORT, Duration::ZERO, Duration::from_secs(2))
                .unwrap();
            let spec = SenderSpec {
                local: addrs[0],
                remote: SocketAddrV4::new(addrs[1], PORT),
                pattern: TrafficPattern::ConstantBitRate {
                    rate: DataRate::from_mbps(1),
                },
                packet_size: 1024,
            };
            runner
                .install_sender(a, spec, Duration::from_millis(500), Duration::from_secs(2))
                .unwrap();
            runner.run_until(Duration::from_secs(2)).unwrap();
            (*runner.stats(), runner.observer().transmits.clone())
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_invalid_installation() {
        let mut net = two_nodes(LinkConfig::default());
        assert!(matches!(
            net.runner
                .install_sink(net.b, PORT, Duration::from_secs(2), Duration::from_secs(1)),
            Err(SimulationError::Scheduling(SchedulingError::StopBeforeStart { .. }))
        ));
        net.runner
            .install_sink(net.b, PORT, Duration::ZERO, Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            net.runner
                .install_sink(net.b, PORT, Duration::ZERO, Duration::from_secs(1)),
            Err(SimulationError::Tcp(TcpError::PortInUse(PORT)))
        ));

        let spec = SenderSpec {
            local: Ipv4Addr::new(192, 168, 0, 1),
            remote: SocketAddrV4::new(net.addrs[1], PORT),
            pattern: TrafficPattern::ConstantBitRate {
                rate: DataRate::from_mbps(1),
            },
            packet_size: 1024,
        };
        assert!(matches!(
            net.runner
                .install_sender(net.a, spec, Duration::ZERO, Duration::from_secs(1)),
            Err(SimulationError::Tcp(TcpError::AddressNotLocal(_)))
        ));
        assert!(matches!(
            net.runner.add_point_to_point(net.a, net.a, &LinkConfig::default()),
            Err(TopologyError::SelfLink(_))
        ));
        assert!(matches!(
            net.runner.add_point_to_point(net.a, NodeId(9), &LinkConfig::default()),
            Err(TopologyError::UnknownNode(NodeId(9)))
        ));
    }

    #[test]
    fn test_scheduling_in_past_rejected() {
        let mut net = two_nodes(LinkConfig::default());
        net.runner.run_until(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            net.runner
                .install_sink(net.b, PORT, Duration::from_secs(1), Duration::from_secs(3)),
            Err(SimulationError::Scheduling(SchedulingError::InPast { .. }))
        ));
    }
}
