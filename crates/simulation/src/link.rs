//! Point-to-point links and their network devices.
//!
//! A channel joins exactly two devices. Each device serializes one packet
//! at a time at its data rate; packets offered while it is busy wait in a
//! drop-tail queue. A packet reaches the peer device `tx_time + delay`
//! after its transmission starts.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;
use tcpsim_types::{ChannelId, DataRate, DeviceId, Packet};

/// Default transmit queue depth, in packets.
pub const DEFAULT_QUEUE_SIZE: usize = 100;

/// Parameters of a point-to-point link, applied to both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub data_rate: DataRate,
    pub delay: Duration,
    /// Transmit queue depth per device; `None` means unbounded.
    pub queue_size: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            data_rate: DataRate::from_mbps(5),
            delay: Duration::from_millis(2),
            queue_size: Some(DEFAULT_QUEUE_SIZE),
        }
    }
}

impl LinkConfig {
    pub fn with_data_rate(mut self, data_rate: DataRate) -> Self {
        self.data_rate = data_rate;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_queue_size(mut self, queue_size: Option<usize>) -> Self {
        self.queue_size = queue_size;
        self
    }
}

/// FIFO transmit queue that drops arrivals when full.
#[derive(Debug, Clone)]
pub struct DropTailQueue {
    packets: VecDeque<Packet>,
    limit: Option<usize>,
}

impl DropTailQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            packets: VecDeque::new(),
            limit,
        }
    }

    /// Append a packet, handing it back if the queue is full.
    pub fn enqueue(&mut self, packet: Packet) -> Result<usize, Packet> {
        if self.limit.is_some_and(|limit| self.packets.len() >= limit) {
            return Err(packet);
        }
        self.packets.push_back(packet);
        Ok(self.packets.len())
    }

    pub fn dequeue(&mut self) -> Option<Packet> {
        self.packets.pop_front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

/// Per-device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    /// Packets dropped because the transmit queue was full.
    pub queue_drops: u64,
    /// Largest queue depth seen.
    pub max_queue_depth: usize,
}

/// What happened to a packet offered to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// The device was idle; the packet reaches the peer at `arrival_at`.
    Started { arrival_at: Duration },
    /// The device was busy; the packet waits at position `depth`.
    Queued { depth: usize },
    /// The queue was full.
    Dropped,
}

/// Result of [`NetDevice::offer`].
#[derive(Debug)]
pub(crate) enum Offer {
    /// Idle device: start transmitting this packet now.
    Start(Packet),
    Queued(usize),
    Dropped(Packet),
}

/// One end of a point-to-point channel.
#[derive(Debug, Clone)]
pub struct NetDevice {
    id: DeviceId,
    channel: ChannelId,
    data_rate: DataRate,
    address: Option<(Ipv4Addr, u8)>,
    busy: bool,
    queue: DropTailQueue,
    stats: DeviceStats,
}

impl NetDevice {
    pub(crate) fn new(id: DeviceId, channel: ChannelId, config: &LinkConfig) -> Self {
        Self {
            id,
            channel,
            data_rate: config.data_rate,
            address: None,
            busy: false,
            queue: DropTailQueue::new(config.queue_size),
            stats: DeviceStats::default(),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn data_rate(&self) -> DataRate {
        self.data_rate
    }

    /// Assigned address and prefix length.
    pub fn address(&self) -> Option<(Ipv4Addr, u8)> {
        self.address
    }

    pub(crate) fn set_address(&mut self, addr: Ipv4Addr, prefix_len: u8) {
        self.address = Some((addr, prefix_len));
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    /// Offer a packet for transmission.
    pub(crate) fn offer(&mut self, packet: Packet) -> Offer {
        if !self.busy {
            return Offer::Start(packet);
        }
        match self.queue.enqueue(packet) {
            Ok(depth) => {
                self.stats.max_queue_depth = self.stats.max_queue_depth.max(depth);
                Offer::Queued(depth)
            }
            Err(packet) => {
                self.stats.queue_drops += 1;
                Offer::Dropped(packet)
            }
        }
    }

    /// Mark the device busy with `packet`. Returns its serialization time.
    pub(crate) fn begin(&mut self, packet: &Packet) -> Duration {
        self.busy = true;
        self.stats.tx_packets += 1;
        self.stats.tx_bytes += packet.size();
        self.data_rate.tx_time(packet.size())
    }

    /// Current transmission finished. Returns the next queued packet, which
    /// the caller must [`begin`](Self::begin).
    pub(crate) fn complete(&mut self) -> Option<Packet> {
        self.busy = false;
        self.queue.dequeue()
    }

    pub(crate) fn record_rx(&mut self, packet: &Packet) {
        self.stats.rx_packets += 1;
        self.stats.rx_bytes += packet.size();
    }
}

/// A full-duplex wire between two devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointToPointChannel {
    id: ChannelId,
    ends: [DeviceId; 2],
    delay: Duration,
}

impl PointToPointChannel {
    pub(crate) fn new(id: ChannelId, a: DeviceId, b: DeviceId, delay: Duration) -> Self {
        Self {
            id,
            ends: [a, b],
            delay,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn ends(&self) -> [DeviceId; 2] {
        self.ends
    }

    /// Propagation delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The device at the other end from `device`.
    pub fn peer(&self, device: DeviceId) -> Option<DeviceId> {
        match self.ends {
            [a, b] if a == device => Some(b),
            [a, b] if b == device => Some(a),
            _ => None,
        }
    }
}
