//! Nodes: devices, routes, a TCP stack and applications.

use crate::error::TopologyError;
use std::net::Ipv4Addr;
use tcpsim_apps::{OnOffSender, PacketSink};
use tcpsim_tcp::TcpStack;
use tcpsim_types::{AppId, DeviceId, NodeId};

/// An application installed on a node.
#[derive(Debug, Clone)]
pub enum Application {
    Sender(OnOffSender),
    Sink(PacketSink),
}

/// Directly connected network reachable through a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub network: Ipv4Addr,
    pub prefix_len: u8,
    pub device: DeviceId,
}

impl Route {
    /// Route to the network containing `addr`.
    pub fn new(addr: Ipv4Addr, prefix_len: u8, device: DeviceId) -> Self {
        Self {
            network: mask(addr, prefix_len),
            prefix_len,
            device,
        }
    }

    pub fn matches(&self, dst: Ipv4Addr) -> bool {
        mask(dst, self.prefix_len) == self.network
    }
}

/// A host in the simulation.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    devices: Vec<DeviceId>,
    routes: Vec<Route>,
    stack: TcpStack,
    apps: Vec<Application>,
}

impl Node {
    pub(crate) fn new(id: NodeId, stack: TcpStack) -> Self {
        Self {
            id,
            devices: Vec::new(),
            routes: Vec::new(),
            stack,
            apps: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Devices in installation order.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn stack(&self) -> &TcpStack {
        &self.stack
    }

    pub(crate) fn stack_mut(&mut self) -> &mut TcpStack {
        &mut self.stack
    }

    pub fn apps(&self) -> &[Application] {
        &self.apps
    }

    pub fn app(&self, app: AppId) -> Option<&Application> {
        self.apps.get(app.0 as usize)
    }

    pub(crate) fn app_mut(&mut self, app: AppId) -> Result<&mut Application, TopologyError> {
        let node = self.id;
        self.apps
            .get_mut(app.0 as usize)
            .ok_or(TopologyError::UnknownApp { node, app })
    }

    /// Whether `addr` is assigned to this node.
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.stack.addresses().contains(&addr)
    }

    pub(crate) fn next_device(&mut self) -> DeviceId {
        let device = DeviceId::new(self.id, self.devices.len() as u32);
        self.devices.push(device);
        device
    }

    pub(crate) fn add_app(&mut self, app: Application) -> AppId {
        self.apps.push(app);
        AppId(self.apps.len() as u32 - 1)
    }

    pub(crate) fn add_route(&mut self, route: Route) {
        if !self.routes.contains(&route) {
            self.routes.push(route);
        }
    }

    /// Longest-prefix match over connected routes.
    pub fn route(&self, dst: Ipv4Addr) -> Result<DeviceId, TopologyError> {
        self.routes
            .iter()
            .filter(|r| r.matches(dst))
            .max_by_key(|r| r.prefix_len)
            .map(|r| r.device)
            .ok_or(TopologyError::NoRoute { node: self.id, dst })
    }

    /// The sink bound to `port`, if any.
    pub(crate) fn sink_mut(&mut self, port: u16) -> Option<&mut PacketSink> {
        self.apps.iter_mut().find_map(|app| match app {
            Application::Sink(sink) if sink.port() == port => Some(sink),
            _ => None,
        })
    }
}

fn mask(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(bits & mask)
}

/// Hands out host addresses from one IPv4 network, lowest first.
///
/// Skips the network and broadcast addresses.
#[derive(Debug, Clone)]
pub struct Ipv4AddressAllocator {
    network: Ipv4Addr,
    prefix_len: u8,
    next: u32,
}

impl Ipv4AddressAllocator {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self, TopologyError> {
        if !(1..=30).contains(&prefix_len) {
            return Err(TopologyError::InvalidPrefix(prefix_len));
        }
        Ok(Self {
            network: mask(network, prefix_len),
            prefix_len,
            next: 1,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn allocate(&mut self) -> Result<Ipv4Addr, TopologyError> {
        let hosts = (1u32 << (32 - self.prefix_len as u32)) - 2;
        if self.next > hosts {
            return Err(TopologyError::AddressesExhausted {
                network: self.network,
                prefix_len: self.prefix_len,
            });
        }
        let addr = Ipv4Addr::from(u32::from(self.network) + self.next);
        self.next += 1;
        Ok(addr)
    }
}
