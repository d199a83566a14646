//! Core types for tcpsim.
//!
//! Shared by every layer of the simulator: identifiers for nodes, devices,
//! channels and flows, link data rates, and the packet representation with
//! its PPP/IPv4/TCP wire encoding.

mod data_rate;
mod identifiers;
mod packet;

pub use data_rate::{DataRate, ParseDataRateError};
pub use identifiers::{AppId, ChannelId, DeviceId, FlowId, NodeId, PacketUid};
pub use packet::{
    decode_frame, internet_checksum, FrameError, Ipv4Header, Packet, PacketError, TcpFlags,
    TcpSegment, DEFAULT_TTL, HEADER_OVERHEAD, IPV4_HEADER_LEN, IP_PROTOCOL_TCP,
    MAX_SEGMENT_PAYLOAD, PPP_HEADER_LEN, PPP_PROTOCOL_IPV4, TCP_HEADER_LEN,
};
