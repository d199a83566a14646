//! TCP for tcpsim.
//!
//! A deterministic, byte-counting TCP: three-way handshake, cumulative
//! ACKs, RFC 6298 retransmission timer, fast retransmit with NewReno
//! recovery and graceful close. Payload bytes are virtual; segments carry
//! lengths only.
//!
//! # Architecture
//!
//! - [`TcpConnection`]: one connection's state machine
//! - [`TcpStack`]: per-node demultiplexer implementing
//!   [`StateMachine`](tcpsim_core::StateMachine)
//! - [`CongestionControl`]: pluggable window strategy, chosen per
//!   connection from [`CongestionAlgorithm`]
//!
//! All outputs are [`Action`](tcpsim_core::Action)s; the stack never
//! touches devices or the clock.

mod config;
mod congestion;
mod connection;
mod error;
mod reassembly;
mod rtt;
mod seq;
mod stack;

pub use config::TcpConfig;
pub use congestion::{
    Aimd, CongestionAlgorithm, CongestionControl, CongestionWindow, LossSignal,
    ParseAlgorithmError, Reno, Tahoe, Window,
};
pub use connection::{ConnectionStats, SentSegment, TcpConnection, TcpState};
pub use error::TcpError;
pub use rtt::RttEstimator;
pub use stack::{ClosedConnection, StackInput, StackStats, TcpStack, EPHEMERAL_PORT_START};
