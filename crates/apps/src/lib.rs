//! Applications for tcpsim.
//!
//! - [`TrafficGenerator`]: lazy schedule of application writes
//! - [`OnOffSender`]: writes a generator's schedule into one TCP connection
//! - [`PacketSink`]: counts bytes delivered on a listening port
//!
//! Applications never call into the TCP stack; the runner drives them.

mod generator;
mod sender;
mod sink;

pub use generator::{GeneratorError, SendRequest, TrafficGenerator, TrafficPattern};
pub use sender::{OnOffSender, SenderState, SenderStats};
pub use sink::PacketSink;
