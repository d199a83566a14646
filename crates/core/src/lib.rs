//! Core types for tcpsim: events, actions, timers and the `StateMachine` trait.
//!
//! Events flow into the runner from the scheduler; protocol state machines
//! answer with actions; the runner turns actions back into scheduled events.

mod action;
mod event;
mod timer;
mod traits;

pub use action::{Action, RetransmitKind};
pub use event::{Event, EventPriority};
pub use timer::TimerId;
pub use traits::StateMachine;
