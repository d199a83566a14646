//! The protocol state machine seam.

use crate::Action;
use std::time::Duration;

/// Protocol logic driven by the simulation runner.
///
/// Implementors never touch devices, queues or the clock directly: each
/// input is answered with a list of [`Action`]s (segments to send, timers
/// to set, bytes to deliver) which the runner carries out before the next
/// event is looked at. Identical state plus identical input must yield
/// identical actions.
///
/// # Example
///
/// ```ignore
/// let mut stack = TcpStack::new(NodeId(0), TcpConfig::default(), seed);
/// stack.set_time(Duration::from_millis(5));
/// for action in stack.handle(StackInput::Timer(timer)) {
///     runner.execute(action);
/// }
/// ```
pub trait StateMachine {
    /// What the runner feeds in: arriving segments, expired timers.
    type Input;

    /// React to one input.
    fn handle(&mut self, input: Self::Input) -> Vec<Action>;

    /// Simulated time at which the next `handle` call happens. The runner
    /// sets it before every call.
    fn set_time(&mut self, now: Duration);

    fn now(&self) -> Duration;
}
