//! Command queue and response dispatch for the ISP firmware protocol.
//!
//! Outbound requests are serialized through [`CommandQueue`], which allocates
//! monotonically increasing sequence numbers, tracks in-flight commands in a
//! pending table, and transmits through the [`isp_core::IspTransport`]
//! capability. Inbound responses arrive through a [`ResponseInlet`] (handed
//! to the transport at wiring time) and are drained by one worker task per
//! logical channel owned by [`Dispatcher`].
//!
//! Correlation is by sequence number only; the queue guarantees that each
//! pending command is completed at most once, that late responses after a
//! timeout are logged and dropped, and that a teardown [`CommandQueue::drain`]
//! wakes every stranded waiter.

mod dispatcher;
mod queue;

pub use dispatcher::{DiscardEvents, Dispatcher, EventRoute, ResponseInlet};
pub use queue::{CommandQueue, DrainedCommand};
