//! Simulated ISP firmware transport.
//!
//! [`MockTransport`] stands in for real mailbox/doorbell hardware so the
//! pipeline can be exercised without a device. It records every transmitted
//! packet and power transition, auto-answers commands after a configurable
//! latency, generates frame-done events for submitted buffers, and supports
//! targeted fault injection:
//!
//! - per-opcode firmware failure statuses (the command is acknowledged with
//!   a non-success status)
//! - per-opcode transmit failures (the command never reaches "firmware")
//! - per-opcode response drops (for exercising timeouts)
//! - seeded random hardware faults at a configurable rate
//!
//! Tests that need exact control can disable auto-response and use
//! [`MockTransport::inject_response`] directly.

mod behavior;
mod transport;

pub use behavior::MockBehavior;
pub use transport::MockTransport;
