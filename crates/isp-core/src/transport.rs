//! The capability seam between the pipeline core and real hardware.
//!
//! Any camera hardware abstraction that can power domains on and off,
//! transmit a queued command, and ring the firmware doorbell can drive the
//! pipeline. One implementation exists per hardware variant, selected at
//! construction time; `isp-transport-mock` provides the simulated one.

use std::fmt;

use async_trait::async_trait;

use crate::command::{CommandPacket, Response};
use crate::error::TransportError;
use crate::types::{CameraId, ChannelId};

/// A reference-counted hardware power domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerDomain {
    /// The shared ISP core.
    IspCore,
    /// The sensor transceiver/PHY block.
    Phy,
    /// One physical sensor.
    Sensor(CameraId),
}

impl fmt::Display for PowerDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerDomain::IspCore => f.write_str("isp-core"),
            PowerDomain::Phy => f.write_str("phy"),
            PowerDomain::Sensor(camera) => write!(f, "sensor/{camera}"),
        }
    }
}

/// Where the transport delivers inbound firmware responses.
///
/// The dispatcher hands the transport a sink at wiring time; delivering a
/// response through it also wakes the matching channel worker, so the sink
/// doubles as the wake notification the hardware interrupt would provide.
pub trait ResponseSink: Send + Sync {
    fn deliver(&self, response: Response);
}

/// Upward capability set consumed by the pipeline core.
#[async_trait]
pub trait IspTransport: Send + Sync {
    /// Power a hardware domain up. Assumed fast relative to command latency.
    async fn power_on(&self, domain: PowerDomain) -> Result<(), TransportError>;

    /// Power a hardware domain down.
    async fn power_off(&self, domain: PowerDomain) -> Result<(), TransportError>;

    /// Write one command into the firmware mailbox.
    async fn transmit(&self, packet: CommandPacket) -> Result<(), TransportError>;

    /// Ring the doorbell telling firmware a command is waiting on `channel`.
    fn doorbell(&self, channel: ChannelId) -> Result<(), TransportError>;

    /// Register the sink that inbound responses are delivered through.
    ///
    /// Called exactly once while the device context is being wired up,
    /// before any command is transmitted.
    fn connect(&self, sink: std::sync::Arc<dyn ResponseSink>);
}
