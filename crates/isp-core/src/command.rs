//! Firmware command and response envelope types.

use std::fmt;

use bytes::Bytes;

use crate::types::ChannelId;

/// Every request the host can issue and every event the firmware can raise.
///
/// Host-issued opcodes always produce exactly one response tagged with the
/// request's sequence number. Event opcodes are unsolicited: the firmware
/// raises them with sequence 0 and they are routed to the event path instead
/// of the pending-command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandOpcode {
    // Lifecycle
    SensorOpen,
    SensorClose,
    StreamOn,
    StreamOff,
    BufferAvailable,
    // 3A and control
    SetExposure,
    SetFocus,
    SetWhiteBalance,
    SetRegionOfInterest,
    SetFlash,
    SetSceneMode,
    QueryCapabilities,
    // Firmware events
    FrameDone,
    FrameInfo,
    FirmwareError,
    Heartbeat,
}

impl CommandOpcode {
    pub fn wire_code(&self) -> u16 {
        match self {
            CommandOpcode::SensorOpen => 0x0001,
            CommandOpcode::SensorClose => 0x0002,
            CommandOpcode::StreamOn => 0x0010,
            CommandOpcode::StreamOff => 0x0011,
            CommandOpcode::BufferAvailable => 0x0012,
            CommandOpcode::SetExposure => 0x0020,
            CommandOpcode::SetFocus => 0x0021,
            CommandOpcode::SetWhiteBalance => 0x0022,
            CommandOpcode::SetRegionOfInterest => 0x0023,
            CommandOpcode::SetFlash => 0x0024,
            CommandOpcode::SetSceneMode => 0x0025,
            CommandOpcode::QueryCapabilities => 0x0030,
            CommandOpcode::FrameDone => 0x0100,
            CommandOpcode::FrameInfo => 0x0101,
            CommandOpcode::FirmwareError => 0x0102,
            CommandOpcode::Heartbeat => 0x0103,
        }
    }

    /// True for unsolicited firmware notifications.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            CommandOpcode::FrameDone
                | CommandOpcode::FrameInfo
                | CommandOpcode::FirmwareError
                | CommandOpcode::Heartbeat
        )
    }
}

impl fmt::Display for CommandOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Completion status reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Ok,
    Busy,
    InvalidParam,
    HardwareFault,
    Unknown(u16),
}

impl ResponseStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }

    pub fn wire_code(&self) -> u16 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::Busy => 1,
            ResponseStatus::InvalidParam => 2,
            ResponseStatus::HardwareFault => 3,
            ResponseStatus::Unknown(code) => *code,
        }
    }

    pub fn from_wire_code(code: u16) -> ResponseStatus {
        match code {
            0 => ResponseStatus::Ok,
            1 => ResponseStatus::Busy,
            2 => ResponseStatus::InvalidParam,
            3 => ResponseStatus::HardwareFault,
            other => ResponseStatus::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Ok => f.write_str("ok"),
            ResponseStatus::Busy => f.write_str("busy"),
            ResponseStatus::InvalidParam => f.write_str("invalid_param"),
            ResponseStatus::HardwareFault => f.write_str("hardware_fault"),
            ResponseStatus::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// One outbound request, ready for the transport.
#[derive(Debug, Clone)]
pub struct CommandPacket {
    pub sequence: u32,
    pub opcode: CommandOpcode,
    pub channel: ChannelId,
    pub payload: Bytes,
}

/// One inbound firmware response or event.
#[derive(Debug, Clone)]
pub struct Response {
    pub sequence: u32,
    pub opcode: CommandOpcode,
    pub channel: ChannelId,
    pub status: ResponseStatus,
    pub payload: Bytes,
}

impl Response {
    /// Successful response envelope with an empty payload.
    pub fn ok(sequence: u32, opcode: CommandOpcode, channel: ChannelId) -> Self {
        Response {
            sequence,
            opcode,
            channel,
            status: ResponseStatus::Ok,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_status(mut self, status: ResponseStatus) -> Self {
        self.status = status;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn event_opcodes_are_classified() {
        assert!(CommandOpcode::FrameDone.is_event());
        assert!(CommandOpcode::Heartbeat.is_event());
        assert!(!CommandOpcode::StreamOn.is_event());
        assert!(!CommandOpcode::BufferAvailable.is_event());
    }

    #[test]
    fn status_wire_round_trip() {
        for status in [
            ResponseStatus::Ok,
            ResponseStatus::Busy,
            ResponseStatus::InvalidParam,
            ResponseStatus::HardwareFault,
            ResponseStatus::Unknown(77),
        ] {
            assert_eq!(ResponseStatus::from_wire_code(status.wire_code()), status);
        }
    }
}
