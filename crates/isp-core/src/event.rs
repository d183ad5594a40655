//! Camera events and observer registration.

use bytes::Bytes;

use crate::command::ResponseStatus;
use crate::types::{BufferId, CameraId, ChannelId, StreamKind};

/// Notification delivered to a registered per-camera observer.
///
/// Per-frame failures arrive as `FrameDone` with a non-success status; they
/// degrade a single frame, never the owning stream.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    /// Firmware finished consuming a buffer.
    FrameDone {
        camera: CameraId,
        stream: StreamKind,
        buffer: BufferId,
        status: ResponseStatus,
    },
    /// Firmware produced per-frame metadata.
    FrameInfo {
        camera: CameraId,
        stream: StreamKind,
        payload: Bytes,
    },
    /// Firmware raised an asynchronous error.
    Error { camera: CameraId, code: u32 },
    /// Periodic liveness signal from the firmware.
    Heartbeat { channel: ChannelId },
}

impl CameraEvent {
    /// The camera the event belongs to, if it is camera-scoped.
    pub fn camera(&self) -> Option<CameraId> {
        match self {
            CameraEvent::FrameDone { camera, .. }
            | CameraEvent::FrameInfo { camera, .. }
            | CameraEvent::Error { camera, .. } => Some(*camera),
            CameraEvent::Heartbeat { .. } => None,
        }
    }
}

/// Callback receiving frame-done, frame-info, and error notifications.
///
/// Observers are invoked from the dispatch workers; implementations must not
/// block.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &CameraEvent);
}

/// Returned by observer registration; used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(pub u64);
