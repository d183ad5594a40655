//! Per (camera, stream-kind) lifecycle state machine and buffer lists.

use std::collections::VecDeque;
use std::fmt;

use tracing::warn;

use isp_core::{BufferId, Geometry, HostBuffer, PixelFormat, StreamKind};

use crate::buffer::MappedBuffer;

/// Lifecycle state of one stream.
///
/// `StartFail` is terminal for the start attempt: the caller must stop the
/// stream (returning it to `NotStart`) before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStart,
    Starting,
    Started,
    Stopping,
    StartFail,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamState::NotStart => "NotStart",
            StreamState::Starting => "Starting",
            StreamState::Started => "Started",
            StreamState::Stopping => "Stopping",
            StreamState::StartFail => "StartFail",
        };
        f.write_str(label)
    }
}

/// One output pipeline of one camera.
///
/// Buffer ownership rule: every mapped buffer the stream owns is in exactly
/// one of `in_firmware` (held by firmware, FIFO) or `free` (returned, ready
/// to resubmit). Handles staged before the stream reaches `Started` are kept
/// unmapped because the final geometry may still change.
pub struct Stream {
    pub kind: StreamKind,
    pub state: StreamState,
    pub format: Option<PixelFormat>,
    pub geometry: Option<Geometry>,
    /// Resolution change waiting for the sibling streams to stop.
    pub pending_geometry: Option<Geometry>,
    /// Buffers held by firmware, oldest first.
    pub in_firmware: VecDeque<MappedBuffer>,
    /// Buffers returned by firmware or reclaimed at stop.
    pub free: VecDeque<MappedBuffer>,
    /// Handles supplied while `Starting`, sent once `Started` is reached.
    pub staged: Vec<(BufferId, HostBuffer)>,
    /// Whether this stream holds a power-domain reference.
    pub powered: bool,
}

impl Stream {
    pub fn new(kind: StreamKind) -> Self {
        Stream {
            kind,
            state: StreamState::NotStart,
            format: None,
            geometry: None,
            pending_geometry: None,
            in_firmware: VecDeque::new(),
            free: VecDeque::new(),
            staged: Vec::new(),
            powered: false,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, StreamState::Starting | StreamState::Started)
    }

    pub fn configured(&self) -> bool {
        self.format.is_some() && self.geometry.is_some()
    }

    /// Remove the in-firmware buffer completed by a frame-done event.
    ///
    /// Firmware consumes buffers in submission order, so the oldest entry is
    /// expected to match. An out-of-order completion is honored with a
    /// warning; an unknown id is dropped.
    pub fn take_in_firmware(&mut self, buffer: BufferId) -> Option<MappedBuffer> {
        if self.in_firmware.front().map(MappedBuffer::id) == Some(buffer) {
            return self.in_firmware.pop_front();
        }
        match self.in_firmware.iter().position(|b| b.id() == buffer) {
            Some(index) => {
                warn!(stream = %self.kind, %buffer, "out-of-order frame completion");
                self.in_firmware.remove(index)
            }
            None => {
                warn!(stream = %self.kind, %buffer, "frame completion for unknown buffer; dropped");
                None
            }
        }
    }

    /// Return to `NotStart`, reclaiming every buffer onto the free list.
    ///
    /// With `pause` set the negotiated geometry survives, so the stream can
    /// be brought straight back up (resolution change without a full
    /// teardown); otherwise geometry must be renegotiated.
    pub fn reset(&mut self, pause: bool) {
        while let Some(buffer) = self.in_firmware.pop_front() {
            self.free.push_back(buffer);
        }
        self.state = StreamState::NotStart;
        if !pause {
            self.geometry = None;
            self.pending_geometry = None;
        }
    }

    /// Drop every buffer and handle the stream owns. Teardown only; lossy
    /// for frames still in flight.
    pub fn release_all(&mut self) {
        self.in_firmware.clear();
        self.free.clear();
        self.staged.clear();
        self.state = StreamState::NotStart;
        self.format = None;
        self.geometry = None;
        self.pending_geometry = None;
        self.powered = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use isp_core::CameraId;

    fn mapped(id: u64) -> MappedBuffer {
        let geometry = Geometry::new(64, 64, 30);
        MappedBuffer::map(
            BufferId(id),
            HostBuffer::new(0x1000 * id, 64 * 64 * 2),
            CameraId(0),
            StreamKind::Preview,
            PixelFormat::Nv12,
            &geometry,
        )
        .unwrap()
    }

    #[test]
    fn completions_pop_fifo() {
        let mut stream = Stream::new(StreamKind::Preview);
        stream.in_firmware.push_back(mapped(1));
        stream.in_firmware.push_back(mapped(2));

        let first = stream.take_in_firmware(BufferId(1)).unwrap();
        assert_eq!(first.id(), BufferId(1));
        assert_eq!(stream.in_firmware.len(), 1);
    }

    #[test]
    fn out_of_order_completion_is_honored() {
        let mut stream = Stream::new(StreamKind::Preview);
        stream.in_firmware.push_back(mapped(1));
        stream.in_firmware.push_back(mapped(2));

        let second = stream.take_in_firmware(BufferId(2)).unwrap();
        assert_eq!(second.id(), BufferId(2));
        assert_eq!(stream.in_firmware.front().unwrap().id(), BufferId(1));
    }

    #[test]
    fn unknown_completion_is_dropped() {
        let mut stream = Stream::new(StreamKind::Preview);
        stream.in_firmware.push_back(mapped(1));
        assert!(stream.take_in_firmware(BufferId(9)).is_none());
        assert_eq!(stream.in_firmware.len(), 1);
    }

    #[test]
    fn reset_moves_buffers_to_free_and_clears_geometry() {
        let mut stream = Stream::new(StreamKind::Video);
        stream.geometry = Some(Geometry::new(1920, 1080, 30));
        stream.state = StreamState::Started;
        stream.in_firmware.push_back(mapped(1));

        stream.reset(false);
        assert_eq!(stream.state, StreamState::NotStart);
        assert!(stream.geometry.is_none());
        assert_eq!(stream.free.len(), 1);
        assert!(stream.in_firmware.is_empty());
    }

    #[test]
    fn paused_reset_keeps_geometry() {
        let mut stream = Stream::new(StreamKind::Video);
        let geometry = Geometry::new(1280, 720, 60);
        stream.geometry = Some(geometry);
        stream.state = StreamState::Started;

        stream.reset(true);
        assert_eq!(stream.geometry, Some(geometry));
    }
}
