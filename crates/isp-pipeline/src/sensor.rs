//! Per-camera state: streams, calibration, 3A session status.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use isp_core::{CameraId, StreamKind};

use crate::buffer::MappedBuffer;
use crate::stream::Stream;

/// Sensor-level lifecycle, layered above the per-stream states.
///
/// A sensor only reaches `Started` once its power domain is up and the
/// initial 3A burst (exposure, white balance, region of interest) has been
/// issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    NotStart,
    Starting,
    Started,
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SensorState::NotStart => "NotStart",
            SensorState::Starting => "Starting",
            SensorState::Started => "Started",
        };
        f.write_str(label)
    }
}

/// All state for one physical or virtual camera slot.
///
/// The virtual slot is a loopback: its buffers originate from the host, so
/// it has no sensor power domain and never needs the 3A burst.
pub struct SensorContext {
    pub camera: CameraId,
    pub is_virtual: bool,
    pub open: bool,
    pub state: SensorState,
    /// Calibration index sent with the next sensor-open, if any.
    pub calibration: Option<u16>,
    /// Whether the initial 3A burst has been issued this session.
    pub three_a_done: bool,
    streams: HashMap<StreamKind, Stream>,
    /// One-shot capture buffers awaiting their frame-done, oldest first.
    pub captures_in_flight: VecDeque<MappedBuffer>,
}

impl SensorContext {
    pub fn new(camera: CameraId, is_virtual: bool) -> Self {
        let streams = StreamKind::ALL
            .into_iter()
            .map(|kind| (kind, Stream::new(kind)))
            .collect();
        SensorContext {
            camera,
            is_virtual,
            open: false,
            state: SensorState::NotStart,
            calibration: None,
            three_a_done: false,
            streams,
            captures_in_flight: VecDeque::new(),
        }
    }

    pub fn stream(&self, kind: StreamKind) -> &Stream {
        // Every kind is inserted at construction.
        &self.streams[&kind]
    }

    pub fn stream_mut(&mut self, kind: StreamKind) -> &mut Stream {
        self.streams
            .entry(kind)
            .or_insert_with(|| Stream::new(kind))
    }

    /// Streams currently `Starting` or `Started`, excluding `except`.
    pub fn active_streams_except(&self, except: StreamKind) -> usize {
        self.streams
            .values()
            .filter(|s| s.kind != except && s.is_active())
            .count()
    }

    pub fn any_stream_active(&self) -> bool {
        self.streams.values().any(Stream::is_active)
    }

    pub fn outstanding_captures(&self) -> usize {
        self.captures_in_flight.len()
    }

    /// Drop every buffer the sensor owns and reset all streams. Teardown
    /// only.
    pub fn release_all(&mut self) {
        for stream in self.streams.values_mut() {
            stream.release_all();
        }
        self.captures_in_flight.clear();
        self.state = SensorState::NotStart;
        self.three_a_done = false;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::stream::StreamState;

    #[test]
    fn every_stream_kind_exists() {
        let sensor = SensorContext::new(CameraId(0), false);
        for kind in StreamKind::ALL {
            assert_eq!(sensor.stream(kind).kind, kind);
        }
    }

    #[test]
    fn active_stream_counting_excludes_the_named_kind() {
        let mut sensor = SensorContext::new(CameraId(0), false);
        sensor.stream_mut(StreamKind::Preview).state = StreamState::Started;
        sensor.stream_mut(StreamKind::Video).state = StreamState::Starting;

        assert_eq!(sensor.active_streams_except(StreamKind::Preview), 1);
        assert_eq!(sensor.active_streams_except(StreamKind::Raw), 2);
        assert!(sensor.any_stream_active());
    }
}
