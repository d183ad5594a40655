//! Payload codecs for the firmware mailbox format.
//!
//! All fields are little-endian. Encoders build the payload a host command
//! carries; decoders parse the payloads of firmware events. Truncated event
//! payloads decode to `InvalidArgument` and are dropped by the caller rather
//! than crashing the dispatcher.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::controls::{FlashMode, FocusMode, RegionOfInterest, SceneMode, WhiteBalanceMode};
use crate::error::{IspError, IspResult};
use crate::types::{BufferId, CameraId, Geometry, PixelFormat, Plane, StreamKind};

/// Calibration index wire value meaning "no calibration selected".
pub const CALIBRATION_NONE: u16 = 0xFFFF;

pub fn encode_sensor_open(camera: CameraId, calibration: Option<u16>) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(camera.value());
    buf.put_u16_le(calibration.unwrap_or(CALIBRATION_NONE));
    buf.freeze()
}

pub fn encode_sensor_close(camera: CameraId) -> Bytes {
    let mut buf = BytesMut::with_capacity(1);
    buf.put_u8(camera.value());
    buf.freeze()
}

pub fn encode_stream_on(
    camera: CameraId,
    stream: StreamKind,
    format: PixelFormat,
    geometry: &Geometry,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(19);
    buf.put_u8(camera.value());
    buf.put_u8(stream.wire_code());
    buf.put_u8(format.wire_code());
    buf.put_u32_le(geometry.width);
    buf.put_u32_le(geometry.height);
    buf.put_u32_le(geometry.fps);
    buf.put_u32_le(geometry.pitch);
    buf.freeze()
}

pub fn encode_stream_off(camera: CameraId, stream: StreamKind) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u8(camera.value());
    buf.put_u8(stream.wire_code());
    buf.freeze()
}

pub fn encode_buffer_available(
    camera: CameraId,
    stream: StreamKind,
    buffer: BufferId,
    planes: &[Plane],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(11 + planes.len() * 24);
    buf.put_u8(camera.value());
    buf.put_u8(stream.wire_code());
    buf.put_u64_le(buffer.0);
    buf.put_u8(planes.len() as u8);
    for plane in planes {
        buf.put_u64_le(plane.device_addr);
        buf.put_u64_le(plane.host_addr);
        buf.put_u64_le(plane.length as u64);
    }
    buf.freeze()
}

pub fn encode_set_exposure(camera: CameraId, exposure_us: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u8(camera.value());
    buf.put_u64_le(exposure_us);
    buf.freeze()
}

pub fn encode_set_focus(camera: CameraId, mode: FocusMode, position: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(camera.value());
    buf.put_u8(mode.wire_code());
    buf.put_u32_le(position);
    buf.freeze()
}

pub fn encode_set_white_balance(
    camera: CameraId,
    mode: WhiteBalanceMode,
    temperature_k: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u8(camera.value());
    buf.put_u8(mode.wire_code());
    buf.put_u32_le(temperature_k);
    buf.freeze()
}

pub fn encode_set_roi(camera: CameraId, roi: &RegionOfInterest) -> Bytes {
    let mut buf = BytesMut::with_capacity(17);
    buf.put_u8(camera.value());
    buf.put_u32_le(roi.x);
    buf.put_u32_le(roi.y);
    buf.put_u32_le(roi.width);
    buf.put_u32_le(roi.height);
    buf.freeze()
}

pub fn encode_set_flash(camera: CameraId, mode: FlashMode) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u8(camera.value());
    buf.put_u8(mode.wire_code());
    buf.freeze()
}

pub fn encode_query_capabilities(camera: CameraId) -> Bytes {
    let mut buf = BytesMut::with_capacity(1);
    buf.put_u8(camera.value());
    buf.freeze()
}

pub fn encode_set_scene_mode(camera: CameraId, mode: SceneMode) -> Bytes {
    let mut buf = BytesMut::with_capacity(2);
    buf.put_u8(camera.value());
    buf.put_u8(mode.wire_code());
    buf.freeze()
}

/// Decoded `BufferAvailable` command payload.
#[derive(Debug, Clone)]
pub struct BufferAvailablePayload {
    pub camera: CameraId,
    pub stream: StreamKind,
    pub buffer: BufferId,
    pub planes: Vec<Plane>,
}

pub fn decode_buffer_available(payload: &Bytes) -> IspResult<BufferAvailablePayload> {
    let mut buf = payload.clone();
    if buf.remaining() < 11 {
        return Err(truncated("buffer-available", payload.len()));
    }
    let camera = CameraId::new(buf.get_u8());
    let stream = decode_stream_kind(buf.get_u8())?;
    let buffer = BufferId(buf.get_u64_le());
    let plane_count = buf.get_u8() as usize;
    if buf.remaining() < plane_count * 24 {
        return Err(truncated("buffer-available planes", payload.len()));
    }
    let mut planes = Vec::with_capacity(plane_count);
    for _ in 0..plane_count {
        planes.push(Plane {
            device_addr: buf.get_u64_le(),
            host_addr: buf.get_u64_le(),
            length: buf.get_u64_le() as usize,
        });
    }
    Ok(BufferAvailablePayload {
        camera,
        stream,
        buffer,
        planes,
    })
}

/// Encode a `FrameDone` event payload (used by transports reporting frames).
pub fn encode_frame_done(
    camera: CameraId,
    stream: StreamKind,
    buffer: BufferId,
    frame_number: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(14);
    buf.put_u8(camera.value());
    buf.put_u8(stream.wire_code());
    buf.put_u64_le(buffer.0);
    buf.put_u32_le(frame_number);
    buf.freeze()
}

/// Encode a `FirmwareError` event payload.
pub fn encode_firmware_error(camera: CameraId, code: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(camera.value());
    buf.put_u32_le(code);
    buf.freeze()
}

/// Decoded `FrameDone` event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDonePayload {
    pub camera: CameraId,
    pub stream: StreamKind,
    pub buffer: BufferId,
    pub frame_number: u32,
}

pub fn decode_frame_done(payload: &Bytes) -> IspResult<FrameDonePayload> {
    let mut buf = payload.clone();
    if buf.remaining() < 14 {
        return Err(truncated("frame-done", payload.len()));
    }
    let camera = CameraId::new(buf.get_u8());
    let stream = decode_stream_kind(buf.get_u8())?;
    let buffer = BufferId(buf.get_u64_le());
    let frame_number = buf.get_u32_le();
    Ok(FrameDonePayload {
        camera,
        stream,
        buffer,
        frame_number,
    })
}

/// Decoded `FrameInfo` event payload. The metadata bytes are passed through
/// to the observer untouched.
#[derive(Debug, Clone)]
pub struct FrameInfoPayload {
    pub camera: CameraId,
    pub stream: StreamKind,
    pub metadata: Bytes,
}

pub fn decode_frame_info(payload: &Bytes) -> IspResult<FrameInfoPayload> {
    let mut buf = payload.clone();
    if buf.remaining() < 2 {
        return Err(truncated("frame-info", payload.len()));
    }
    let camera = CameraId::new(buf.get_u8());
    let stream = decode_stream_kind(buf.get_u8())?;
    Ok(FrameInfoPayload {
        camera,
        stream,
        metadata: buf.copy_to_bytes(buf.remaining()),
    })
}

/// Decoded `FirmwareError` event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareErrorPayload {
    pub camera: CameraId,
    pub code: u32,
}

pub fn decode_firmware_error(payload: &Bytes) -> IspResult<FirmwareErrorPayload> {
    let mut buf = payload.clone();
    if buf.remaining() < 5 {
        return Err(truncated("firmware-error", payload.len()));
    }
    let camera = CameraId::new(buf.get_u8());
    let code = buf.get_u32_le();
    Ok(FirmwareErrorPayload { camera, code })
}

fn decode_stream_kind(code: u8) -> IspResult<StreamKind> {
    StreamKind::from_wire_code(code)
        .ok_or_else(|| IspError::InvalidArgument(format!("unknown stream kind code {code}")))
}

fn truncated(what: &str, len: usize) -> IspError {
    IspError::InvalidArgument(format!("truncated {what} payload ({len} bytes)"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn frame_done_round_trip() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        buf.put_u8(StreamKind::Video.wire_code());
        buf.put_u64_le(99);
        buf.put_u32_le(1234);
        let decoded = decode_frame_done(&buf.freeze()).unwrap();
        assert_eq!(decoded.camera, CameraId::new(2));
        assert_eq!(decoded.stream, StreamKind::Video);
        assert_eq!(decoded.buffer, BufferId(99));
        assert_eq!(decoded.frame_number, 1234);
    }

    #[test]
    fn truncated_frame_done_rejected() {
        let payload = Bytes::from_static(&[1, 2, 3]);
        assert!(decode_frame_done(&payload).is_err());
    }

    #[test]
    fn buffer_available_round_trip() {
        let planes = vec![Plane {
            device_addr: 0x4000,
            host_addr: 0x5000,
            length: 1024,
        }];
        let payload = encode_buffer_available(
            CameraId::new(1),
            StreamKind::Raw,
            BufferId(42),
            &planes,
        );
        let decoded = decode_buffer_available(&payload).unwrap();
        assert_eq!(decoded.camera, CameraId::new(1));
        assert_eq!(decoded.stream, StreamKind::Raw);
        assert_eq!(decoded.buffer, BufferId(42));
        assert_eq!(decoded.planes, planes);
    }

    #[test]
    fn frame_done_encode_decode_round_trip() {
        let payload = encode_frame_done(CameraId::new(3), StreamKind::Preview, BufferId(8), 17);
        let decoded = decode_frame_done(&payload).unwrap();
        assert_eq!(decoded.frame_number, 17);
        assert_eq!(decoded.buffer, BufferId(8));
    }

    #[test]
    fn buffer_available_length_tracks_planes() {
        let planes = [
            Plane {
                device_addr: 0x1000,
                host_addr: 0x2000,
                length: 4096,
            },
            Plane {
                device_addr: 0x2000,
                host_addr: 0x3000,
                length: 2048,
            },
        ];
        let payload = encode_buffer_available(
            CameraId::new(0),
            StreamKind::Preview,
            BufferId(5),
            &planes,
        );
        assert_eq!(payload.len(), 11 + 2 * 24);
    }

    #[test]
    fn frame_info_passes_metadata_through() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u8(StreamKind::Metadata.wire_code());
        buf.put_slice(b"exif");
        let decoded = decode_frame_info(&buf.freeze()).unwrap();
        assert_eq!(&decoded.metadata[..], b"exif");
    }
}
