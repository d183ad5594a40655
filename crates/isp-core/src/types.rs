//! Identifiers, stream geometry, and pixel format plane rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IspError, IspResult};

/// Identifies one camera slot (physical sensor or the virtual/loopback slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u8);

impl CameraId {
    pub const fn new(id: u8) -> Self {
        CameraId(id)
    }

    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cam{}", self.0)
    }
}

/// A logical, independently dispatched firmware response path.
///
/// Channels are distinct from the physical transport: the firmware tags every
/// response with the channel it belongs to, and each channel gets its own
/// dispatch worker so a slow frame channel never stalls control completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    /// Synchronous control commands (open/close, stream on/off, 3A).
    pub const CONTROL: ChannelId = ChannelId(0);
    /// Streaming frame lifecycle traffic (buffer available, frame done).
    pub const FRAME: ChannelId = ChannelId(1);
    /// One-shot still captures.
    pub const CAPTURE: ChannelId = ChannelId(2);

    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// One output pipeline of a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Preview,
    Video,
    Record,
    Raw,
    ZeroShutterLag,
    Metadata,
}

impl StreamKind {
    pub const ALL: [StreamKind; 6] = [
        StreamKind::Preview,
        StreamKind::Video,
        StreamKind::Record,
        StreamKind::Raw,
        StreamKind::ZeroShutterLag,
        StreamKind::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Preview => "preview",
            StreamKind::Video => "video",
            StreamKind::Record => "record",
            StreamKind::Raw => "raw",
            StreamKind::ZeroShutterLag => "zsl",
            StreamKind::Metadata => "metadata",
        }
    }

    pub fn wire_code(&self) -> u8 {
        match self {
            StreamKind::Preview => 0,
            StreamKind::Video => 1,
            StreamKind::Record => 2,
            StreamKind::Raw => 3,
            StreamKind::ZeroShutterLag => 4,
            StreamKind::Metadata => 5,
        }
    }

    pub fn from_wire_code(code: u8) -> Option<StreamKind> {
        StreamKind::ALL.into_iter().find(|k| k.wire_code() == code)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel formats the firmware can produce.
///
/// The format decides how a host buffer is split into device-addressable
/// planes (at most three, per the firmware descriptor layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Y plane followed by interleaved UV at half vertical resolution.
    Nv12,
    /// Planar Y, U, V with chroma at quarter resolution.
    Yuv420p,
    /// Packed 10-bit Bayer, single plane.
    Raw10,
    /// Packed 12-bit Bayer, single plane.
    Raw12,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Nv12 => 2,
            PixelFormat::Yuv420p => 3,
            PixelFormat::Raw10 | PixelFormat::Raw12 => 1,
        }
    }

    pub fn wire_code(&self) -> u8 {
        match self {
            PixelFormat::Nv12 => 0,
            PixelFormat::Yuv420p => 1,
            PixelFormat::Raw10 => 2,
            PixelFormat::Raw12 => 3,
        }
    }

    /// Compute the plane layout for this format over `geometry`.
    ///
    /// Returns the offset/length of each plane relative to the start of the
    /// host buffer. Fails if the geometry is degenerate (zero dimension or a
    /// pitch narrower than a row).
    pub fn plane_layout(&self, geometry: &Geometry) -> IspResult<PlaneLayout> {
        geometry.validate()?;
        let pitch = geometry.pitch as usize;
        let height = geometry.height as usize;
        let luma = pitch * height;
        let planes = match self {
            PixelFormat::Nv12 => vec![(0, luma), (luma, luma / 2)],
            PixelFormat::Yuv420p => {
                let chroma = (pitch / 2) * (height / 2);
                vec![(0, luma), (luma, chroma), (luma + chroma, chroma)]
            }
            PixelFormat::Raw10 | PixelFormat::Raw12 => vec![(0, luma)],
        };
        Ok(PlaneLayout { planes })
    }
}

/// Negotiated stream geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bytes per row of the primary plane. Must be at least `width`.
    pub pitch: u32,
}

impl Geometry {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Geometry {
            width,
            height,
            fps,
            // Firmware requires rows padded to a 64-byte boundary.
            pitch: width.next_multiple_of(64),
        }
    }

    pub fn validate(&self) -> IspResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(IspError::InvalidArgument(format!(
                "geometry {}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.pitch < self.width {
            return Err(IspError::InvalidArgument(format!(
                "pitch {} narrower than width {}",
                self.pitch, self.width
            )));
        }
        Ok(())
    }

    /// Aspect ratio equality without floating point (cross-multiplication).
    pub fn same_aspect(&self, other: &Geometry) -> bool {
        u64::from(self.width) * u64::from(other.height)
            == u64::from(other.width) * u64::from(self.height)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// Offsets and lengths of the planes a format occupies in a host buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    /// (offset, length) pairs, at most three.
    pub planes: Vec<(usize, usize)>,
}

impl PlaneLayout {
    pub fn total_size(&self) -> usize {
        self.planes
            .iter()
            .map(|(offset, length)| offset + length)
            .max()
            .unwrap_or(0)
    }
}

/// Identifies one mapped buffer for the lifetime of its mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// A caller-supplied memory region, identified by an opaque handle token.
///
/// The core never dereferences the token; it only validates the length
/// against the negotiated plane layout and forwards derived addresses to
/// firmware. The struct is `Copy` so submission always wraps a private copy
/// of the handle, tolerating the caller freeing its own copy afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBuffer {
    /// Opaque handle token; doubles as the host base address of the region.
    pub token: u64,
    /// Length of the region in bytes.
    pub len: usize,
}

impl HostBuffer {
    pub fn new(token: u64, len: usize) -> Self {
        HostBuffer { token, len }
    }
}

/// One device-addressable plane of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    pub device_addr: u64,
    pub host_addr: u64,
    pub length: usize,
}
