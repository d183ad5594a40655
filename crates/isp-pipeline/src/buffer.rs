//! Host buffer mapping across the firmware boundary.

use isp_core::{
    BufferId, CameraId, Geometry, HostBuffer, IspError, IspResult, PixelFormat, Plane, StreamKind,
};

/// A caller-supplied buffer split into device-addressable planes.
///
/// Exactly one `MappedBuffer` exists per outstanding buffer, and it lives in
/// exactly one place at a time: a stream's in-firmware list, its free list,
/// or a sensor's capture list. Dropping it releases the mapping. The handle
/// is a private copy, so the caller freeing its own copy of the handle after
/// submission is harmless.
#[derive(Debug)]
pub struct MappedBuffer {
    id: BufferId,
    handle: HostBuffer,
    camera: CameraId,
    stream: StreamKind,
    planes: Vec<Plane>,
}

impl MappedBuffer {
    /// Validate `handle` against the plane layout of `format` over
    /// `geometry` and split it into planes.
    ///
    /// The firmware sees the host physical addresses directly (the ISP sits
    /// behind the same IOMMU-less bus), so device addresses equal host
    /// addresses here.
    pub fn map(
        id: BufferId,
        handle: HostBuffer,
        camera: CameraId,
        stream: StreamKind,
        format: PixelFormat,
        geometry: &Geometry,
    ) -> IspResult<Self> {
        let layout = format.plane_layout(geometry)?;
        let needed = layout.total_size();
        if handle.len < needed {
            return Err(IspError::InvalidArgument(format!(
                "buffer of {} bytes too small for {format:?} {geometry} ({needed} needed)",
                handle.len
            )));
        }
        let planes = layout
            .planes
            .iter()
            .map(|&(offset, length)| {
                let host_addr = handle.token + offset as u64;
                Plane {
                    device_addr: host_addr,
                    host_addr,
                    length,
                }
            })
            .collect();
        Ok(MappedBuffer {
            id,
            handle,
            camera,
            stream,
            planes,
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn handle(&self) -> HostBuffer {
        self.handle
    }

    pub fn camera(&self) -> CameraId {
        self.camera
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn mapping_splits_planes_at_layout_offsets() {
        let geometry = Geometry::new(640, 480, 30);
        let handle = HostBuffer::new(0x1000_0000, 640 * 480 * 2);
        let buffer = MappedBuffer::map(
            BufferId(1),
            handle,
            CameraId(0),
            StreamKind::Preview,
            PixelFormat::Nv12,
            &geometry,
        )
        .unwrap();
        assert_eq!(buffer.planes().len(), 2);
        assert_eq!(buffer.planes()[0].host_addr, 0x1000_0000);
        assert_eq!(buffer.planes()[1].host_addr, 0x1000_0000 + 640 * 480);
    }

    #[test]
    fn undersized_buffer_rejected() {
        let geometry = Geometry::new(1920, 1080, 30);
        let handle = HostBuffer::new(0x2000, 1024);
        let err = MappedBuffer::map(
            BufferId(2),
            handle,
            CameraId(0),
            StreamKind::Video,
            PixelFormat::Yuv420p,
            &geometry,
        )
        .unwrap_err();
        assert!(matches!(err, IspError::InvalidArgument(_)));
    }
}
