//! Camera, stream, buffer, and power lifecycle management.
//!
//! [`IspDevice`] is the application-facing root: open/close cameras,
//! configure and start/stop streams, feed buffers across the firmware
//! boundary, issue 3A controls, and observe frame events. It sits on top of
//! the dispatch layer (`isp-dispatch`) and drives whatever [`IspTransport`]
//! implementation it is constructed with.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use isp_core::{CameraId, Geometry, HostBuffer, IspConfig, PixelFormat, StreamKind};
//! use isp_pipeline::IspDevice;
//! use isp_transport_mock::MockTransport;
//!
//! # async fn demo() -> isp_core::IspResult<()> {
//! let device = IspDevice::new(MockTransport::new(), IspConfig::default())?;
//! let camera = CameraId::new(0);
//! device.open_camera(camera).await?;
//! device
//!     .configure_stream(
//!         camera,
//!         StreamKind::Preview,
//!         PixelFormat::Nv12,
//!         Geometry::new(1920, 1080, 30),
//!     )
//!     .await?;
//! device.start_stream(camera, StreamKind::Preview).await?;
//! device
//!     .submit_buffer(camera, StreamKind::Preview, HostBuffer::new(0x1000_0000, 4 << 20))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`IspTransport`]: isp_core::IspTransport

pub mod buffer;
pub mod device;
pub mod power;
pub mod sensor;
pub mod stream;

pub use buffer::MappedBuffer;
pub use device::{IspDevice, ResolutionChange, StreamStatus};
pub use power::PowerManager;
pub use sensor::{SensorContext, SensorState};
pub use stream::{Stream, StreamState};
