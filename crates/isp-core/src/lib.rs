//! Core types and traits for rust-isp.
//!
//! This crate defines everything the dispatch and pipeline crates share:
//!
//! - Identifiers and geometry ([`CameraId`], [`ChannelId`], [`StreamKind`],
//!   [`PixelFormat`], [`Geometry`])
//! - The command/response wire types ([`CommandPacket`], [`Response`]) and
//!   payload codecs ([`wire`])
//! - The error taxonomy ([`IspError`], [`TransportError`])
//! - The hardware capability seam ([`IspTransport`], [`ResponseSink`])
//! - Camera events and observer registration ([`CameraEvent`], [`EventObserver`])
//! - TOML-backed configuration ([`IspConfig`])
//!
//! No hardware is touched here; implementations of [`IspTransport`] (real
//! firmware glue or the mock in `isp-transport-mock`) provide the actual
//! power, transmit, and doorbell primitives.

pub mod command;
pub mod config;
pub mod controls;
pub mod error;
pub mod event;
pub mod transport;
pub mod types;
pub mod wire;

pub use command::{CommandOpcode, CommandPacket, Response, ResponseStatus};
pub use config::{CapabilityRanges, IspConfig};
pub use controls::{FlashMode, FocusMode, RegionOfInterest, SceneMode, WhiteBalanceMode};
pub use error::{IspError, IspResult, TransportError, TransportErrorKind};
pub use event::{CameraEvent, EventObserver, ObserverHandle};
pub use transport::{IspTransport, PowerDomain, ResponseSink};
pub use types::{BufferId, CameraId, ChannelId, Geometry, HostBuffer, PixelFormat, Plane, PlaneLayout, StreamKind};
