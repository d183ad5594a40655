//! The process-wide device context.
//!
//! `IspDevice` is the single point of serialization for lifecycle
//! operations: one lock covers every open/close/start/stop transition, so a
//! caller never observes a sensor or stream mid-transition. Dispatch keeps
//! its own fine-grained lock (inside [`CommandQueue`]) so response matching
//! never waits behind a slow lifecycle operation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use isp_core::{
    wire, BufferId, CameraEvent, CameraId, CapabilityRanges, ChannelId, CommandOpcode,
    EventObserver, FlashMode, FocusMode, Geometry, HostBuffer, IspConfig, IspError, IspResult,
    IspTransport, ObserverHandle, PixelFormat, PowerDomain, RegionOfInterest, Response, SceneMode,
    StreamKind, WhiteBalanceMode,
};
use isp_dispatch::{CommandQueue, Dispatcher, EventRoute};

use crate::buffer::MappedBuffer;
use crate::power::PowerManager;
use crate::sensor::{SensorContext, SensorState};
use crate::stream::StreamState;

/// Upper bound on simultaneously outstanding commands across all channels.
const MAX_PENDING_COMMANDS: usize = 256;

/// Exposure requested by the initial 3A burst, clamped into the configured
/// range. Roughly one 30 fps frame time.
const DEFAULT_EXPOSURE_US: u64 = 33_333;

/// Point-in-time snapshot of one stream, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    pub state: StreamState,
    pub geometry: Option<Geometry>,
    pub pending_geometry: Option<Geometry>,
    pub in_firmware: usize,
    pub free: usize,
    pub staged: usize,
}

/// Outcome of [`IspDevice::change_resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionChange {
    /// The stream is running with the new geometry.
    Applied,
    /// Another stream on the same sensor is active; the new geometry was
    /// recorded and will be applied when that stream stops.
    Deferred,
}

struct Shared {
    config: IspConfig,
    queue: Arc<CommandQueue>,
    power: PowerManager,
    sensors: Mutex<Vec<SensorContext>>,
    observers: RwLock<Vec<(ObserverHandle, Option<CameraId>, Arc<dyn EventObserver>)>>,
    next_observer: AtomicU64,
    next_buffer: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn allocate_buffer_id(&self) -> BufferId {
        BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed))
    }

    fn notify(&self, event: &CameraEvent) {
        for (_, scope, observer) in self.observers.read().iter() {
            let interested = match (scope, event.camera()) {
                (None, _) => true,
                (Some(scoped), Some(camera)) => *scoped == camera,
                (Some(_), None) => false,
            };
            if interested {
                observer.on_event(event);
            }
        }
    }

    async fn send_buffer(&self, buffer: &MappedBuffer, channel: ChannelId) -> IspResult<()> {
        let payload = wire::encode_buffer_available(
            buffer.camera(),
            buffer.stream(),
            buffer.id(),
            buffer.planes(),
        );
        self.queue
            .enqueue_and_send(
                CommandOpcode::BufferAvailable,
                channel,
                payload,
                Some(buffer.id()),
            )
            .await?;
        Ok(())
    }
}

fn lookup(sensors: &[SensorContext], camera: CameraId) -> IspResult<&SensorContext> {
    sensors
        .get(camera.value() as usize)
        .ok_or(IspError::UnknownCamera(camera))
}

fn lookup_mut(sensors: &mut [SensorContext], camera: CameraId) -> IspResult<&mut SensorContext> {
    sensors
        .get_mut(camera.value() as usize)
        .ok_or(IspError::UnknownCamera(camera))
}

/// Root of the pipeline; owns the sensors, the command queue, the power
/// units, and the dispatch workers.
pub struct IspDevice {
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    idle_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl IspDevice {
    /// Construct the device, wire the transport to the dispatcher, and start
    /// the dispatch workers plus the idle-scan sweep.
    pub fn new(transport: Arc<dyn IspTransport>, config: IspConfig) -> IspResult<Arc<IspDevice>> {
        config.validate()?;
        let queue = Arc::new(CommandQueue::new(transport.clone(), MAX_PENDING_COMMANDS));

        let slots = config.camera_slots();
        let mut sensors = Vec::with_capacity(slots);
        for slot in 0..slots {
            let is_virtual = config.virtual_camera && slot == slots - 1;
            sensors.push(SensorContext::new(CameraId::new(slot as u8), is_virtual));
        }
        let physical: Vec<CameraId> = sensors
            .iter()
            .filter(|s| !s.is_virtual)
            .map(|s| s.camera)
            .collect();

        let shared = Arc::new(Shared {
            power: PowerManager::new(transport.clone(), &physical),
            queue: Arc::clone(&queue),
            sensors: Mutex::new(sensors),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            next_buffer: AtomicU64::new(1),
            running: AtomicBool::new(true),
            config,
        });

        let route = Arc::new(EventRouter {
            shared: Arc::clone(&shared),
        });
        let dispatcher = Dispatcher::new(
            queue,
            route,
            shared.config.channels,
            shared.config.poll_interval(),
        );
        transport.connect(Arc::new(dispatcher.inlet()));
        dispatcher.start();

        let device = Arc::new(IspDevice {
            shared,
            dispatcher,
            idle_task: parking_lot::Mutex::new(None),
        });
        device.spawn_idle_scan();
        info!(slots, "isp device up");
        Ok(device)
    }

    fn spawn_idle_scan(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.idle_scan_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                shared
                    .power
                    .idle_scan(shared.config.sensor_idle(), shared.config.core_idle())
                    .await;
            }
        });
        *self.idle_task.lock() = Some(handle);
    }

    fn ensure_running(&self) -> IspResult<()> {
        if self.shared.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(IspError::ShuttingDown)
        }
    }

    /// Bring a camera slot up: power domains first, then the firmware
    /// session. Fails atomically; a failed open releases everything it
    /// acquired.
    pub async fn open_camera(&self, camera: CameraId) -> IspResult<()> {
        self.ensure_running()?;
        let mut sensors = self.shared.sensors.lock().await;
        let (calibration, is_virtual) = {
            let sensor = lookup(&sensors, camera)?;
            if sensor.open {
                return Err(IspError::bad_state("sensor", "open", "already open"));
            }
            (sensor.calibration, sensor.is_virtual)
        };

        self.shared.power.acquire(PowerDomain::IspCore).await?;
        if let Err(err) = self.shared.power.acquire(PowerDomain::Phy).await {
            self.shared.power.release(PowerDomain::IspCore).await;
            return Err(err);
        }
        if !is_virtual {
            if let Err(err) = self.shared.power.acquire(PowerDomain::Sensor(camera)).await {
                self.shared.power.release(PowerDomain::Phy).await;
                self.shared.power.release(PowerDomain::IspCore).await;
                return Err(err);
            }
        }

        let opened = self
            .shared
            .queue
            .send_sync_ok(
                CommandOpcode::SensorOpen,
                ChannelId::CONTROL,
                wire::encode_sensor_open(camera, calibration),
                self.shared.config.sync_timeout(),
            )
            .await;
        if let Err(err) = opened {
            if !is_virtual {
                self.shared.power.release(PowerDomain::Sensor(camera)).await;
            }
            self.shared.power.release(PowerDomain::Phy).await;
            self.shared.power.release(PowerDomain::IspCore).await;
            return Err(err);
        }

        let sensor = lookup_mut(&mut sensors, camera)?;
        sensor.open = true;
        sensor.state = SensorState::NotStart;
        sensor.three_a_done = false;
        info!(%camera, "camera opened");
        Ok(())
    }

    /// Tear a camera slot down: stop every active stream, close the firmware
    /// session, force-release all buffers, drop the power references.
    /// Intentionally lossy for frames still in flight.
    pub async fn close_camera(&self, camera: CameraId) -> IspResult<()> {
        let mut sensors = self.shared.sensors.lock().await;
        {
            let sensor = lookup_mut(&mut sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", "close", "not open"));
            }
            // A close abandons any deferred resolution change.
            for kind in StreamKind::ALL {
                sensor.stream_mut(kind).pending_geometry = None;
            }
        }

        for kind in StreamKind::ALL {
            let active = lookup(&sensors, camera)?.stream(kind).state != StreamState::NotStart;
            if active {
                if let Err(err) = self.stop_stream_locked(&mut sensors, camera, kind, false).await
                {
                    warn!(%camera, stream = %kind, error = %err, "stop during close failed");
                }
            }
        }

        if let Err(err) = self
            .shared
            .queue
            .send_sync_ok(
                CommandOpcode::SensorClose,
                ChannelId::CONTROL,
                wire::encode_sensor_close(camera),
                self.shared.config.stop_timeout(),
            )
            .await
        {
            warn!(%camera, error = %err, "sensor close incomplete; forcing teardown");
        }

        let sensor = lookup_mut(&mut sensors, camera)?;
        let is_virtual = sensor.is_virtual;
        sensor.release_all();
        sensor.open = false;
        drop(sensors);

        if !is_virtual {
            self.shared.power.release(PowerDomain::Sensor(camera)).await;
        }
        self.shared.power.release(PowerDomain::Phy).await;
        self.shared.power.release(PowerDomain::IspCore).await;
        info!(%camera, "camera closed");
        Ok(())
    }

    /// Record a stream's format and geometry.
    ///
    /// If a start was already requested (the stream is `Starting` waiting
    /// for geometry), the arrival of the geometry completes the start.
    pub async fn configure_stream(
        &self,
        camera: CameraId,
        kind: StreamKind,
        format: PixelFormat,
        geometry: Geometry,
    ) -> IspResult<()> {
        geometry.validate()?;
        let mut sensors = self.shared.sensors.lock().await;
        let finish_start = {
            let sensor = lookup_mut(&mut sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", "configure stream", "not open"));
            }
            let stream = sensor.stream_mut(kind);
            match stream.state {
                StreamState::NotStart | StreamState::Starting => {
                    stream.format = Some(format);
                    stream.geometry = Some(geometry);
                    stream.state == StreamState::Starting
                }
                state => {
                    return Err(IspError::bad_state("stream", "configure", state));
                }
            }
        };
        if finish_start {
            debug!(%camera, stream = %kind, %geometry, "deferred start resuming");
            self.bring_up_stream(&mut sensors, camera, kind).await
        } else {
            Ok(())
        }
    }

    /// Start a stream.
    ///
    /// If the stream has no geometry yet it parks in `Starting`; the start
    /// completes when [`configure_stream`](Self::configure_stream) supplies
    /// the geometry. Buffers submitted meanwhile are staged and sent once
    /// the stream reaches `Started`.
    pub async fn start_stream(&self, camera: CameraId, kind: StreamKind) -> IspResult<()> {
        self.ensure_running()?;
        let mut sensors = self.shared.sensors.lock().await;
        let configured = {
            let sensor = lookup_mut(&mut sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", "start stream", "not open"));
            }
            let stream = sensor.stream_mut(kind);
            match stream.state {
                StreamState::NotStart => {
                    stream.state = StreamState::Starting;
                    stream.configured()
                }
                state => {
                    return Err(IspError::bad_state("stream", "start", state));
                }
            }
        };
        if configured {
            self.bring_up_stream(&mut sensors, camera, kind).await
        } else {
            debug!(%camera, stream = %kind, "start deferred until geometry arrives");
            Ok(())
        }
    }

    /// Stop a stream and reclaim its buffers onto the free list. Idempotent.
    pub async fn stop_stream(&self, camera: CameraId, kind: StreamKind) -> IspResult<()> {
        let mut sensors = self.shared.sensors.lock().await;
        self.stop_stream_locked(&mut sensors, camera, kind, false)
            .await
    }

    /// Hand a buffer to firmware for `kind`'s frame rotation.
    ///
    /// The handle is copied; the caller may free its own copy immediately.
    /// While the stream is still `Starting` the handle is staged and sent
    /// when the stream reaches `Started`.
    pub async fn submit_buffer(
        &self,
        camera: CameraId,
        kind: StreamKind,
        host: HostBuffer,
    ) -> IspResult<BufferId> {
        self.ensure_running()?;
        let mut sensors = self.shared.sensors.lock().await;
        let sensor = lookup_mut(&mut sensors, camera)?;
        if !sensor.open {
            return Err(IspError::bad_state("sensor", "submit buffer", "not open"));
        }
        let depth = self.shared.config.stream_buffer_depth;
        let id = self.shared.allocate_buffer_id();
        let stream = sensor.stream_mut(kind);
        match stream.state {
            StreamState::Starting => {
                if stream.staged.len() >= depth {
                    return Err(IspError::ResourceExhausted(format!(
                        "stream {kind} already has {depth} staged buffers"
                    )));
                }
                stream.staged.push((id, host));
                trace!(%camera, stream = %kind, %id, "buffer staged");
                Ok(id)
            }
            StreamState::Started => {
                if stream.in_firmware.len() >= depth {
                    return Err(IspError::ResourceExhausted(format!(
                        "stream {kind} already has {depth} buffers in firmware"
                    )));
                }
                let format = stream
                    .format
                    .ok_or_else(|| IspError::bad_state("stream", "submit buffer", "unconfigured"))?;
                let geometry = stream
                    .geometry
                    .ok_or_else(|| IspError::bad_state("stream", "submit buffer", "unconfigured"))?;
                let buffer = MappedBuffer::map(id, host, camera, kind, format, &geometry)?;
                self.shared.send_buffer(&buffer, ChannelId::FRAME).await?;
                let stream = lookup_mut(&mut sensors, camera)?.stream_mut(kind);
                stream.in_firmware.push_back(buffer);
                Ok(id)
            }
            state => Err(IspError::bad_state("stream", "submit buffer", state)),
        }
    }

    /// One-shot still capture into a caller buffer, routed over the capture
    /// channel so it never queues behind streaming traffic. The observer
    /// receives the frame-done; the buffer is not resubmitted.
    pub async fn capture_one(
        &self,
        camera: CameraId,
        kind: StreamKind,
        host: HostBuffer,
    ) -> IspResult<BufferId> {
        self.ensure_running()?;
        let mut sensors = self.shared.sensors.lock().await;
        let sensor = lookup_mut(&mut sensors, camera)?;
        if !sensor.open {
            return Err(IspError::bad_state("sensor", "capture", "not open"));
        }
        if sensor.outstanding_captures() >= self.shared.config.stream_buffer_depth {
            return Err(IspError::ResourceExhausted(
                "too many outstanding captures".into(),
            ));
        }
        let stream = sensor.stream(kind);
        let format = stream
            .format
            .ok_or_else(|| IspError::bad_state("stream", "capture", "unconfigured"))?;
        let geometry = stream
            .geometry
            .ok_or_else(|| IspError::bad_state("stream", "capture", "unconfigured"))?;
        let id = self.shared.allocate_buffer_id();
        let buffer = MappedBuffer::map(id, host, camera, kind, format, &geometry)?;
        self.shared.send_buffer(&buffer, ChannelId::CAPTURE).await?;
        lookup_mut(&mut sensors, camera)?
            .captures_in_flight
            .push_back(buffer);
        Ok(id)
    }

    /// Change a started stream's geometry.
    ///
    /// Same aspect ratio: applied immediately via a paused stop/start.
    /// Different aspect ratio with a sibling stream active: recorded and
    /// deferred until the sibling stops, reported as
    /// [`ResolutionChange::Deferred`] so the caller knows the frames keep
    /// arriving at the old geometry for now.
    pub async fn change_resolution(
        &self,
        camera: CameraId,
        kind: StreamKind,
        geometry: Geometry,
    ) -> IspResult<ResolutionChange> {
        geometry.validate()?;
        let mut sensors = self.shared.sensors.lock().await;
        {
            let sensor = lookup_mut(&mut sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", "change resolution", "not open"));
            }
            let siblings_active = sensor.active_streams_except(kind) > 0;
            let stream = sensor.stream_mut(kind);
            match stream.state {
                StreamState::NotStart => {
                    // Nothing running; just renegotiate.
                    if stream.format.is_none() {
                        return Err(IspError::bad_state(
                            "stream",
                            "change resolution",
                            "unconfigured",
                        ));
                    }
                    stream.geometry = Some(geometry);
                    return Ok(ResolutionChange::Applied);
                }
                StreamState::Started => {
                    let current = stream.geometry.ok_or_else(|| {
                        IspError::bad_state("stream", "change resolution", "unconfigured")
                    })?;
                    if current == geometry {
                        return Ok(ResolutionChange::Applied);
                    }
                    if !current.same_aspect(&geometry) && siblings_active {
                        // Restarting under a live sibling risks firmware-side
                        // inconsistency; coalesce until the sibling stops.
                        stream.pending_geometry = Some(geometry);
                        debug!(%camera, stream = %kind, %geometry, "resolution change deferred");
                        return Ok(ResolutionChange::Deferred);
                    }
                }
                state => {
                    return Err(IspError::bad_state("stream", "change resolution", state));
                }
            }
        }
        self.restart_with_geometry(&mut sensors, camera, kind, geometry)
            .await?;
        Ok(ResolutionChange::Applied)
    }

    pub async fn set_exposure(&self, camera: CameraId, exposure_us: u64) -> IspResult<()> {
        let caps = &self.shared.config.capabilities;
        if exposure_us < caps.exposure_us_min || exposure_us > caps.exposure_us_max {
            return Err(IspError::InvalidArgument(format!(
                "exposure {exposure_us}us outside [{}, {}]",
                caps.exposure_us_min, caps.exposure_us_max
            )));
        }
        self.control(
            camera,
            "set exposure",
            CommandOpcode::SetExposure,
            wire::encode_set_exposure(camera, exposure_us),
        )
        .await
    }

    pub async fn set_focus(
        &self,
        camera: CameraId,
        mode: FocusMode,
        position: u32,
    ) -> IspResult<()> {
        self.control(
            camera,
            "set focus",
            CommandOpcode::SetFocus,
            wire::encode_set_focus(camera, mode, position),
        )
        .await
    }

    pub async fn set_white_balance(
        &self,
        camera: CameraId,
        mode: WhiteBalanceMode,
        temperature_k: u32,
    ) -> IspResult<()> {
        self.control(
            camera,
            "set white balance",
            CommandOpcode::SetWhiteBalance,
            wire::encode_set_white_balance(camera, mode, temperature_k),
        )
        .await
    }

    pub async fn set_region_of_interest(
        &self,
        camera: CameraId,
        roi: RegionOfInterest,
    ) -> IspResult<()> {
        if roi.width == 0 || roi.height == 0 {
            return Err(IspError::InvalidArgument(
                "region of interest has a zero dimension".into(),
            ));
        }
        self.control(
            camera,
            "set region of interest",
            CommandOpcode::SetRegionOfInterest,
            wire::encode_set_roi(camera, &roi),
        )
        .await
    }

    pub async fn set_flash(&self, camera: CameraId, mode: FlashMode) -> IspResult<()> {
        self.control(
            camera,
            "set flash",
            CommandOpcode::SetFlash,
            wire::encode_set_flash(camera, mode),
        )
        .await
    }

    pub async fn set_scene_mode(&self, camera: CameraId, mode: SceneMode) -> IspResult<()> {
        self.control(
            camera,
            "set scene mode",
            CommandOpcode::SetSceneMode,
            wire::encode_set_scene_mode(camera, mode),
        )
        .await
    }

    /// Select the calibration index sent with the next sensor-open.
    pub async fn set_calibration(
        &self,
        camera: CameraId,
        calibration: Option<u16>,
    ) -> IspResult<()> {
        let mut sensors = self.shared.sensors.lock().await;
        let sensor = lookup_mut(&mut sensors, camera)?;
        if sensor.open {
            return Err(IspError::bad_state("sensor", "change calibration", "open"));
        }
        sensor.calibration = calibration;
        Ok(())
    }

    /// Capability ranges for 3A controls, answered from configuration after
    /// pinging the firmware.
    pub async fn query_capabilities(&self, camera: CameraId) -> IspResult<CapabilityRanges> {
        self.control(
            camera,
            "query capabilities",
            CommandOpcode::QueryCapabilities,
            wire::encode_query_capabilities(camera),
        )
        .await?;
        Ok(self.shared.config.capabilities.clone())
    }

    /// Snapshot one stream's state and buffer accounting.
    pub async fn stream_status(&self, camera: CameraId, kind: StreamKind) -> IspResult<StreamStatus> {
        let sensors = self.shared.sensors.lock().await;
        let stream = lookup(&sensors, camera)?.stream(kind);
        Ok(StreamStatus {
            state: stream.state,
            geometry: stream.geometry,
            pending_geometry: stream.pending_geometry,
            in_firmware: stream.in_firmware.len(),
            free: stream.free.len(),
            staged: stream.staged.len(),
        })
    }

    pub async fn is_camera_open(&self, camera: CameraId) -> IspResult<bool> {
        let sensors = self.shared.sensors.lock().await;
        Ok(lookup(&sensors, camera)?.open)
    }

    pub async fn outstanding_captures(&self, camera: CameraId) -> IspResult<usize> {
        let sensors = self.shared.sensors.lock().await;
        Ok(lookup(&sensors, camera)?.outstanding_captures())
    }

    /// Register an observer for camera events. `camera = None` observes all
    /// cameras (plus heartbeats, which are not camera-scoped).
    pub fn register_observer(
        &self,
        camera: Option<CameraId>,
        observer: Arc<dyn EventObserver>,
    ) -> ObserverHandle {
        let handle = ObserverHandle(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        self.shared
            .observers
            .write()
            .push((handle, camera, observer));
        handle
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unregister_observer(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.shared.observers.write();
        let before = observers.len();
        observers.retain(|(h, _, _)| *h != handle);
        observers.len() != before
    }

    /// Stop everything: close open cameras, stop the idle scan, shut the
    /// dispatch workers down and drain the command queue.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.idle_task.lock().take() {
            handle.abort();
        }
        let open: Vec<CameraId> = {
            let sensors = self.shared.sensors.lock().await;
            sensors.iter().filter(|s| s.open).map(|s| s.camera).collect()
        };
        for camera in open {
            if let Err(err) = self.close_camera(camera).await {
                warn!(%camera, error = %err, "close during shutdown failed");
            }
        }
        self.dispatcher.shutdown().await;
        info!("isp device down");
    }

    async fn control(
        &self,
        camera: CameraId,
        operation: &'static str,
        opcode: CommandOpcode,
        payload: bytes::Bytes,
    ) -> IspResult<()> {
        {
            let sensors = self.shared.sensors.lock().await;
            let sensor = lookup(&sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", operation, "not open"));
            }
        }
        self.shared
            .queue
            .send_sync_ok(
                opcode,
                ChannelId::CONTROL,
                payload,
                self.shared.config.sync_timeout(),
            )
            .await?;
        Ok(())
    }

    /// Complete a start: power, 3A session bring-up, stream-on, queued
    /// buffer flush. Any failure lands the stream in `StartFail` with
    /// everything it acquired rolled back.
    async fn bring_up_stream(
        &self,
        sensors: &mut Vec<SensorContext>,
        camera: CameraId,
        kind: StreamKind,
    ) -> IspResult<()> {
        let (format, geometry, is_virtual, needs_three_a, needs_power) = {
            let sensor = lookup_mut(sensors, camera)?;
            if sensor.state == SensorState::NotStart {
                sensor.state = SensorState::Starting;
            }
            let needs_three_a = !sensor.three_a_done && !sensor.is_virtual;
            let is_virtual = sensor.is_virtual;
            let stream = sensor.stream_mut(kind);
            let format = stream
                .format
                .ok_or_else(|| IspError::bad_state("stream", "start", "unconfigured"))?;
            let geometry = stream
                .geometry
                .ok_or_else(|| IspError::bad_state("stream", "start", "unconfigured"))?;
            (format, geometry, is_virtual, needs_three_a, !stream.powered)
        };

        let domain = if is_virtual {
            PowerDomain::IspCore
        } else {
            PowerDomain::Sensor(camera)
        };
        if needs_power {
            if let Err(err) = self.shared.power.acquire(domain).await {
                self.fail_start(sensors, camera, kind).await;
                return Err(err);
            }
            lookup_mut(sensors, camera)?.stream_mut(kind).powered = true;
        }

        if needs_three_a {
            if let Err(err) = self.initial_three_a(camera, &geometry).await {
                self.fail_start(sensors, camera, kind).await;
                return Err(err);
            }
            lookup_mut(sensors, camera)?.three_a_done = true;
        }

        let on = self
            .shared
            .queue
            .send_sync_ok(
                CommandOpcode::StreamOn,
                ChannelId::CONTROL,
                wire::encode_stream_on(camera, kind, format, &geometry),
                self.shared.config.sync_timeout(),
            )
            .await;
        if let Err(err) = on {
            self.fail_start(sensors, camera, kind).await;
            return Err(err);
        }

        {
            let sensor = lookup_mut(sensors, camera)?;
            sensor.state = SensorState::Started;
            sensor.stream_mut(kind).state = StreamState::Started;
        }
        info!(%camera, stream = %kind, %geometry, "stream started");
        self.flush_queued_buffers(sensors, camera, kind).await;
        Ok(())
    }

    /// The one-time 3A burst a sensor session needs before its first stream
    /// output.
    async fn initial_three_a(&self, camera: CameraId, geometry: &Geometry) -> IspResult<()> {
        let caps = &self.shared.config.capabilities;
        let exposure = DEFAULT_EXPOSURE_US.clamp(caps.exposure_us_min, caps.exposure_us_max);
        let timeout = self.shared.config.sync_timeout();
        self.shared
            .queue
            .send_sync_ok(
                CommandOpcode::SetExposure,
                ChannelId::CONTROL,
                wire::encode_set_exposure(camera, exposure),
                timeout,
            )
            .await?;
        self.shared
            .queue
            .send_sync_ok(
                CommandOpcode::SetWhiteBalance,
                ChannelId::CONTROL,
                wire::encode_set_white_balance(camera, WhiteBalanceMode::Auto, 0),
                timeout,
            )
            .await?;
        let roi = RegionOfInterest::full(geometry.width, geometry.height);
        self.shared
            .queue
            .send_sync_ok(
                CommandOpcode::SetRegionOfInterest,
                ChannelId::CONTROL,
                wire::encode_set_roi(camera, &roi),
                timeout,
            )
            .await?;
        Ok(())
    }

    async fn fail_start(&self, sensors: &mut [SensorContext], camera: CameraId, kind: StreamKind) {
        let Ok(sensor) = lookup_mut(sensors, camera) else {
            return;
        };
        let is_virtual = sensor.is_virtual;
        let stream = sensor.stream_mut(kind);
        stream.state = StreamState::StartFail;
        let release = std::mem::take(&mut stream.powered);
        if sensor.active_streams_except(kind) == 0 {
            sensor.state = SensorState::NotStart;
        }
        warn!(%camera, stream = %kind, "stream start failed");
        if release {
            let domain = if is_virtual {
                PowerDomain::IspCore
            } else {
                PowerDomain::Sensor(camera)
            };
            self.shared.power.release(domain).await;
        }
    }

    /// Map and send everything queued for a freshly started stream: handles
    /// staged during `Starting`, then buffers reclaimed onto the free list
    /// by a previous stop. Buffers that no longer fit the geometry are
    /// released with a warning instead of failing the start.
    async fn flush_queued_buffers(
        &self,
        sensors: &mut [SensorContext],
        camera: CameraId,
        kind: StreamKind,
    ) {
        let (format, geometry, staged, free) = {
            let Ok(sensor) = lookup_mut(sensors, camera) else {
                return;
            };
            let stream = sensor.stream_mut(kind);
            let (Some(format), Some(geometry)) = (stream.format, stream.geometry) else {
                return;
            };
            (
                format,
                geometry,
                std::mem::take(&mut stream.staged),
                std::mem::take(&mut stream.free),
            )
        };

        let mut delivered = Vec::new();
        let candidates = staged
            .into_iter()
            .chain(free.into_iter().map(|b| (b.id(), b.handle())));
        for (id, handle) in candidates {
            let buffer = match MappedBuffer::map(id, handle, camera, kind, format, &geometry) {
                Ok(buffer) => buffer,
                Err(err) => {
                    warn!(%camera, stream = %kind, %id, error = %err, "queued buffer no longer fits; released");
                    continue;
                }
            };
            match self.shared.send_buffer(&buffer, ChannelId::FRAME).await {
                Ok(()) => delivered.push(buffer),
                Err(err) => {
                    warn!(%camera, stream = %kind, %id, error = %err, "queued buffer submission failed; released");
                }
            }
        }
        if let Ok(sensor) = lookup_mut(sensors, camera) {
            sensor.stream_mut(kind).in_firmware.extend(delivered);
        }
    }

    async fn stop_stream_locked(
        &self,
        sensors: &mut Vec<SensorContext>,
        camera: CameraId,
        kind: StreamKind,
        pause: bool,
    ) -> IspResult<()> {
        let (was_started, powered, is_virtual) = {
            let sensor = lookup_mut(sensors, camera)?;
            if !sensor.open {
                return Err(IspError::bad_state("sensor", "stop stream", "not open"));
            }
            let is_virtual = sensor.is_virtual;
            let stream = sensor.stream_mut(kind);
            match stream.state {
                StreamState::NotStart | StreamState::Stopping => return Ok(()),
                state => {
                    let powered = stream.powered;
                    stream.state = StreamState::Stopping;
                    (state == StreamState::Started, powered, is_virtual)
                }
            }
        };

        if was_started {
            // Best effort with the short deadline; firmware not answering
            // does not keep the stream alive.
            match self
                .shared
                .queue
                .send_sync(
                    CommandOpcode::StreamOff,
                    ChannelId::CONTROL,
                    wire::encode_stream_off(camera, kind),
                    self.shared.config.stop_timeout(),
                )
                .await
            {
                Ok(response) if !response.status.is_ok() => {
                    warn!(%camera, stream = %kind, status = %response.status, "stream-off rejected; forcing stop");
                }
                Err(err) => {
                    warn!(%camera, stream = %kind, error = %err, "stream-off incomplete; forcing stop");
                }
                Ok(_) => {}
            }
        }

        {
            let sensor = lookup_mut(sensors, camera)?;
            let stream = sensor.stream_mut(kind);
            stream.reset(pause);
            if !pause {
                stream.powered = false;
            }
            if !sensor.any_stream_active() {
                sensor.state = SensorState::NotStart;
            }
        }
        debug!(%camera, stream = %kind, pause, "stream stopped");

        if powered && !pause {
            let domain = if is_virtual {
                PowerDomain::IspCore
            } else {
                PowerDomain::Sensor(camera)
            };
            self.shared.power.release(domain).await;
        }

        if !pause {
            self.apply_deferred_resolution(sensors, camera).await;
        }
        Ok(())
    }

    /// Apply a deferred resolution change once its stream is the only one
    /// left active on the sensor.
    async fn apply_deferred_resolution(&self, sensors: &mut Vec<SensorContext>, camera: CameraId) {
        let candidate = {
            let Ok(sensor) = lookup_mut(sensors, camera) else {
                return;
            };
            StreamKind::ALL.into_iter().find_map(|kind| {
                let stream = sensor.stream(kind);
                if stream.state == StreamState::Started
                    && stream.pending_geometry.is_some()
                    && sensor.active_streams_except(kind) == 0
                {
                    stream.pending_geometry.map(|g| (kind, g))
                } else {
                    None
                }
            })
        };
        let Some((kind, geometry)) = candidate else {
            return;
        };
        if let Ok(sensor) = lookup_mut(sensors, camera) {
            sensor.stream_mut(kind).pending_geometry = None;
        }
        info!(%camera, stream = %kind, %geometry, "applying deferred resolution change");
        if let Err(err) = self
            .restart_with_geometry(sensors, camera, kind, geometry)
            .await
        {
            warn!(%camera, stream = %kind, error = %err, "deferred resolution change failed");
        }
    }

    /// Paused stop followed by a start with `geometry`. Buffers survive on
    /// the free list and the power reference is kept across the gap.
    async fn restart_with_geometry(
        &self,
        sensors: &mut Vec<SensorContext>,
        camera: CameraId,
        kind: StreamKind,
        geometry: Geometry,
    ) -> IspResult<()> {
        match self
            .shared
            .queue
            .send_sync(
                CommandOpcode::StreamOff,
                ChannelId::CONTROL,
                wire::encode_stream_off(camera, kind),
                self.shared.config.stop_timeout(),
            )
            .await
        {
            Ok(response) if !response.status.is_ok() => {
                warn!(%camera, stream = %kind, status = %response.status, "pause stream-off rejected");
            }
            Err(err) => {
                warn!(%camera, stream = %kind, error = %err, "pause stream-off incomplete");
            }
            Ok(_) => {}
        }
        {
            let sensor = lookup_mut(sensors, camera)?;
            let stream = sensor.stream_mut(kind);
            stream.reset(true);
            stream.geometry = Some(geometry);
            stream.state = StreamState::Starting;
        }
        self.bring_up_stream(sensors, camera, kind).await
    }
}

/// Routes unsolicited firmware events into buffer bookkeeping and observer
/// notifications. Runs on the dispatch workers.
struct EventRouter {
    shared: Arc<Shared>,
}

#[async_trait]
impl EventRoute for EventRouter {
    async fn on_event(&self, response: Response) {
        match response.opcode {
            CommandOpcode::FrameDone => self.frame_done(response).await,
            CommandOpcode::FrameInfo => self.frame_info(response),
            CommandOpcode::FirmwareError => self.firmware_error(response),
            CommandOpcode::Heartbeat => {
                trace!(channel = %response.channel, "firmware heartbeat");
                self.shared.notify(&CameraEvent::Heartbeat {
                    channel: response.channel,
                });
            }
            opcode => warn!(%opcode, "non-event opcode on event path; dropped"),
        }
    }
}

impl EventRouter {
    async fn frame_done(&self, response: Response) {
        let payload = match wire::decode_frame_done(&response.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "malformed frame-done payload; dropped");
                return;
            }
        };
        let mut sensors = self.shared.sensors.lock().await;
        let Ok(sensor) = lookup_mut(&mut sensors, payload.camera) else {
            warn!(camera = %payload.camera, "frame-done for unknown camera; dropped");
            return;
        };

        let event = CameraEvent::FrameDone {
            camera: payload.camera,
            stream: payload.stream,
            buffer: payload.buffer,
            status: response.status,
        };

        // One-shot captures complete out of the sensor's capture list and
        // are never resubmitted.
        if let Some(index) = sensor
            .captures_in_flight
            .iter()
            .position(|b| b.id() == payload.buffer)
        {
            drop(sensor.captures_in_flight.remove(index));
            trace!(camera = %payload.camera, buffer = %payload.buffer, "capture complete");
            self.shared.notify(&event);
            return;
        }

        let stream = sensor.stream_mut(payload.stream);
        let Some(buffer) = stream.take_in_firmware(payload.buffer) else {
            return;
        };
        self.shared.notify(&event);

        // Keep firmware fed: the completed buffer goes straight back unless
        // the stream is winding down. A per-frame failure degrades only the
        // frame, so failed buffers are recycled the same way.
        if stream.state == StreamState::Started {
            match self.shared.send_buffer(&buffer, ChannelId::FRAME).await {
                Ok(()) => {
                    let stream = match lookup_mut(&mut sensors, payload.camera) {
                        Ok(sensor) => sensor.stream_mut(payload.stream),
                        Err(_) => return,
                    };
                    stream.in_firmware.push_back(buffer);
                }
                Err(err) => {
                    warn!(camera = %payload.camera, stream = %payload.stream, error = %err,
                        "buffer resubmission failed; parked on free list");
                    if let Ok(sensor) = lookup_mut(&mut sensors, payload.camera) {
                        sensor.stream_mut(payload.stream).free.push_back(buffer);
                    }
                }
            }
        } else {
            stream.free.push_back(buffer);
        }
    }

    fn frame_info(&self, response: Response) {
        match wire::decode_frame_info(&response.payload) {
            Ok(payload) => self.shared.notify(&CameraEvent::FrameInfo {
                camera: payload.camera,
                stream: payload.stream,
                payload: payload.metadata,
            }),
            Err(err) => warn!(error = %err, "malformed frame-info payload; dropped"),
        }
    }

    fn firmware_error(&self, response: Response) {
        match wire::decode_firmware_error(&response.payload) {
            Ok(payload) => {
                warn!(camera = %payload.camera, code = payload.code, "firmware error event");
                self.shared.notify(&CameraEvent::Error {
                    camera: payload.camera,
                    code: payload.code,
                });
            }
            Err(err) => warn!(error = %err, "malformed firmware-error payload; dropped"),
        }
    }
}
