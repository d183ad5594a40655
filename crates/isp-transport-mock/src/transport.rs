//! The mock transport implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace, warn};

use isp_core::wire;
use isp_core::{
    ChannelId, CommandOpcode, CommandPacket, IspTransport, PowerDomain, Response, ResponseSink,
    ResponseStatus, TransportError, TransportErrorKind,
};

use crate::behavior::MockBehavior;

/// Simulated firmware endpoint.
pub struct MockTransport {
    behavior: Mutex<MockBehavior>,
    sink: Mutex<Option<Arc<dyn ResponseSink>>>,
    transcript: Mutex<Vec<CommandPacket>>,
    doorbells: Mutex<Vec<ChannelId>>,
    power: Mutex<HashMap<PowerDomain, bool>>,
    power_log: Mutex<Vec<(PowerDomain, bool)>>,
    rng: Mutex<ChaCha8Rng>,
    frame_counter: AtomicU32,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(MockBehavior::default())
    }

    pub fn with_behavior(behavior: MockBehavior) -> Arc<Self> {
        let seed = behavior.seed;
        Arc::new(MockTransport {
            behavior: Mutex::new(behavior),
            sink: Mutex::new(None),
            transcript: Mutex::new(Vec::new()),
            doorbells: Mutex::new(Vec::new()),
            power: Mutex::new(HashMap::new()),
            power_log: Mutex::new(Vec::new()),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            frame_counter: AtomicU32::new(0),
        })
    }

    /// Adjust behavior mid-test.
    pub fn set_behavior(&self, adjust: impl FnOnce(&mut MockBehavior)) {
        adjust(&mut self.behavior.lock());
    }

    /// Deliver a hand-crafted response or event to the dispatcher.
    pub fn inject_response(&self, response: Response) {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.deliver(response),
            None => warn!("inject_response before connect; dropped"),
        }
    }

    /// Every packet transmitted so far, in order.
    pub fn transcript(&self) -> Vec<CommandPacket> {
        self.transcript.lock().clone()
    }

    /// Opcodes transmitted so far, in order.
    pub fn sent_opcodes(&self) -> Vec<CommandOpcode> {
        self.transcript.lock().iter().map(|p| p.opcode).collect()
    }

    pub fn doorbells_rung(&self) -> Vec<ChannelId> {
        self.doorbells.lock().clone()
    }

    pub fn is_powered(&self, domain: PowerDomain) -> bool {
        self.power.lock().get(&domain).copied().unwrap_or(false)
    }

    /// Every power transition in order: (domain, on).
    pub fn power_log(&self) -> Vec<(PowerDomain, bool)> {
        self.power_log.lock().clone()
    }

    fn deliver_later(&self, response: Response, delay: Duration) {
        let sink = self.sink.lock().clone();
        let Some(sink) = sink else {
            warn!("no response sink connected; response dropped");
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.deliver(response);
        });
    }

    fn response_status(&self, opcode: CommandOpcode, behavior: &MockBehavior) -> ResponseStatus {
        if let Some(status) = behavior.fail.get(&opcode) {
            return *status;
        }
        if behavior.fault_rate > 0.0 && self.rng.lock().gen_bool(behavior.fault_rate) {
            return ResponseStatus::HardwareFault;
        }
        ResponseStatus::Ok
    }

    /// Schedule the frame-done event an accepted buffer produces.
    fn schedule_frame_done(&self, packet: &CommandPacket, behavior: &MockBehavior) {
        let Ok(decoded) = wire::decode_buffer_available(&packet.payload) else {
            warn!("malformed buffer-available payload; no frame generated");
            return;
        };
        let frame_number = self.frame_counter.fetch_add(1, Ordering::Relaxed);
        let payload =
            wire::encode_frame_done(decoded.camera, decoded.stream, decoded.buffer, frame_number);
        let event = Response {
            sequence: 0,
            opcode: CommandOpcode::FrameDone,
            channel: packet.channel,
            status: ResponseStatus::Ok,
            payload,
        };
        let delay = behavior.response_latency + behavior.frame_latency;
        trace!(buffer = %decoded.buffer, frame_number, "frame-done scheduled");
        self.deliver_later(event, delay);
    }
}

#[async_trait]
impl IspTransport for MockTransport {
    async fn power_on(&self, domain: PowerDomain) -> Result<(), TransportError> {
        if self.behavior.lock().fail_power.contains(&domain) {
            return Err(TransportError::new(
                TransportErrorKind::Power,
                format!("injected power failure for {domain}"),
            ));
        }
        self.power.lock().insert(domain, true);
        self.power_log.lock().push((domain, true));
        debug!(%domain, "powered on");
        Ok(())
    }

    async fn power_off(&self, domain: PowerDomain) -> Result<(), TransportError> {
        if self.behavior.lock().fail_power.contains(&domain) {
            return Err(TransportError::new(
                TransportErrorKind::Power,
                format!("injected power failure for {domain}"),
            ));
        }
        self.power.lock().insert(domain, false);
        self.power_log.lock().push((domain, false));
        debug!(%domain, "powered off");
        Ok(())
    }

    async fn transmit(&self, packet: CommandPacket) -> Result<(), TransportError> {
        let behavior = self.behavior.lock().clone();
        if behavior.fail_transmit.contains(&packet.opcode) {
            return Err(TransportError::new(
                TransportErrorKind::Transmit,
                format!("injected transmit failure for {}", packet.opcode),
            ));
        }
        self.transcript.lock().push(packet.clone());
        if behavior.drop_response.contains(&packet.opcode) {
            trace!(opcode = %packet.opcode, "response suppressed");
            return Ok(());
        }
        if behavior.auto_respond {
            let status = self.response_status(packet.opcode, &behavior);
            let response = Response {
                sequence: packet.sequence,
                opcode: packet.opcode,
                channel: packet.channel,
                status,
                payload: Bytes::new(),
            };
            self.deliver_later(response, behavior.response_latency);
            if packet.opcode == CommandOpcode::BufferAvailable
                && status.is_ok()
                && behavior.auto_frames
            {
                self.schedule_frame_done(&packet, &behavior);
            }
        }
        Ok(())
    }

    fn doorbell(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.doorbells.lock().push(channel);
        Ok(())
    }

    fn connect(&self, sink: Arc<dyn ResponseSink>) {
        *self.sink.lock() = Some(sink);
    }
}
