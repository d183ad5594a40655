//! The pending-command table and submission paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use isp_core::{
    BufferId, ChannelId, CommandOpcode, CommandPacket, IspError, IspResult, IspTransport, Response,
};

/// One in-flight request awaiting a firmware response.
///
/// Removal from the pending table transfers ownership: an element is taken
/// out exactly once, either by the matching response or by a forced drain.
struct CommandElement {
    opcode: CommandOpcode,
    channel: ChannelId,
    /// Back-reference to the buffer the command carries, released when the
    /// element completes.
    buffer: Option<BufferId>,
    /// Present for synchronous submissions; carries the whole response back
    /// to the waiting caller.
    completion: Option<oneshot::Sender<Response>>,
}

/// Summary of a forcibly removed command, reported by [`CommandQueue::drain`].
#[derive(Debug, Clone, Copy)]
pub struct DrainedCommand {
    pub sequence: u32,
    pub opcode: CommandOpcode,
    pub buffer: Option<BufferId>,
}

/// Process-wide table of outstanding commands plus the submission paths.
pub struct CommandQueue {
    transport: Arc<dyn IspTransport>,
    pending: Mutex<HashMap<u32, CommandElement>>,
    next_sequence: AtomicU32,
    max_pending: usize,
}

impl CommandQueue {
    pub fn new(transport: Arc<dyn IspTransport>, max_pending: usize) -> Self {
        CommandQueue {
            transport,
            pending: Mutex::new(HashMap::new()),
            next_sequence: AtomicU32::new(1),
            max_pending,
        }
    }

    /// Sequence numbers increase monotonically and wrap at `2^32`.
    fn allocate_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(
        &self,
        opcode: CommandOpcode,
        channel: ChannelId,
        buffer: Option<BufferId>,
        completion: Option<oneshot::Sender<Response>>,
    ) -> IspResult<u32> {
        let sequence = self.allocate_sequence();
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            return Err(IspError::ResourceExhausted(format!(
                "pending command table full ({} entries)",
                self.max_pending
            )));
        }
        pending.insert(
            sequence,
            CommandElement {
                opcode,
                channel,
                buffer,
                completion,
            },
        );
        Ok(sequence)
    }

    /// Transmit `sequence`; on any transport failure the pending element is
    /// removed before the error propagates, so a command that never reached
    /// firmware is never left pending.
    async fn transmit(
        &self,
        sequence: u32,
        opcode: CommandOpcode,
        channel: ChannelId,
        payload: Bytes,
    ) -> IspResult<()> {
        let packet = CommandPacket {
            sequence,
            opcode,
            channel,
            payload,
        };
        if let Err(err) = self.transport.transmit(packet).await {
            self.pending.lock().remove(&sequence);
            return Err(err.into());
        }
        if let Err(err) = self.transport.doorbell(channel) {
            self.pending.lock().remove(&sequence);
            return Err(err.into());
        }
        trace!(sequence, %opcode, %channel, "command transmitted");
        Ok(())
    }

    /// Fire-and-forget submission. Returns the allocated sequence number.
    pub async fn enqueue_and_send(
        &self,
        opcode: CommandOpcode,
        channel: ChannelId,
        payload: Bytes,
        buffer: Option<BufferId>,
    ) -> IspResult<u32> {
        let sequence = self.insert(opcode, channel, buffer, None)?;
        self.transmit(sequence, opcode, channel, payload).await?;
        Ok(sequence)
    }

    /// Synchronous submission: waits for the response with a bounded deadline.
    ///
    /// On timeout the element is left pending — firmware may still answer
    /// late, and the late response will be logged and dropped. This is a
    /// known best-effort behavior, not a cancellation.
    pub async fn send_sync(
        &self,
        opcode: CommandOpcode,
        channel: ChannelId,
        payload: Bytes,
        timeout: Duration,
    ) -> IspResult<Response> {
        let (tx, rx) = oneshot::channel();
        let sequence = self.insert(opcode, channel, None, Some(tx))?;
        self.transmit(sequence, opcode, channel, payload).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without sending: the element was drained.
            Ok(Err(_)) => Err(IspError::Drained { sequence, opcode }),
            Err(_) => {
                warn!(sequence, %opcode, ?timeout, "synchronous command timed out; element left pending");
                Err(IspError::Timeout {
                    sequence,
                    opcode,
                    timeout,
                })
            }
        }
    }

    /// Convenience wrapper mapping a firmware non-success status to an error.
    pub async fn send_sync_ok(
        &self,
        opcode: CommandOpcode,
        channel: ChannelId,
        payload: Bytes,
        timeout: Duration,
    ) -> IspResult<Response> {
        let response = self.send_sync(opcode, channel, payload, timeout).await?;
        if response.status.is_ok() {
            Ok(response)
        } else {
            Err(IspError::Firmware {
                opcode,
                status: response.status,
            })
        }
    }

    /// Complete the pending command matching `response`.
    ///
    /// Invoked by a channel worker. Fails soft on mismatches: an unknown
    /// sequence number (legitimate after a timeout) or a wrong opcode is
    /// logged and dropped, never escalated.
    pub fn complete(&self, response: Response) {
        let element = self.pending.lock().remove(&response.sequence);
        let Some(element) = element else {
            warn!(
                sequence = response.sequence,
                opcode = %response.opcode,
                "response matches no pending command (late or unknown); dropped"
            );
            return;
        };
        if element.opcode != response.opcode {
            warn!(
                sequence = response.sequence,
                expected = %element.opcode,
                received = %response.opcode,
                "response opcode mismatch; dropped"
            );
            // Put the element back: its real response may still arrive.
            self.pending.lock().insert(response.sequence, element);
            return;
        }
        if let Some(buffer) = element.buffer {
            trace!(sequence = response.sequence, %buffer, "buffer reference released");
        }
        match element.completion {
            Some(tx) => {
                if tx.send(response).is_err() {
                    // The synchronous caller already timed out.
                    warn!("late response for timed-out command; dropped");
                }
            }
            None => {
                if response.status.is_ok() {
                    trace!(sequence = response.sequence, opcode = %response.opcode, "command acknowledged");
                } else {
                    warn!(
                        sequence = response.sequence,
                        opcode = %response.opcode,
                        status = %response.status,
                        "fire-and-forget command failed in firmware"
                    );
                }
            }
        }
    }

    /// Forcibly remove pending commands, optionally scoped to one channel.
    ///
    /// Never blocks. Synchronous waiters observe [`IspError::Drained`]
    /// because their completion sender is dropped here.
    pub fn drain(&self, channel: Option<ChannelId>) -> Vec<DrainedCommand> {
        let mut pending = self.pending.lock();
        let sequences: Vec<u32> = pending
            .iter()
            .filter(|(_, element)| channel.map_or(true, |ch| element.channel == ch))
            .map(|(sequence, _)| *sequence)
            .collect();
        let mut drained = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            if let Some(element) = pending.remove(&sequence) {
                drained.push(DrainedCommand {
                    sequence,
                    opcode: element.opcode,
                    buffer: element.buffer,
                });
            }
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), ?channel, "drained pending commands");
        }
        drained
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, sequence: u32) -> bool {
        self.pending.lock().contains_key(&sequence)
    }
}
