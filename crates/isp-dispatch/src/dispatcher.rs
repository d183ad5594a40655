//! Per-channel response workers.
//!
//! Each logical channel owns a lock-free inbox and a wake signal. The
//! transport (or an interrupt shim in front of it) delivers responses through
//! the [`ResponseInlet`]; the matching worker wakes, drains its inbox, and
//! either completes pending commands or forwards firmware events to the
//! registered [`EventRoute`]. A polling fallback bounds the wait so a lost
//! wake-up can never wedge a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use isp_core::{ChannelId, Response, ResponseSink};

use crate::queue::CommandQueue;

/// Destination for unsolicited firmware events (frame-done, frame-info,
/// error, heartbeat). The pipeline layer implements this.
#[async_trait]
pub trait EventRoute: Send + Sync {
    async fn on_event(&self, response: Response);
}

/// Event route that logs and discards. Useful in tests and for wiring the
/// dispatcher before the pipeline exists.
#[derive(Debug, Default)]
pub struct DiscardEvents;

#[async_trait]
impl EventRoute for DiscardEvents {
    async fn on_event(&self, response: Response) {
        debug!(opcode = %response.opcode, channel = %response.channel, "event discarded");
    }
}

struct ChannelInbox {
    channel: ChannelId,
    queue: SegQueue<Response>,
    wake: Notify,
}

/// Handle the transport delivers responses through.
///
/// Delivery pushes onto the channel's inbox and wakes its worker, which is
/// the software rendition of the firmware's response interrupt.
#[derive(Clone)]
pub struct ResponseInlet {
    channels: Arc<Vec<Arc<ChannelInbox>>>,
}

impl ResponseSink for ResponseInlet {
    fn deliver(&self, response: Response) {
        let index = response.channel.value() as usize;
        let Some(inbox) = self.channels.get(index) else {
            warn!(channel = %response.channel, "response for unknown channel; dropped");
            return;
        };
        inbox.queue.push(response);
        inbox.wake.notify_one();
    }
}

/// Owns one response worker per logical channel.
pub struct Dispatcher {
    queue: Arc<CommandQueue>,
    route: Arc<dyn EventRoute>,
    channels: Arc<Vec<Arc<ChannelInbox>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<CommandQueue>,
        route: Arc<dyn EventRoute>,
        channel_count: u8,
        poll_interval: Duration,
    ) -> Self {
        let channels: Vec<Arc<ChannelInbox>> = (0..channel_count)
            .map(|index| {
                Arc::new(ChannelInbox {
                    channel: ChannelId(index),
                    queue: SegQueue::new(),
                    wake: Notify::new(),
                })
            })
            .collect();
        Dispatcher {
            queue,
            route,
            channels: Arc::new(channels),
            workers: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            poll_interval,
        }
    }

    /// The sink the transport must be connected to.
    pub fn inlet(&self) -> ResponseInlet {
        ResponseInlet {
            channels: Arc::clone(&self.channels),
        }
    }

    /// Spawn one worker task per channel. Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        self.running.store(true, Ordering::Release);
        for inbox in self.channels.iter() {
            let inbox = Arc::clone(inbox);
            let queue = Arc::clone(&self.queue);
            let route = Arc::clone(&self.route);
            let running = Arc::clone(&self.running);
            let poll_interval = self.poll_interval;
            workers.push(tokio::spawn(async move {
                channel_worker(inbox, queue, route, running, poll_interval).await;
            }));
        }
        debug!(channels = self.channels.len(), "dispatch workers started");
    }

    /// Stop all workers and perform the final teardown drain.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for inbox in self.channels.iter() {
            inbox.wake.notify_one();
        }
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(%err, "dispatch worker panicked during shutdown");
            }
        }
        let drained = self.queue.drain(None);
        if !drained.is_empty() {
            warn!(count = drained.len(), "commands still pending at shutdown");
        }
    }
}

/// One cooperative worker: wait for a wake (or the polling interval), then
/// drain every response currently queued on the channel, in arrival order.
async fn channel_worker(
    inbox: Arc<ChannelInbox>,
    queue: Arc<CommandQueue>,
    route: Arc<dyn EventRoute>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    trace!(channel = %inbox.channel, "channel worker up");
    loop {
        tokio::select! {
            _ = inbox.wake.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
        while let Some(response) = inbox.queue.pop() {
            if response.opcode.is_event() {
                route.on_event(response).await;
            } else {
                queue.complete(response);
            }
        }
        if !running.load(Ordering::Acquire) {
            break;
        }
    }
    trace!(channel = %inbox.channel, "channel worker down");
}
