//! Server-relayed control messages.
//!
//! Outbound offers, answers and candidates are collected for a short
//! debounce window and sent as one batch. A single worker task drains the
//! queue so at most one request is ever in flight; messages that arrive
//! mid-drain are picked up by the next cycle. A failed batch goes back to
//! the front of the queue.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use meshcore::{ControlEvent, ControlMessage, ConversationId, SessionId};
use rand::Rng;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::server::{CallServer, InboundNotification, PeerNotification};

#[derive(Default)]
struct Pending {
    items: Vec<PeerNotification>,
    // Bumped by `clear` so an in-flight batch is not restored afterwards.
    epoch: u64,
}

struct RelayInner {
    server: Arc<dyn CallServer>,
    pending: Mutex<Pending>,
    wake: Notify,
    debounce: Duration,
    retry_delay: Duration,
}

pub(crate) struct RelayQueue {
    inner: Arc<RelayInner>,
    worker: JoinHandle<()>,
}

impl RelayQueue {
    pub(crate) fn new(server: Arc<dyn CallServer>, debounce: Duration, retry_delay: Duration) -> Self {
        let inner = Arc::new(RelayInner {
            server,
            pending: Mutex::new(Pending::default()),
            wake: Notify::new(),
            debounce,
            retry_delay,
        });
        let worker = tokio::spawn(Self::drain_loop(inner.clone()));
        Self { inner, worker }
    }

    pub(crate) async fn enqueue(&self, notification: PeerNotification) {
        self.inner.pending.lock().await.items.push(notification);
        self.inner.wake.notify_one();
    }

    /// Drop everything queued, including a batch that is currently being sent.
    pub(crate) async fn clear(&self) {
        let mut pending = self.inner.pending.lock().await;
        pending.items.clear();
        pending.epoch += 1;
    }

    pub(crate) async fn pending_len(&self) -> usize {
        self.inner.pending.lock().await.items.len()
    }

    async fn drain_loop(inner: Arc<RelayInner>) {
        loop {
            inner.wake.notified().await;
            tokio::time::sleep(inner.debounce).await;

            loop {
                let (batch, epoch) = {
                    let mut pending = inner.pending.lock().await;
                    (std::mem::take(&mut pending.items), pending.epoch)
                };
                if batch.is_empty() {
                    break;
                }

                let count = batch.len();
                match inner.server.notify_peers(batch.clone()).await {
                    Ok(()) => {
                        debug!(target: "Call/Relay", "Relayed {count} control message(s)");
                    }
                    Err(e) => {
                        warn!(target: "Call/Relay", "Relaying {count} message(s) failed, will retry: {e}");
                        {
                            let mut pending = inner.pending.lock().await;
                            if pending.epoch != epoch {
                                break;
                            }
                            let newer = std::mem::replace(&mut pending.items, batch);
                            pending.items.extend(newer);
                        }
                        tokio::time::sleep(retry_delay_with_jitter(inner.retry_delay)).await;
                    }
                }
            }
        }
    }
}

impl Drop for RelayQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn retry_delay_with_jitter(base: Duration) -> Duration {
    let max_jitter = (base.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
}

/// Addressing for control messages sent on behalf of the local session.
#[derive(Clone, Copy)]
pub(crate) struct Signaling<'a> {
    pub(crate) relay: &'a RelayQueue,
    pub(crate) channel_id: ConversationId,
    pub(crate) self_session: SessionId,
}

impl Signaling<'_> {
    /// Queue `event` for relay to `target`. Encoding failures are logged and
    /// the message dropped.
    pub(crate) async fn send(&self, target: SessionId, event: ControlEvent) {
        let name = event.name();
        match ControlMessage::new(self.channel_id, event).encode() {
            Ok(message) => {
                self.relay
                    .enqueue(PeerNotification {
                        sender: self.self_session,
                        targets: vec![target],
                        message,
                    })
                    .await;
            }
            Err(e) => warn!(target: "Call/Relay", "Failed to encode {name} for {target}: {e}"),
        }
    }

    pub(crate) fn encode(&self, event: ControlEvent) -> Option<String> {
        let name = event.name();
        ControlMessage::new(self.channel_id, event)
            .encode()
            .inspect_err(|e| warn!(target: "Call/Relay", "Failed to encode {name}: {e}"))
            .ok()
    }
}

/// Decode a relayed or side-channel message addressed to `channel_id`.
/// Messages for another conversation, or that fail to parse, are dropped.
pub(crate) fn decode_inbound(
    channel_id: ConversationId,
    sender: SessionId,
    text: &str,
) -> Option<ControlEvent> {
    match ControlMessage::decode(text) {
        Ok(message) if message.channel_id == channel_id => Some(message.event),
        Ok(message) => {
            debug!(
                target: "Call/Relay",
                "Dropping {} from {sender} for channel {}",
                message.event.name(),
                message.channel_id
            );
            None
        }
        Err(e) => {
            warn!(target: "Call/Relay", "Malformed control message from {sender}: {e}");
            None
        }
    }
}

pub(crate) fn decode_relayed(
    channel_id: ConversationId,
    notification: &InboundNotification,
) -> Option<ControlEvent> {
    decode_inbound(channel_id, notification.sender, &notification.message)
}
