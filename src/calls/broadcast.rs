//! Debounced publication of the local device state to the server.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use meshcore::{BroadcastState, BroadcastTracker, ConversationId, SessionId};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::server::{CallServer, SessionStateUpdate};

struct NotifierInner {
    server: Arc<dyn CallServer>,
    conversation_id: ConversationId,
    session_id: SessionId,
    latest: Mutex<Option<BroadcastState>>,
    wake: Notify,
    debounce: Duration,
}

/// Coalesces bursts of mute/deafen/camera/screen changes into one update.
/// Only the most recent state is sent, and only if the server has not
/// already acknowledged it.
pub(crate) struct BroadcastNotifier {
    inner: Arc<NotifierInner>,
    worker: JoinHandle<()>,
}

impl BroadcastNotifier {
    pub(crate) fn new(
        server: Arc<dyn CallServer>,
        conversation_id: ConversationId,
        session_id: SessionId,
        debounce: Duration,
    ) -> Self {
        let inner = Arc::new(NotifierInner {
            server,
            conversation_id,
            session_id,
            latest: Mutex::new(None),
            wake: Notify::new(),
            debounce,
        });
        let worker = tokio::spawn(Self::flush_loop(inner.clone()));
        Self { inner, worker }
    }

    pub(crate) async fn update(&self, state: BroadcastState) {
        *self.inner.latest.lock().await = Some(state);
        self.inner.wake.notify_one();
    }

    async fn flush_loop(inner: Arc<NotifierInner>) {
        let mut tracker = BroadcastTracker::new();
        loop {
            inner.wake.notified().await;
            tokio::time::sleep(inner.debounce).await;

            let Some(state) = inner.latest.lock().await.take() else {
                continue;
            };
            if !tracker.needs_send(&state) {
                continue;
            }

            let update = SessionStateUpdate {
                conversation_id: inner.conversation_id,
                session_id: inner.session_id,
                state,
            };
            match inner.server.update_session_state(update).await {
                Ok(()) => {
                    debug!(target: "Call/Broadcast", "Published device state {state:?}");
                    tracker.acknowledge(state);
                }
                Err(e) => {
                    warn!(target: "Call/Broadcast", "Failed to publish device state: {e}");
                    let mut latest = inner.latest.lock().await;
                    if latest.is_none() {
                        *latest = Some(state);
                    }
                    inner.wake.notify_one();
                }
            }
        }
    }
}

impl Drop for BroadcastNotifier {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        JoinRequest, JoinResponse, LeaveRequest, PeerNotification, PingRequest, PingResponse,
        ServerError,
    };
    use async_trait::async_trait;

    #[derive(Default)]
    struct StateRecorder {
        updates: Mutex<Vec<SessionStateUpdate>>,
    }

    #[async_trait]
    impl CallServer for StateRecorder {
        async fn join_call(&self, _: JoinRequest) -> Result<JoinResponse, ServerError> {
            Err(ServerError::Rejected("unused".into()))
        }

        async fn leave_call(&self, _: LeaveRequest) -> Result<(), ServerError> {
            Ok(())
        }

        async fn ping(&self, _: PingRequest) -> Result<PingResponse, ServerError> {
            Ok(PingResponse::default())
        }

        async fn notify_peers(&self, _: Vec<PeerNotification>) -> Result<(), ServerError> {
            Ok(())
        }

        async fn update_session_state(&self, update: SessionStateUpdate) -> Result<(), ServerError> {
            self.updates.lock().await.push(update);
            Ok(())
        }
    }

    fn notifier(server: Arc<StateRecorder>) -> BroadcastNotifier {
        BroadcastNotifier::new(
            server,
            ConversationId::new(1),
            SessionId::new(10),
            Duration::from_secs(3),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_publishes_latest_state_once() {
        let server = Arc::new(StateRecorder::default());
        let notifier = notifier(server.clone());

        let muted = BroadcastState {
            is_self_muted: true,
            ..Default::default()
        };
        let muted_camera = BroadcastState {
            is_camera_on: true,
            ..muted
        };
        notifier.update(muted).await;
        notifier.update(muted_camera).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let updates = server.updates.lock().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].state, muted_camera);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_state_is_not_republished() {
        let server = Arc::new(StateRecorder::default());
        let notifier = notifier(server.clone());
        let deaf = BroadcastState {
            is_deaf: true,
            ..Default::default()
        };

        notifier.update(deaf).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        notifier.update(deaf).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(server.updates.lock().await.len(), 1);
    }
}
