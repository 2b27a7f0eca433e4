use crate::calls::{CallEngine, EngineEvent};
use crate::server::{PingRequest, PingResponse, ServerError};
use crate::types::events::{EventBus, ParticipantJoined, ParticipantLeft};
use log::{debug, info, warn};
use meshcore::SessionId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Periodic liveness ticks for one call. The loop only enqueues
/// [`EngineEvent::KeepaliveTick`]; the engine issues the ping itself.
pub(crate) struct Keepalive {
    task: JoinHandle<()>,
}

impl Keepalive {
    pub(crate) fn spawn(
        interval: Duration,
        epoch: u64,
        tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if tx.send(EngineEvent::KeepaliveTick { epoch }).is_err() {
                    debug!(target: "Call/Keepalive", "Engine gone, exiting keepalive loop.");
                    return;
                }
            }
        });
        Self { task }
    }
}

impl Drop for Keepalive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl CallEngine {
    /// Sends a liveness ping carrying the sessions we know about. The answer
    /// comes back as [`EngineEvent::PingCompleted`].
    pub(crate) fn handle_keepalive_tick(&mut self, epoch: u64) {
        let Some(context) = self.state.context() else {
            return;
        };
        if context.epoch() != epoch {
            debug!(target: "Call/Keepalive", "Dropping tick from a previous call");
            return;
        }

        let request = PingRequest {
            conversation_id: context.conversation_id(),
            self_session_id: context.self_session_id(),
            known_session_ids: context.session_ids(),
        };
        debug!(
            target: "Call/Keepalive",
            "Pinging with {} known session(s)",
            request.known_session_ids.len()
        );
        let server = self.server.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = server.ping(request).await;
            let _ = tx.send(EngineEvent::PingCompleted { epoch, result });
        });
    }

    /// Reconcile the roster against the server's answer, then heal the
    /// connection set: drop connections to departed sessions, call sessions
    /// that have none, and restart any that never came up.
    pub(crate) async fn handle_ping_result(
        &mut self,
        epoch: u64,
        result: Result<PingResponse, ServerError>,
    ) {
        let Some(context) = self.state.context_mut() else {
            return;
        };
        if context.epoch() != epoch {
            return;
        }
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(target: "Call/Keepalive", "Keepalive ping failed: {e}");
                return;
            }
        };

        let diff = context.reconcile(&response.active, &response.dropped);
        if !diff.is_empty() {
            info!(
                target: "Call/Keepalive",
                "Roster reconciled: {} added, {} removed",
                diff.added.len(),
                diff.removed.len()
            );
        }
        for session_id in diff.removed {
            self.close_peer(session_id).await;
            EventBus::publish(
                &self.events.participant_left,
                ParticipantLeft { session_id },
            );
        }
        for session_id in &diff.added {
            let member_id = self
                .state
                .context()
                .and_then(|c| c.session(*session_id))
                .and_then(|s| s.member_id);
            EventBus::publish(
                &self.events.participant_joined,
                ParticipantJoined {
                    session_id: *session_id,
                    member_id,
                },
            );
        }

        self.enforce_roster_subset().await;
        self.connect_missing().await;
        self.restart_stalled().await;
    }

    /// Close any connection whose session is no longer in the roster.
    async fn enforce_roster_subset(&mut self) {
        let orphans: Vec<SessionId> = match (self.state.context(), &self.call) {
            (Some(context), Some(call)) => call
                .peers
                .keys()
                .copied()
                .filter(|id| !context.contains(*id))
                .collect(),
            _ => return,
        };
        for session_id in orphans {
            warn!(target: "Call/Keepalive", "Closing connection to {session_id}: not in the roster");
            self.close_peer(session_id).await;
        }
    }

    /// Call every roster session we hold no connection to.
    async fn connect_missing(&mut self) {
        let missing: Vec<SessionId> = match (self.state.context(), &self.call) {
            (Some(context), Some(call)) => context
                .session_ids()
                .into_iter()
                .filter(|id| !call.peers.contains_key(id))
                .collect(),
            _ => return,
        };
        for session_id in missing {
            info!(target: "Call/Keepalive", "No connection to {session_id}, calling");
            self.connect(session_id).await;
        }
    }

    /// Restart connections that have been down longer than the allowed
    /// window, whichever side placed them. This covers connections that
    /// never came up as well as ones that dropped and were never recovered.
    async fn restart_stalled(&mut self) {
        let Some(call) = &self.call else {
            return;
        };
        let limit = self.config.max_unconnected;
        let stalled: Vec<SessionId> = call
            .peers
            .values()
            .filter(|peer| peer.down_for().is_some_and(|down| down > limit))
            .map(|peer| peer.session_id())
            .collect();
        for session_id in stalled {
            warn!(
                target: "Call/Keepalive",
                "Connection to {session_id} down for over {limit:?}, restarting"
            );
            self.restart_peer(session_id).await;
        }
    }
}
