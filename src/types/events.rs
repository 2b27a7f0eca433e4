use std::sync::Arc;
use tokio::sync::broadcast;

pub use meshcore::events::*;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Call lifecycle
    (call_joined, Arc<CallJoined>),
    (call_left, Arc<CallLeft>),
    (invitations, Arc<PendingInvitations>),

    // Roster
    (participant_joined, Arc<ParticipantJoined>),
    (participant_left, Arc<ParticipantLeft>),
    (session_flags, Arc<SessionFlagsChanged>),

    // Connections and media
    (peer_phase, Arc<PeerPhaseChanged>),
    (remote_track, Arc<RemoteTrackAttached>),
    (talking, Arc<TalkingChanged>),
    (warning, Arc<CallWarning>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    // Sending only fails when nobody is subscribed, which is fine.
    pub(crate) fn publish<T>(sender: &broadcast::Sender<Arc<T>>, event: T) {
        let _ = sender.send(Arc::new(event));
    }
}
