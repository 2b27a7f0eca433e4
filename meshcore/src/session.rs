//! Remote session bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MemberId, SessionId};

/// Media flags a participant advertises about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionFlags {
    pub is_camera_on: bool,
    pub is_screen_sharing_on: bool,
    pub is_self_muted: bool,
    pub is_deaf: bool,
    pub is_talking: bool,
}

/// One other participant's media presence in the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    pub id: SessionId,
    /// `None` while the session is provisional (known only from a relayed offer).
    pub member_id: Option<MemberId>,
    #[serde(default)]
    pub flags: SessionFlags,
    /// Set when the session was inserted from a relayed message before the
    /// server announced it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub provisional: bool,
    #[serde(default = "Utc::now")]
    pub seen_at: DateTime<Utc>,
}

impl RemoteSession {
    pub fn new(id: SessionId, member_id: MemberId) -> Self {
        Self {
            id,
            member_id: Some(member_id),
            flags: SessionFlags::default(),
            provisional: false,
            seen_at: Utc::now(),
        }
    }

    pub fn provisional(id: SessionId) -> Self {
        Self {
            id,
            member_id: None,
            flags: SessionFlags::default(),
            provisional: true,
            seen_at: Utc::now(),
        }
    }

    pub fn with_flags(mut self, flags: SessionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the advertised flags. Returns true if anything changed.
    pub fn apply_flags(&mut self, flags: SessionFlags) -> bool {
        if self.flags == flags {
            return false;
        }
        self.flags = flags;
        true
    }

    /// Fold a server-reported view of this session into the local one.
    /// Server data always confirms a provisional entry.
    pub fn merge_server_view(&mut self, server: &RemoteSession) {
        if server.member_id.is_some() {
            self.member_id = server.member_id;
        }
        self.flags = server.flags;
        self.provisional = false;
        self.seen_at = Utc::now();
    }
}
