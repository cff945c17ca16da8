use crate::identity::Fingerprint;
use crate::ratchet::ExpiryPolicy;
use crate::wipe::SecretBuffer;
use crate::{Error, Trust};
use std::time::Duration;

pub type MessageId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageDirection {
    Sent,
    Received,
}

/// A plaintext held for display. The buffer zeroizes itself when the message
/// is dropped from its conversation.
pub(crate) struct StoredMessage {
    pub(crate) direction: MessageDirection,
    pub(crate) plaintext: SecretBuffer,
    pub(crate) policy: Option<ExpiryPolicy>,
    pub(crate) stored_at: u64,
}

impl StoredMessage {
    pub(crate) fn is_expired_at(&self, now_millis: u64) -> bool {
        self.policy
            .is_some_and(|policy| policy.is_expired_at(now_millis))
    }

    pub(crate) fn summary(&self, id: MessageId, now_millis: u64) -> MessageSummary {
        MessageSummary {
            id,
            direction: self.direction,
            stored_at: self.stored_at,
            len: self.plaintext.len(),
            policy: self.policy,
            time_remaining: self
                .policy
                .and_then(|policy| policy.expires_at())
                .map(|expires_at| Duration::from_millis(expires_at.saturating_sub(now_millis))),
        }
    }
}

/// What a conversation view needs to list a message without reading it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: MessageId,
    pub direction: MessageDirection,
    /// Milliseconds since the Unix epoch.
    pub stored_at: u64,
    pub len: usize,
    pub policy: Option<ExpiryPolicy>,
    /// Time left before a timed message is wiped. `None` for messages without
    /// a deadline.
    pub time_remaining: Option<Duration>,
}

/// Notifications from the lifecycle manager. None of them carry plaintext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected {
        peer: Fingerprint,
        trust: Trust,
    },
    Received {
        peer: Fingerprint,
        id: MessageId,
        policy: Option<ExpiryPolicy>,
    },
    /// A frame from the peer could not be decrypted. The session state is
    /// unchanged.
    Undeliverable {
        peer: Fingerprint,
        error: Error,
    },
    Expired {
        peer: Fingerprint,
        ids: Vec<MessageId>,
    },
    Disconnected {
        peer: Fingerprint,
    },
    ChatWiped {
        peer: Fingerprint,
    },
}
