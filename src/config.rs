use std::time::Duration;

/// What happens to message keys that a receiver derives while skipping ahead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SkippedKeyPolicy {
    /// Keep skipped keys while they stay inside the reordering window, so late
    /// messages can still be opened.
    #[default]
    RetainWithinWindow,
    /// Wipe skipped keys as soon as the chain moves past them. A late message
    /// is then reported as a replay.
    WipeOnAdvance,
}

/// Tunables shared by the handshake, the ratchet and the message lifecycle.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Maximum number of message keys one decrypt may derive ahead of the chain.
    pub reorder_window: u32,
    /// Retention rule for keys derived while skipping ahead.
    pub skipped_key_policy: SkippedKeyPolicy,
    /// Upper bound on a full handshake, after which it aborts.
    pub handshake_timeout: Duration,
    /// Period of the background expiry sweep.
    pub sweep_interval: Duration,
    /// Largest plaintext accepted by `encrypt`.
    pub max_message_size: usize,
    /// Domain-separation label mixed into every key derivation.
    pub protocol_info: Vec<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reorder_window: 64,
            skipped_key_policy: SkippedKeyPolicy::default(),
            handshake_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(1),
            max_message_size: 64 * 1024,
            protocol_info: b"PeerSeal-E2E-v1".to_vec(),
        }
    }
}

/// Envelope bytes that surround the ciphertext: header, length, tag and MAC.
const FRAME_OVERHEAD: usize = 256;

impl SessionConfig {
    /// Largest frame a transport should accept for this configuration.
    pub fn max_frame_len(&self) -> usize {
        self.max_message_size + FRAME_OVERHEAD
    }
}
