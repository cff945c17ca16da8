/// Errors that can occur while pairing devices or exchanging messages.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// The operating system randomness source could not produce key material.
    #[error("Key generation failed: randomness source unavailable")]
    KeyGeneration,

    /// No device identity has been created on this installation.
    #[error("No device identity exists")]
    NoIdentity,

    /// The stored identity failed integrity verification.
    #[error("Stored identity is corrupt: {0}")]
    CorruptIdentity(String),

    /// An identity already exists and must be reset before a new one is created.
    #[error("A device identity already exists")]
    IdentityExists,

    /// The peer did not complete the handshake within the configured bound.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// A signature, key confirmation or message tag did not verify.
    #[error("Authentication failed")]
    AuthenticationFailure,

    /// The underlying byte stream ended.
    #[error("Transport closed")]
    TransportClosed,

    /// The message counter was already consumed or its key has been wiped.
    #[error("Replayed message counter {counter}")]
    Replay { counter: u64 },

    /// The message counter jumps further ahead than the reordering window allows.
    #[error("Counter {counter} is beyond the reordering window of {window}")]
    OutOfOrderGapExceeded { counter: u64, window: u32 },

    /// The session was closed and its keys wiped.
    #[error("Session closed")]
    SessionClosed,

    /// The plaintext exceeds the configured maximum message size.
    #[error("Message of {size} bytes exceeds the maximum of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// The operation is not valid in the current state, such as reusing a
    /// finished handshake.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// There is no conversation with the given peer.
    #[error("Unknown peer")]
    UnknownPeer,

    /// Bytes received from the wire could not be parsed.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// A cryptographic primitive reported an internal failure.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Storage access failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::CorruptIdentity(value.to_string())
    }
}
