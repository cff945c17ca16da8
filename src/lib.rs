mod crypto;

mod error;
pub use error::Error;

mod config;
pub use config::{SessionConfig, SkippedKeyPolicy};

mod types;
pub use types::X25519PublicKey;
pub(crate) use types::X25519Secret;

pub mod wipe;

mod identity;
pub use identity::*;

pub mod transport;

pub mod wire;

mod handshake;
pub use handshake::*;

mod ratchet;
pub use ratchet::*;

mod lifecycle;
pub use lifecycle::*;
