mod x25519;
pub use x25519::X25519PublicKey;
pub(crate) use x25519::X25519Secret;
