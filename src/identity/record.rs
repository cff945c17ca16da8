/// On-disk form of a device identity.
///
/// The private keys travel only inside `sealed_secret`, which is AES-256-GCM-SIV
/// ciphertext (tag appended) under the installation's storage key.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct IdentityRecord {
    #[prost(uint32, tag = "1")]
    pub(crate) version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub(crate) public_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub(crate) nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub(crate) sealed_secret: Vec<u8>,
    #[prost(uint64, tag = "5")]
    pub(crate) created_at: u64,
}
