#[macro_use]
extern crate afl;
use peerseal::transport::memory;
use peerseal::wire::Frame;
use peerseal::{
    DeviceIdentity, HandshakeEngine, PeerVerification, RatchetSession, Role, SessionConfig,
};
use std::sync::Arc;

fn get_session() -> RatchetSession {
    let config = SessionConfig::default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Runtime setup failed");

    // The Victim
    let alice = Arc::new(DeviceIdentity::generate().expect("Identity setup failed"));

    // The Attacker context
    let bob = Arc::new(DeviceIdentity::generate().expect("Identity setup failed"));

    let (mut a, mut b) = memory::pair();
    let mut initiator =
        HandshakeEngine::new(alice, Role::Initiator, PeerVerification::Skip, &config);
    let mut responder = HandshakeEngine::new(bob, Role::Responder, PeerVerification::Skip, &config);

    let (outcome, _) = runtime.block_on(async {
        tokio::join!(initiator.run(&mut a), responder.run(&mut b))
    });

    RatchetSession::new(outcome.expect("Handshake failed"), &config).expect("Setup failed")
}

fn main() {
    let session = get_session();

    fuzz!(|data: &[u8]| {
        if let Ok(Frame::Message(envelope)) = Frame::from_bytes(data) {
            let _ = session.decrypt(&envelope);
        }
    });
}
