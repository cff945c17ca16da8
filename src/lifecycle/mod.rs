//! Self-destructing message storage on top of ratchet sessions.
//!
//! The manager owns one conversation per paired peer: the session, the write
//! half of its stream, a task draining the read half, and the plaintexts kept
//! for display. Expiry is enforced by sweeps that run on a timer and on every
//! foreground transition, whether or not a message was ever opened.

mod message;
pub use message::*;

use crate::config::SessionConfig;
use crate::handshake::{HandshakeEngine, PeerVerification, Role};
use crate::identity::{DeviceIdentity, Fingerprint};
use crate::ratchet::{CloseReason, ExpiryPolicy, MessageEnvelope, RatchetSession, now_millis};
use crate::transport::{FrameSink, FrameSource, Stream, Transport};
use crate::wipe::SecretBuffer;
use crate::wire::Frame;
use crate::Error;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use zeroize::Zeroizing;

struct Conversation {
    session: Arc<RatchetSession>,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    messages: Mutex<BTreeMap<MessageId, StoredMessage>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Conversation {
    /// Wipes every stored plaintext, closes the session and stops the
    /// receive task. Safe to call more than once.
    async fn shutdown(&self, reason: CloseReason) {
        self.messages.lock().clear();
        self.session.close(reason);

        if let Some(receiver) = self.receiver.lock().take() {
            receiver.abort();
        }

        if let Err(err) = self.sink.lock().await.close().await {
            tracing::debug!(%err, "closing stream after shutdown");
        }
    }
}

/// A peer slot. `Wiped` holds no keys and no messages; it only makes later
/// calls for that peer report a closed session until a new handshake.
#[derive(Clone)]
enum Slot {
    Open(Arc<Conversation>),
    Wiped,
}

impl Slot {
    fn open(&self) -> Option<&Arc<Conversation>> {
        match self {
            Slot::Open(conversation) => Some(conversation),
            Slot::Wiped => None,
        }
    }
}

struct Inner {
    identity: Arc<DeviceIdentity>,
    config: SessionConfig,
    conversations: RwLock<HashMap<Fingerprint, Slot>>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    next_id: AtomicU64,
}

/// Aborts the background sweep when dropped.
pub struct SweeperHandle(JoinHandle<()>);

impl SweeperHandle {
    pub fn stop(self) {}
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Entry point for everything the chat surface does: connect, send, read,
/// expire and wipe.
#[derive(Clone)]
pub struct MessageLifecycleManager {
    inner: Arc<Inner>,
}

impl MessageLifecycleManager {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            inner: Arc::new(Inner {
                identity,
                config,
                conversations: RwLock::new(HashMap::new()),
                events,
                next_id: AtomicU64::new(1),
            }),
        };
        (manager, events_rx)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// "Connect": opens a stream to `address` and runs the handshake as
    /// initiator.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        address: &str,
        verification: PeerVerification,
    ) -> Result<Fingerprint, Error> {
        let stream = transport.connect(address).await?;
        self.establish(stream, Role::Initiator, verification).await
    }

    /// Waits for the next inbound stream and runs the handshake as responder.
    pub async fn accept(
        &self,
        transport: &dyn Transport,
        verification: PeerVerification,
    ) -> Result<Fingerprint, Error> {
        let stream = transport.accept().await?;
        self.establish(stream, Role::Responder, verification).await
    }

    /// Runs the handshake over an already open stream and registers the
    /// resulting session. A previous session with the same peer is closed and
    /// replaced; its stored messages carry over.
    pub async fn establish(
        &self,
        mut stream: Stream,
        role: Role,
        verification: PeerVerification,
    ) -> Result<Fingerprint, Error> {
        let mut engine = HandshakeEngine::new(
            self.inner.identity.clone(),
            role,
            verification,
            &self.inner.config,
        );
        let outcome = match engine.run(&mut stream).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(close_err) = stream.close().await {
                    tracing::debug!(err = %close_err, "closing stream after failed handshake");
                }
                return Err(err);
            }
        };

        let session = Arc::new(RatchetSession::new(outcome, &self.inner.config)?);
        let peer = session.peer_fingerprint();
        let trust = session.trust();
        let (sink, source) = stream.into_split();

        let conversation = Arc::new(Conversation {
            session,
            sink: tokio::sync::Mutex::new(sink),
            messages: Mutex::new(BTreeMap::new()),
            receiver: Mutex::new(None),
        });

        let previous = self
            .inner
            .conversations
            .write()
            .insert(peer, Slot::Open(conversation.clone()));
        if let Some(Slot::Open(previous)) = previous {
            let carried = std::mem::take(&mut *previous.messages.lock());
            conversation.messages.lock().extend(carried);
            previous.shutdown(CloseReason::Local).await;
            tracing::info!(peer = %peer.short_id(), "replaced existing session");
        }

        let receiver = tokio::spawn(run_receiver(
            Arc::downgrade(&self.inner),
            peer,
            conversation.clone(),
            source,
        ));
        *conversation.receiver.lock() = Some(receiver);

        self.emit(LifecycleEvent::Connected { peer, trust });
        Ok(peer)
    }

    pub fn peers(&self) -> Vec<Fingerprint> {
        self.inner
            .conversations
            .read()
            .iter()
            .filter(|(_, slot)| slot.open().is_some())
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn session(&self, peer: &Fingerprint) -> Result<Arc<RatchetSession>, Error> {
        Ok(self.conversation(peer)?.session.clone())
    }

    /// Encrypts and transmits one message.
    ///
    /// The sender keeps its own copy for display unless the message is
    /// wipe-on-read; the returned id names that copy.
    pub async fn send(
        &self,
        peer: &Fingerprint,
        plaintext: &[u8],
        policy: Option<ExpiryPolicy>,
    ) -> Result<Option<MessageId>, Error> {
        let conversation = self.conversation(peer)?;

        // Counters must reach the wire in the order they were assigned, so the
        // sink stays locked from encryption until the frame is written. The
        // session lock itself is released before the await.
        let mut sink = conversation.sink.lock().await;
        let envelope = conversation.session.encrypt_with_policy(plaintext, policy)?;
        let frame = Frame::Message(envelope).to_bytes();

        let sent = sink.send(&frame).await;
        drop(sink);
        if let Err(err) = sent {
            if err == Error::TransportClosed {
                conversation.session.close(CloseReason::Transport);
            }
            return Err(err);
        }

        if policy == Some(ExpiryPolicy::WipeOnRead) {
            return Ok(None);
        }

        let id = self.store(
            &conversation,
            MessageDirection::Sent,
            Zeroizing::new(plaintext.to_vec()),
            policy,
        );
        Ok(Some(id))
    }

    /// Decrypts an envelope from `peer` and stores the plaintext under its
    /// expiry policy.
    pub fn receive(&self, peer: &Fingerprint, envelope: &MessageEnvelope) -> Result<MessageId, Error> {
        let conversation = self.conversation(peer)?;
        self.receive_on(peer, &conversation, envelope)
    }

    fn receive_on(
        &self,
        peer: &Fingerprint,
        conversation: &Conversation,
        envelope: &MessageEnvelope,
    ) -> Result<MessageId, Error> {
        let plaintext = conversation.session.decrypt(envelope)?;
        let policy = envelope.policy();
        let id = self.store(conversation, MessageDirection::Received, plaintext, policy);

        self.emit(LifecycleEvent::Received {
            peer: *peer,
            id,
            policy,
        });
        Ok(id)
    }

    fn store(
        &self,
        conversation: &Conversation,
        direction: MessageDirection,
        plaintext: SecretBuffer,
        policy: Option<ExpiryPolicy>,
    ) -> MessageId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        conversation.messages.lock().insert(
            id,
            StoredMessage {
                direction,
                plaintext,
                policy,
                stored_at: now_millis(),
            },
        );
        id
    }

    /// Returns a copy of a stored plaintext.
    ///
    /// Wipe-on-read messages are gone after the first successful read. An
    /// expired message reads as `None` and is wiped on the spot, even if no
    /// sweep has run yet.
    pub fn read(&self, peer: &Fingerprint, id: MessageId) -> Result<Option<SecretBuffer>, Error> {
        let conversation = self.conversation(peer)?;
        let mut messages = conversation.messages.lock();

        let Some(message) = messages.get(&id) else {
            return Ok(None);
        };

        if message.is_expired_at(now_millis()) {
            messages.remove(&id);
            drop(messages);
            self.emit(LifecycleEvent::Expired {
                peer: *peer,
                ids: vec![id],
            });
            return Ok(None);
        }

        let plaintext = Zeroizing::new(message.plaintext.to_vec());
        if message.policy == Some(ExpiryPolicy::WipeOnRead) {
            messages.remove(&id);
            tracing::debug!(peer = %peer.short_id(), id, "wiped message after read");
        }

        Ok(Some(plaintext))
    }

    /// Lists the messages still readable in a conversation, oldest first.
    pub fn messages(&self, peer: &Fingerprint) -> Result<Vec<MessageSummary>, Error> {
        let conversation = self.conversation(peer)?;
        let now = now_millis();

        Ok(conversation
            .messages
            .lock()
            .iter()
            .filter(|(_, message)| !message.is_expired_at(now))
            .map(|(id, message)| message.summary(*id, now))
            .collect())
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(now_millis())
    }

    /// Wipes every message whose deadline is at or before `now_millis`.
    /// Returns how many were wiped.
    pub fn sweep_at(&self, now_millis: u64) -> usize {
        let conversations: Vec<(Fingerprint, Arc<Conversation>)> = self
            .inner
            .conversations
            .read()
            .iter()
            .filter_map(|(peer, slot)| Some((*peer, slot.open()?.clone())))
            .collect();

        let mut total = 0;
        for (peer, conversation) in conversations {
            let mut expired = Vec::new();
            conversation.messages.lock().retain(|id, message| {
                let keep = !message.is_expired_at(now_millis);
                if !keep {
                    expired.push(*id);
                }
                keep
            });

            if !expired.is_empty() {
                total += expired.len();
                self.emit(LifecycleEvent::Expired { peer, ids: expired });
            }
        }

        if total > 0 {
            tracing::debug!(wiped = total, "expiry sweep");
        }
        total
    }

    /// Called when the app returns to the foreground.
    pub fn on_foreground(&self) -> usize {
        self.sweep()
    }

    /// Starts the periodic expiry sweep. The task stops when the handle is
    /// dropped or every manager clone is gone.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;

        SweeperHandle(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                MessageLifecycleManager { inner }.sweep();
            }
        }))
    }

    /// "Wipe chat": destroys every stored message and the session for `peer`.
    ///
    /// Until a fresh handshake with the peer, calls naming it fail with
    /// [`Error::SessionClosed`]. Wiping a peer with no conversation is not an
    /// error.
    pub async fn wipe_chat(&self, peer: &Fingerprint) {
        let conversation = {
            let mut conversations = self.inner.conversations.write();
            match conversations.get(peer) {
                Some(Slot::Open(_)) => conversations.insert(*peer, Slot::Wiped),
                _ => None,
            }
        };
        let Some(Slot::Open(conversation)) = conversation else {
            return;
        };

        conversation.shutdown(CloseReason::Local).await;
        tracing::info!(peer = %peer.short_id(), "chat wiped");
        self.emit(LifecycleEvent::ChatWiped { peer: *peer });
    }

    /// Wipes every conversation, as on app termination.
    pub async fn wipe_all(&self) {
        for peer in self.peers() {
            self.wipe_chat(&peer).await;
        }
    }

    fn conversation(&self, peer: &Fingerprint) -> Result<Arc<Conversation>, Error> {
        match self.inner.conversations.read().get(peer) {
            Some(Slot::Open(conversation)) => Ok(conversation.clone()),
            Some(Slot::Wiped) => Err(Error::SessionClosed),
            None => Err(Error::UnknownPeer),
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::debug!("lifecycle event dropped, no listener");
        }
    }
}

async fn run_receiver(
    inner: Weak<Inner>,
    peer: Fingerprint,
    conversation: Arc<Conversation>,
    mut source: Box<dyn FrameSource>,
) {
    loop {
        let frame = match source.receive().await {
            Ok(frame) => frame,
            Err(Error::TransportClosed) => break,
            Err(err) => {
                tracing::warn!(peer = %peer.short_id(), %err, "dropping stream");
                break;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = MessageLifecycleManager { inner };

        let result = match Frame::from_bytes(&frame) {
            Ok(Frame::Message(envelope)) => manager.receive_on(&peer, &conversation, &envelope),
            Ok(_) => Err(Error::Malformed("handshake frame on open session".to_string())),
            Err(err) => Err(err),
        };

        if let Err(error) = result {
            tracing::warn!(peer = %peer.short_id(), %error, "undeliverable message");
            manager.emit(LifecycleEvent::Undeliverable { peer, error });
        }
    }

    conversation.session.close(CloseReason::Transport);

    if let Some(inner) = inner.upgrade() {
        let manager = MessageLifecycleManager { inner };
        let current = manager
            .inner
            .conversations
            .read()
            .get(&peer)
            .and_then(|slot| slot.open())
            .is_some_and(|registered| Arc::ptr_eq(registered, &conversation));
        if current {
            tracing::info!(peer = %peer.short_id(), "peer disconnected");
            manager.emit(LifecycleEvent::Disconnected { peer });
        }
    }
}
