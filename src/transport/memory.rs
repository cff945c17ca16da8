//! In-process transport over tokio channels.

use crate::transport::{FrameSink, FrameSource, Stream, Transport};
use crate::Error;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        let tx = self.tx.as_ref().ok_or(Error::TransportClosed)?;
        tx.send(frame.to_vec()).map_err(|_| Error::TransportClosed)
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        self.rx.recv().await.ok_or(Error::TransportClosed)
    }
}

fn connected(a_addr: &str, b_addr: &str) -> (Stream, Stream) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = Stream::new(
        Box::new(MemorySink { tx: Some(a_tx) }),
        Box::new(MemorySource { rx: a_rx }),
        b_addr,
    );
    let b = Stream::new(
        Box::new(MemorySink { tx: Some(b_tx) }),
        Box::new(MemorySource { rx: b_rx }),
        a_addr,
    );
    (a, b)
}

/// Two streams wired to each other.
pub fn pair() -> (Stream, Stream) {
    connected("memory:a", "memory:b")
}

type Listeners = HashMap<String, (u64, mpsc::UnboundedSender<Stream>)>;

#[derive(Default)]
struct Registry {
    listeners: Listeners,
    next_id: u64,
}

/// A set of in-process endpoints that can reach each other by address.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` and returns a transport listening on it. A later
    /// bind of the same address replaces the earlier listener.
    pub fn bind(&self, address: impl Into<String>) -> MemoryTransport {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.insert(address.clone(), (id, tx));
        drop(registry);

        MemoryTransport {
            network: self.clone(),
            address,
            id,
            incoming: tokio::sync::Mutex::new(rx),
        }
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    address: String,
    id: u64,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut registry = self.network.registry.lock();
        if registry
            .listeners
            .get(&self.address)
            .is_some_and(|(id, _)| *id == self.id)
        {
            registry.listeners.remove(&self.address);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, peer_address: &str) -> Result<Stream, Error> {
        let listener = self
            .network
            .registry
            .lock()
            .listeners
            .get(peer_address)
            .map(|(_, tx)| tx.clone())
            .ok_or_else(|| Error::Io(format!("connection refused: {peer_address}")))?;

        let (local, remote) = connected(&self.address, peer_address);
        listener
            .send(remote)
            .map_err(|_| Error::Io(format!("connection refused: {peer_address}")))?;
        Ok(local)
    }

    async fn accept(&self) -> Result<Stream, Error> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::TransportClosed)
    }
}
