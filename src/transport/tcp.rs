use crate::transport::{
    FrameSink, FrameSource, Stream, Transport, read_length_prefixed, write_length_prefixed,
};
use crate::Error;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

struct TcpSink {
    writer: BufWriter<OwnedWriteHalf>,
    max_frame_len: usize,
}

#[async_trait]
impl FrameSink for TcpSink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        write_length_prefixed(&mut self.writer, frame, self.max_frame_len).await
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct TcpSource {
    reader: BufReader<OwnedReadHalf>,
    max_frame_len: usize,
}

#[async_trait]
impl FrameSource for TcpSource {
    async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        read_length_prefixed(&mut self.reader, self.max_frame_len).await
    }
}

/// Length-prefixed frames over TCP.
///
/// A transport created with [`TcpTransport::bind`] can both accept and connect;
/// one created with [`TcpTransport::new`] can only connect.
pub struct TcpTransport {
    listener: Option<TcpListener>,
    max_frame_len: usize,
}

impl TcpTransport {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            listener: None,
            max_frame_len,
        }
    }

    pub async fn bind<A: ToSocketAddrs>(addr: A, max_frame_len: usize) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| Error::Io(format!("Failed to bind: {err}")))?;

        Ok(Self {
            listener: Some(listener),
            max_frame_len,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Io("transport is not listening".to_string()))?;
        Ok(listener.local_addr()?)
    }

    fn wrap(&self, stream: TcpStream) -> Stream {
        let peer_addr = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%err, peer = %peer_addr, "could not disable Nagle");
        }
        let (read_half, write_half) = stream.into_split();

        Stream::new(
            Box::new(TcpSink {
                writer: BufWriter::new(write_half),
                max_frame_len: self.max_frame_len,
            }),
            Box::new(TcpSource {
                reader: BufReader::new(read_half),
                max_frame_len: self.max_frame_len,
            }),
            peer_addr,
        )
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer_address: &str) -> Result<Stream, Error> {
        let stream = TcpStream::connect(peer_address)
            .await
            .map_err(|err| Error::Io(format!("Failed to connect: {err}")))?;
        tracing::debug!(peer = %peer_address, "tcp connected");
        Ok(self.wrap(stream))
    }

    async fn accept(&self) -> Result<Stream, Error> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Io("transport is not listening".to_string()))?;
        let (stream, addr) = listener
            .accept()
            .await
            .map_err(|err| Error::Io(format!("Failed to accept: {err}")))?;
        tracing::debug!(peer = %addr, "tcp accepted");
        Ok(self.wrap(stream))
    }
}
