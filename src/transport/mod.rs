//! Byte-stream transport between two connected devices.
//!
//! The secure session never looks inside the transport: it only needs ordered,
//! reliable frames and a distinguishable end of stream. Any error that means
//! "the peer is gone" surfaces as [`Error::TransportClosed`].

pub mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::Error;
use async_trait::async_trait;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write half of a stream.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends one frame. Frames arrive in order and unmodified, or not at all.
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Flushes and ends the outgoing direction.
    async fn close(&mut self) -> Result<(), Error>;
}

/// Read half of a stream.
#[async_trait]
pub trait FrameSource: Send {
    /// Waits for the next frame. Returns [`Error::TransportClosed`] once the
    /// peer has gone away; every later call does the same.
    async fn receive(&mut self) -> Result<Vec<u8>, Error>;
}

/// An open, bidirectional connection to one peer.
pub struct Stream {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
    peer_addr: String,
}

impl Stream {
    pub fn new(
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        peer_addr: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            source,
            peer_addr: peer_addr.into(),
        }
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        self.sink.send(frame).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        self.source.receive().await
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.sink.close().await
    }

    /// Separates the halves so reads and writes can be driven from different
    /// tasks.
    pub fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// Opens streams to peers and accepts streams from them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, peer_address: &str) -> Result<Stream, Error>;

    async fn accept(&self) -> Result<Stream, Error>;
}

fn map_io_error(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => Error::TransportClosed,
        _ => err.into(),
    }
}

/// Writes `data` behind a 4-byte big-endian length.
pub(crate) async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    max_len: usize,
) -> Result<(), Error> {
    if data.len() > max_len {
        return Err(Error::MessageTooLarge {
            size: data.len(),
            max: max_len,
        });
    }

    let len = u32::try_from(data.len()).map_err(|_| Error::MessageTooLarge {
        size: data.len(),
        max: max_len,
    })?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(map_io_error)?;
    writer.write_all(data).await.map_err(map_io_error)?;
    writer.flush().await.map_err(map_io_error)?;
    Ok(())
}

/// Reads one frame written by [`write_length_prefixed`].
pub(crate) async fn read_length_prefixed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Vec<u8>, Error> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(map_io_error)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max_len {
        return Err(Error::Malformed(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(map_io_error)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_length_prefixed_framing() {
        let mut wire = Vec::new();
        write_length_prefixed(&mut wire, b"first", 64).await.unwrap();
        write_length_prefixed(&mut wire, b"", 64).await.unwrap();
        assert_eq!(&wire[0..4], &5u32.to_be_bytes());

        let mut reader = wire.as_slice();
        assert_eq!(read_length_prefixed(&mut reader, 64).await.unwrap(), b"first");
        assert!(read_length_prefixed(&mut reader, 64).await.unwrap().is_empty());
        assert_eq!(
            read_length_prefixed(&mut reader, 64).await,
            Err(Error::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let mut wire = Vec::new();
        assert_eq!(
            write_length_prefixed(&mut wire, &[0u8; 65], 64).await,
            Err(Error::MessageTooLarge { size: 65, max: 64 })
        );

        let mut wire = 1000u32.to_be_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 1000]);
        let mut reader = wire.as_slice();
        assert!(matches!(
            read_length_prefixed(&mut reader, 64).await,
            Err(Error::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed_stream() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let mut reader = wire.as_slice();

        assert_eq!(
            read_length_prefixed(&mut reader, 64).await,
            Err(Error::TransportClosed)
        );
    }
}
