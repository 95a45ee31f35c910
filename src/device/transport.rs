//! Byte-stream transports to an alpha device
//!
//! The device speaks SLIP-framed RPC over a single serial line. A
//! [`TransportConnector`] knows how to (re)open that line; the
//! [`DeviceTransport`] it yields sends and receives whole frames.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::protocol::slip::{self, SlipDecoder};
use crate::types::{HsmError, Result};

/// An open, framed connection to one device
#[async_trait]
pub trait DeviceTransport: Send {
    /// Write one frame
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()>;

    /// Read the next complete frame
    async fn recv_frame(&mut self) -> Result<Vec<u8>>;
}

/// Opens (and reopens) the transport for one device
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DeviceTransport>>;

    /// Name used in logs and status output
    fn describe(&self) -> String;
}

/// SLIP framing over any split byte stream
pub struct SlipStream<R, W> {
    reader: R,
    writer: W,
    decoder: SlipDecoder,
    read_buf: Vec<u8>,
}

impl<R, W> SlipStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            decoder: SlipDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }
}

#[async_trait]
impl<R, W> DeviceTransport for SlipStream<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer.write_all(&slip::encode(payload)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                return Err(HsmError::Transport("device closed the stream".into()));
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }
}

/// Serial device node, e.g. `/dev/ttyUSB0`.
///
/// Line settings (921600 baud, raw mode) are applied outside the gateway.
/// Reads and writes use separate handles so a stalled read never holds up
/// the next request's write.
pub struct SerialConnector {
    path: String,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TransportConnector for SerialConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceTransport>> {
        let reader = tokio::fs::OpenOptions::new().read(true).open(&self.path).await?;
        let writer = tokio::fs::OpenOptions::new().write(true).open(&self.path).await?;
        debug!(path = %self.path, "Opened serial device");
        Ok(Box::new(SlipStream::new(reader, writer)))
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

/// Device reached through a TCP serial bridge
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn DeviceTransport>> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        debug!(addr = %self.addr, "Connected to device bridge");
        Ok(Box::new(SlipStream::new(reader, writer)))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slip_stream_frames_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let mut near = SlipStream::new(client_r, client_w);
        let mut far = SlipStream::new(server_r, server_w);

        near.send_frame(&[1, slip::END, 3]).await.unwrap();
        assert_eq!(far.recv_frame().await.unwrap(), vec![1, slip::END, 3]);

        far.send_frame(&[9; 200]).await.unwrap();
        assert_eq!(near.recv_frame().await.unwrap(), vec![9; 200]);
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let reply = slip::encode(&[0, 0, 0, 3, 0, 0, 0, 7, 0, 0, 0, 0]);
        let (head, tail) = reply.split_at(5);
        let reader = tokio_test::io::Builder::new()
            .read(&[slip::END, slip::END])
            .read(head)
            .read(tail)
            .build();
        let writer = tokio_test::io::Builder::new()
            .write(&slip::encode(&[0, 0, 0, 3, 0, 0, 0, 7]))
            .build();

        let mut stream = SlipStream::new(reader, writer);
        stream.send_frame(&[0, 0, 0, 3, 0, 0, 0, 7]).await.unwrap();
        assert_eq!(
            stream.recv_frame().await.unwrap(),
            vec![0, 0, 0, 3, 0, 0, 0, 7, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_closed_stream_is_transport_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let (r, w) = tokio::io::split(client);
        let mut stream = SlipStream::new(r, w);
        assert!(matches!(
            stream.recv_frame().await,
            Err(HsmError::Transport(_))
        ));
    }
}
