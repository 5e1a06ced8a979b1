//! Per-connection endpoint.
//!
//! An endpoint owns one byte-stream connection. It frames outgoing JSON
//! documents through a writer task, parses incoming lines on a reader task,
//! and reports parsed objects and lifecycle changes as [`EndpointEvent`]s in
//! wire order. Malformed input is logged and discarded; the connection stays
//! up unless the transport itself fails.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::framing;
use crate::TransportError;

/// Lifecycle and data events emitted by an endpoint, in wire order.
#[derive(Debug)]
pub enum EndpointEvent {
    /// The connection is up.
    Connected,
    /// One well-formed top-level JSON object arrived.
    ObjectReceived(serde_json::Value),
    /// The peer closed the connection or the socket failed terminally.
    Disconnected,
    /// A transport-level error occurred.
    Error(TransportError),
}

/// Sending half of an endpoint.
///
/// `send` enqueues a full document for transmission and returns without
/// waiting for acknowledgement. The handle is the unit held (weakly) by
/// signal subscriptions; dropping every handle shuts the writer down.
#[derive(Debug)]
pub struct EndpointHandle {
    outbound: mpsc::UnboundedSender<serde_json::Value>,
    peer: Option<SocketAddr>,
}

impl EndpointHandle {
    /// Enqueue a document for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the connection is gone.
    pub fn send(&self, doc: serde_json::Value) -> Result<(), TransportError> {
        self.outbound.send(doc).map_err(|_| TransportError::Closed)
    }

    /// Address of the remote peer, when known.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Factory for endpoint task pairs.
pub struct Endpoint;

impl Endpoint {
    /// Start an endpoint over a TCP stream.
    #[must_use]
    pub fn start_tcp(stream: TcpStream) -> (EndpointHandle, mpsc::UnboundedReceiver<EndpointEvent>) {
        let peer = stream.peer_addr().ok();
        Self::start(stream, peer)
    }

    /// Start an endpoint over any byte stream.
    ///
    /// Spawns a writer task draining the outbound queue and a reader task
    /// parsing newline-delimited documents. The first emitted event is
    /// [`EndpointEvent::Connected`].
    pub fn start<S>(
        stream: S,
        peer: Option<SocketAddr>,
    ) -> (EndpointHandle, mpsc::UnboundedReceiver<EndpointEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let _ = event_tx.send(EndpointEvent::Connected);

        tokio::spawn(write_loop(write_half, outbound_rx, event_tx.clone()));
        tokio::spawn(read_loop(read_half, event_tx));

        (
            EndpointHandle {
                outbound: outbound_tx,
                peer,
            },
            event_rx,
        )
    }
}

async fn write_loop<W>(
    write_half: W,
    mut outbound: mpsc::UnboundedReceiver<serde_json::Value>,
    events: mpsc::UnboundedSender<EndpointEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(write_half);
    while let Some(doc) = outbound.recv().await {
        let frame = match framing::encode_frame(&doc) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("dropping unserializable outgoing document: {}", e);
                continue;
            }
        };
        if let Err(e) = write_and_flush(&mut writer, &frame).await {
            let _ = events.send(EndpointEvent::Error(TransportError::Io(e)));
            break;
        }
    }
    // Every handle is gone (or the socket failed); signal EOF to the peer so
    // it can observe the endpoint as destroyed.
    let _ = writer.shutdown().await;
}

async fn write_and_flush<W>(writer: &mut BufWriter<W>, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn read_loop<R>(read_half: R, events: mpsc::UnboundedSender<EndpointEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                let _ = events.send(EndpointEvent::Disconnected);
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                match framing::decode_frame(trimmed) {
                    Ok(doc) => {
                        if events.send(EndpointEvent::ObjectReceived(doc)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("discarding malformed document: {}", e);
                    }
                }
            }
            Err(e) => {
                let _ = events.send(EndpointEvent::Error(TransportError::Io(e)));
                let _ = events.send(EndpointEvent::Disconnected);
                break;
            }
        }
    }
}
