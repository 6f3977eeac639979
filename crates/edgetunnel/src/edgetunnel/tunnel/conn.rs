use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncWriteExt, ReadHalf},
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};

use crate::edgetunnel::tunnel::{
    auth::AuthError,
    packet::{Annotations, Packet, PacketKind},
    protocol::{self, ProtocolError},
    transport::BoxedStream,
};

// Frames queued ahead of the writer task before `send` waits.
const OUTBOUND_QUEUE_DEPTH: usize = 1024;
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("empty tunnel id")]
    EmptyId,
    #[error("tunnel id {0} collides with the local peer id")]
    SelfId(String),
    #[error("id {0} of tunnel already exists")]
    AlreadyExists(String),
    #[error("unexpected {got} packet during {stage}")]
    UnexpectedPacket {
        stage: &'static str,
        got: PacketKind,
    },
    #[error("remote channel closed: {0}")]
    RemoteClosed(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// A bidirectional, ordered packet stream to one neighbor.
///
/// `send` may be called concurrently; `recv` is only driven by the
/// connection's dispatch loop.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn send(&self, pkt: Packet) -> Result<(), TunnelError>;
    async fn recv(&self) -> Result<Packet, TunnelError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Forward route advertisements to this neighbor.
    pub send_route_change: bool,
    /// Use this neighbor when no explicit route matches.
    pub is_default_out: bool,
}

/// A tunnel that finished the handshake and is bound to a neighbor id.
pub struct ConnectedTunnel {
    id: String,
    tunnel: Arc<dyn Tunnel>,
    options: TunnelOptions,
    annotations_sent: Annotations,
}

impl std::fmt::Debug for ConnectedTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedTunnel")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConnectedTunnel {
    pub fn new(
        id: impl Into<String>,
        tunnel: Arc<dyn Tunnel>,
        options: TunnelOptions,
        annotations_sent: Annotations,
    ) -> Self {
        Self {
            id: id.into(),
            tunnel,
            options,
            annotations_sent,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> TunnelOptions {
        self.options
    }

    pub fn annotations_sent(&self) -> &Annotations {
        &self.annotations_sent
    }

    pub async fn send(&self, pkt: Packet) -> Result<(), TunnelError> {
        self.tunnel.send(pkt).await
    }

    pub async fn recv(&self) -> Result<Packet, TunnelError> {
        self.tunnel.recv().await
    }
}

/// [`Tunnel`] over any bidirectional byte stream (a yamux stream, a QUIC
/// bi-stream, an in-memory duplex).
///
/// A dedicated task owns the write half, so a dropped `send` future never
/// leaves a partial frame on the wire.
pub struct StreamTunnel {
    outbound: mpsc::Sender<Bytes>,
    reader: Mutex<ReadHalf<BoxedStream>>,
    closing: watch::Sender<bool>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTunnel {
    pub fn new(stream: BoxedStream) -> Self {
        let (rd, mut wr) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_DEPTH);
        let (closing, mut closing_rx) = watch::channel(false);

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(err) = wr.write_all(&frame).await {
                            tracing::debug!(err=%err, "tunnel: stream write failed");
                            return;
                        }
                        if rx.is_empty() && wr.flush().await.is_err() {
                            return;
                        }
                    }
                    _ = closing_rx.changed() => {
                        rx.close();
                        while let Some(frame) = rx.recv().await {
                            if wr.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                        break;
                    }
                }
            }
            let _ = wr.shutdown().await;
        });

        Self {
            outbound: tx,
            reader: Mutex::new(rd),
            closing,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Flushes queued frames and shuts the write side down.
    pub async fn close(&self) {
        let _ = self.closing.send(true);
        let task = self.writer.lock().await.take();
        if let Some(task) = task {
            if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::debug!("tunnel: stream writer did not drain in time");
            }
        }
    }
}

#[async_trait]
impl Tunnel for StreamTunnel {
    async fn send(&self, pkt: Packet) -> Result<(), TunnelError> {
        let frame = protocol::encode_frame(&pkt)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn recv(&self) -> Result<Packet, TunnelError> {
        let mut rd = self.reader.lock().await;
        Ok(protocol::read_packet(&mut *rd).await?)
    }
}
