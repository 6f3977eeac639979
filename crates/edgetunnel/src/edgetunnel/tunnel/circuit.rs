use std::{
    future::Future,
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    task::{Context, Poll, ready},
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};

use crate::edgetunnel::tunnel::{
    conn::{ConnectedTunnel, TunnelError},
    connections::Connections,
    packet::{Packet, PacketKind},
};

// Largest payload carried by a single Data packet.
pub const MAX_DATA_CHUNK: usize = 1 << 20;

/// What the dispatch loop hands to a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Delivery {
    Ack { remote_cid: i64, error: String },
    Data(Bytes),
    /// End-of-stream marker: the peer stopped writing.
    Eof,
    /// The peer closed the circuit without an error.
    Closed,
    Error(String),
}

/// Circuit state shared between the [`TunnelConn`] and its slot.
#[derive(Debug)]
pub(crate) struct CircuitShared {
    pub local_peer: String,
    pub local_cid: i64,
    pub remote_peer: String,
    remote_cid: AtomicI64,
    pub tunnel: Arc<ConnectedTunnel>,
    closed: AtomicBool,
}

impl CircuitShared {
    pub fn new(
        local_peer: String,
        local_cid: i64,
        remote_peer: String,
        remote_cid: i64,
        tunnel: Arc<ConnectedTunnel>,
    ) -> Self {
        Self {
            local_peer,
            local_cid,
            remote_peer,
            remote_cid: AtomicI64::new(remote_cid),
            tunnel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote_cid(&self) -> i64 {
        self.remote_cid.load(Ordering::Acquire)
    }

    pub fn set_remote_cid(&self, cid: i64) {
        self.remote_cid.store(cid, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn packet(&self, kind: PacketKind) -> Packet {
        Packet::new(kind, self.local_peer.clone(), self.remote_peer.clone())
            .with_cids(self.local_cid, self.remote_cid())
    }

    pub async fn send_data(&self, data: Bytes) -> Result<(), TunnelError> {
        self.tunnel
            .send(self.packet(PacketKind::Data).with_data(data))
            .await
    }

    pub async fn send_close(&self, error: String) -> Result<(), TunnelError> {
        self.tunnel
            .send(self.packet(PacketKind::Close).with_error(error))
            .await
    }
}

type SendFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// A virtual circuit carried inside a neighbor tunnel.
///
/// Reads drain the circuit's ack channel, keeping any unread remainder of a
/// payload for the next call. `poll_shutdown` half-closes by sending an
/// end-of-stream marker; [`TunnelConn::close`] (or dropping) releases the
/// circuit and tells the peer.
///
/// There are no deadlines; wrap calls in `tokio::time::timeout`.
pub struct TunnelConn {
    shared: Arc<CircuitShared>,
    conns: Arc<Connections>,
    rx: mpsc::Receiver<Delivery>,
    rbuf: Bytes,
    read_eof: bool,
    write: Option<(SendFuture, usize)>,
    shutdown: Option<SendFuture>,
    write_closed: bool,
    released: bool,
}

impl std::fmt::Debug for TunnelConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConn")
            .field("local_cid", &self.shared.local_cid)
            .field("remote_peer", &self.shared.remote_peer)
            .field("remote_cid", &self.shared.remote_cid())
            .finish_non_exhaustive()
    }
}

impl TunnelConn {
    pub(crate) fn new(
        shared: Arc<CircuitShared>,
        conns: Arc<Connections>,
        rx: mpsc::Receiver<Delivery>,
    ) -> Self {
        Self {
            shared,
            conns,
            rx,
            rbuf: Bytes::new(),
            read_eof: false,
            write: None,
            shutdown: None,
            write_closed: false,
            released: false,
        }
    }

    pub fn local_peer(&self) -> &str {
        &self.shared.local_peer
    }

    pub fn local_cid(&self) -> i64 {
        self.shared.local_cid
    }

    pub fn remote_peer(&self) -> &str {
        &self.shared.remote_peer
    }

    pub fn remote_cid(&self) -> i64 {
        self.shared.remote_cid()
    }

    pub(crate) fn shared(&self) -> &Arc<CircuitShared> {
        &self.shared
    }

    pub(crate) async fn next_delivery(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Releases local state. True only for the call that did it.
    fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.conns.close(self.shared.local_cid)
    }

    /// Releases the circuit and sends `Close` to the peer.
    pub async fn close(&mut self) {
        self.close_with_error(String::new()).await;
    }

    pub(crate) async fn close_with_error(&mut self, error: String) {
        if !self.release() {
            return;
        }
        if let Err(err) = self.shared.send_close(error).await {
            tracing::debug!(
                cid = self.shared.local_cid,
                remote = %self.shared.remote_peer,
                err = %err,
                "tunnel: send close failed"
            );
        }
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        if !self.release() {
            return;
        }
        let shared = self.shared.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                let _ = shared.send_close(String::new()).await;
            });
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed circuit")
}

fn tunnel_io_error(err: TunnelError) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, err)
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.rbuf.is_empty() {
                let n = this.rbuf.len().min(buf.remaining());
                buf.put_slice(&this.rbuf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.rx.poll_recv(cx)) {
                Some(Delivery::Data(b)) => this.rbuf = b,
                Some(Delivery::Eof | Delivery::Closed) => this.read_eof = true,
                Some(Delivery::Error(msg)) => return Poll::Ready(Err(io::Error::other(msg))),
                Some(Delivery::Ack { .. }) => {}
                None => return Poll::Ready(Err(closed_error())),
            }
        }
    }
}

impl TunnelConn {
    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let Some((fut, n)) = self.write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let n = *n;
        let res = ready!(fut.as_mut().poll(cx));
        self.write = None;
        Poll::Ready(res.map(|()| n))
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write.is_none() {
            if this.released || this.write_closed || this.shared.is_closed() {
                return Poll::Ready(Err(closed_error()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = buf.len().min(MAX_DATA_CHUNK);
            let data = Bytes::copy_from_slice(&buf[..n]);
            let shared = this.shared.clone();
            let fut: SendFuture =
                Box::pin(async move { shared.send_data(data).await.map_err(tunnel_io_error) });
            this.write = Some((fut, n));
        }
        this.poll_pending_write(cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        if this.released || this.shared.is_closed() {
            return Poll::Ready(Ok(()));
        }
        if this.shutdown.is_none() {
            if this.write_closed {
                return Poll::Ready(Ok(()));
            }
            let shared = this.shared.clone();
            this.shutdown = Some(Box::pin(async move {
                shared.send_data(Bytes::new()).await.map_err(tunnel_io_error)
            }));
        }
        let Some(fut) = this.shutdown.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = ready!(fut.as_mut().poll(cx));
        this.shutdown = None;
        this.write_closed = true;
        Poll::Ready(res)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::edgetunnel::tunnel::{
        connections::ConnectionManager,
        testutil::{self, RecordingTunnel},
    };

    fn circuit() -> (TunnelConn, Arc<Connections>, Arc<RecordingTunnel>) {
        let (tun, rec) = testutil::connected("edge-1", Default::default());
        let mgr = ConnectionManager::new("hub");
        let conns = mgr.connections_for(&tun);
        let conn = conns.pending(&tun, "edge-1", 9);
        (conn, conns, rec)
    }

    #[tokio::test]
    async fn read_keeps_leftover_bytes_between_calls() {
        let (mut conn, conns, _rec) = circuit();
        let cid = conn.local_cid();
        conns
            .deliver(cid, Delivery::Data(Bytes::from_static(b"hello world")))
            .unwrap();
        conns.deliver(cid, Delivery::Eof).unwrap();

        let mut buf = [0u8; 5];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b" world");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn error_delivery_surfaces_as_read_error() {
        let (mut conn, conns, _rec) = circuit();
        conns
            .deliver(conn.local_cid(), Delivery::Error("connection reset".into()))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.to_string(), "connection reset");
    }

    #[tokio::test]
    async fn peer_close_reads_as_eof_after_buffered_data() {
        let (mut conn, conns, rec) = circuit();
        let cid = conn.local_cid();
        conns
            .deliver(cid, Delivery::Data(Bytes::from_static(b"tail")))
            .unwrap();
        assert!(conns.close_remote(cid, ""));

        let mut got = Vec::new();
        conn.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"tail");

        // Already released by the peer: no Close goes back.
        conn.close().await;
        assert!(rec.take_sent().is_empty());
    }

    #[tokio::test]
    async fn read_after_local_release_reports_closed() {
        let (mut conn, conns, _rec) = circuit();
        assert!(conns.close(conn.local_cid()));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn write_sends_addressed_data_and_close_is_sent_once() {
        let (mut conn, conns, rec) = circuit();
        conn.write_all(b"ping").await.unwrap();
        conn.close().await;
        conn.close().await;

        let sent = rec.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].kind, PacketKind::Data);
        assert_eq!(sent[0].dest, "edge-1");
        assert_eq!(sent[0].dest_cid, 9);
        assert_eq!(&sent[0].data[..], b"ping");
        assert_eq!(sent[1].kind, PacketKind::Close);
        assert_eq!(conns.count(), 0);

        assert!(conn.write_all(b"late").await.is_err());
    }

    #[tokio::test]
    async fn shutdown_sends_end_of_stream_marker() {
        let (mut conn, conns, rec) = circuit();
        conn.shutdown().await.unwrap();

        let sent = rec.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Data);
        assert!(sent[0].data.is_empty());
        assert_eq!(conns.count(), 1);
    }
}
