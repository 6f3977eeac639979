use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
};

use crate::edgetunnel::{
    net,
    tunnel::transport::{
        BoxedStream, Transport, TransportDialOptions, TransportKind, TransportListenOptions,
        TransportListener, TransportSession,
    },
};

// Streams accepted by the yamux driver but not yet taken by the session owner.
const INCOMING_STREAM_BACKLOG: usize = 64;

/// Plain TCP with yamux multiplexing on top.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(
        &self,
        addr: &str,
        _opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Arc::new(YamuxSession::client(c)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, _) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Arc::new(YamuxSession::server(c)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Dropping the listener closes the socket.
        Ok(())
    }
}

struct YamuxSession {
    control: Mutex<tokio_yamux::Control>,
    incoming: Mutex<mpsc::Receiver<tokio_yamux::StreamHandle>>,
    remote: Option<SocketAddr>,
    task: tokio::task::JoinHandle<()>,
}

impl YamuxSession {
    fn server(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let session = tokio_yamux::Session::new_server(c, tokio_yamux::Config::default());
        Self::from_session(session, remote)
    }

    fn client(c: TcpStream) -> Self {
        let remote = c.peer_addr().ok();
        let session = tokio_yamux::Session::new_client(c, tokio_yamux::Config::default());
        Self::from_session(session, remote)
    }

    fn from_session(
        mut session: tokio_yamux::Session<TcpStream>,
        remote: Option<SocketAddr>,
    ) -> Self {
        let control = session.control();

        let (tx, rx) = mpsc::channel::<tokio_yamux::StreamHandle>(INCOMING_STREAM_BACKLOG);
        let task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(st) => {
                        if tx.send(st).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(err=%err, "tunnel: yamux session ended");
                        break;
                    }
                }
            }
        });

        Self {
            control: Mutex::new(control),
            incoming: Mutex::new(rx),
            remote,
            task,
        }
    }
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut ctrl = self.control.lock().await;
        let st = ctrl.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let st = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        let mut ctrl = self.control.lock().await;
        ctrl.close().await;
        self.task.abort();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

impl Drop for YamuxSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}
