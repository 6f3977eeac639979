use std::{net::SocketAddr, sync::Arc};

use tokio::sync::watch;

use crate::edgetunnel::tunnel::{
    conn::{StreamTunnel, TunnelOptions},
    engine::TunnelServer,
    packet::Annotations,
    shutdown_requested,
    transport::{
        QuicListenOptions, TransportKind, TransportListenOptions, TransportListener,
        TransportSession, transport_for,
    },
};

#[derive(Debug, Clone, Default)]
pub struct QuicServerOptions {
    pub cert_file: String,
    pub key_file: String,
}

/// A listening endpoint that downstream peers join.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub listen_addr: String,
    pub transport: TransportKind,
    pub quic: QuicServerOptions,
    /// Sent to every peer joining through this endpoint.
    pub annotations: Annotations,
}

pub struct Server {
    opts: EndpointOptions,
    tunnel: Arc<TunnelServer>,
}

impl Server {
    pub fn new(opts: EndpointOptions, tunnel: Arc<TunnelServer>) -> Self {
        Self { opts, tunnel }
    }

    pub async fn listen(&self) -> anyhow::Result<Box<dyn TransportListener>> {
        let tr = transport_for(self.opts.transport);
        let ln = tr
            .listen(
                &self.opts.listen_addr,
                TransportListenOptions {
                    quic: QuicListenOptions {
                        cert_file: self.opts.quic.cert_file.clone(),
                        key_file: self.opts.quic.key_file.clone(),
                        next_protos: vec![],
                    },
                },
            )
            .await?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            local = ?ln.local_addr(),
            transport = %tr.kind(),
            "tunnel: listening"
        );
        Ok(ln)
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, shutdown).await
    }

    /// Accepts sessions until shutdown; each runs as its own neighbor.
    pub async fn serve(
        &self,
        ln: Box<dyn TransportListener>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                sess = ln.accept() => {
                    let sess = match sess {
                        Ok(sess) => sess,
                        Err(err) => {
                            tracing::warn!(err=%err, "tunnel: accept failed");
                            continue;
                        }
                    };
                    let tunnel = self.tunnel.clone();
                    let annotations = self.opts.annotations.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_session(tunnel, sess, annotations, shutdown).await;
                    });
                }
            }
        }

        ln.close().await?;
        Ok(())
    }
}

async fn handle_session(
    tunnel: Arc<TunnelServer>,
    sess: Arc<dyn TransportSession>,
    annotations: Annotations,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = sess
        .remote_addr()
        .as_ref()
        .map(SocketAddr::to_string)
        .unwrap_or_default();

    // The peer opens exactly one stream for the tunnel.
    let stream = match tokio::time::timeout(tunnel.handshake_timeout(), sess.accept_stream()).await {
        Ok(Ok(st)) => st,
        Ok(Err(err)) => {
            tracing::debug!(client=%remote, err=%err, "tunnel: session closed before opening a stream");
            sess.close().await;
            return;
        }
        Err(_) => {
            tracing::warn!(client=%remote, "tunnel: no stream opened in time");
            sess.close().await;
            return;
        }
    };

    let st = Arc::new(StreamTunnel::new(stream));
    let options = TunnelOptions {
        send_route_change: false,
        is_default_out: false,
    };
    tokio::select! {
        res = tunnel.connect(st.clone(), "", annotations, options) => {
            if let Err(err) = res {
                tracing::info!(client=%remote, err=%err, "tunnel: session ended");
            }
        }
        _ = shutdown_requested(&mut shutdown) => {}
    }

    st.close().await;
    sess.close().await;
}
