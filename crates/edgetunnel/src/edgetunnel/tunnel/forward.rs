use std::{sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::watch};

use crate::edgetunnel::{
    net,
    tunnel::{engine::TunnelServer, shutdown_requested},
};

/// A local TCP port whose connections are carried to `address` as dialed by
/// `peer`.
#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub listen_addr: String,
    pub peer: String,
    pub network: String,
    pub address: String,
    pub dial_timeout: Duration,
}

pub async fn serve_forward(
    opts: ForwardOptions,
    tunnel: Arc<TunnelServer>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let ln = TcpListener::bind(net::normalize_bind_addr(&opts.listen_addr).as_ref()).await?;
    tracing::info!(
        listen=%opts.listen_addr,
        peer=%opts.peer,
        address=%opts.address,
        "forward: listening"
    );
    serve_listener(ln, opts, tunnel, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    opts: ForwardOptions,
    tunnel: Arc<TunnelServer>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let dialer = tunnel.dialer_on(opts.peer.clone());
    let opts = Arc::new(opts);
    loop {
        let (mut sock, client) = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
            accepted = ln.accept() => match accepted {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(err=%err, "forward: accept failed");
                    continue;
                }
            },
        };
        let _ = sock.set_nodelay(true);

        let dialer = dialer.clone();
        let opts = opts.clone();
        tokio::spawn(async move {
            let mut conn = match dialer
                .dial_timeout(&opts.network, &opts.address, opts.dial_timeout)
                .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::warn!(
                        client=%client,
                        peer=%dialer.remote(),
                        address=%opts.address,
                        err=%err,
                        "forward: dial failed"
                    );
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut sock, &mut conn).await {
                Ok((up, down)) => {
                    tracing::debug!(client=%client, peer=%dialer.remote(), up, down, "forward: done");
                }
                Err(err) => {
                    tracing::debug!(client=%client, peer=%dialer.remote(), err=%err, "forward: ended");
                }
            }
            conn.close().await;
        });
    }
}
