use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::watch;

use crate::edgetunnel::tunnel::{
    conn::{StreamTunnel, TunnelOptions},
    engine::TunnelServer,
    packet::Annotations,
    shutdown_requested,
    transport::{QuicDialOptions, TransportDialOptions, TransportKind, transport_for},
};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct QuicClientOptions {
    pub server_name: String,
    pub ca_file: String,
    pub insecure_skip_verify: bool,
}

/// The upstream peer this one keeps a tunnel to.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub server_addr: String,
    pub transport: TransportKind,
    pub token: String,
    pub annotations: Annotations,
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
    pub quic: QuicClientOptions,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            transport: TransportKind::Tcp,
            token: String::new(),
            annotations: Annotations::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            quic: QuicClientOptions::default(),
        }
    }
}

pub struct Client {
    opts: UpstreamOptions,
    tunnel: Arc<TunnelServer>,
}

impl Client {
    pub fn new(mut opts: UpstreamOptions, tunnel: Arc<TunnelServer>) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: upstream server_addr is required");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = DEFAULT_DIAL_TIMEOUT;
        }
        if opts.retry_interval.is_zero() {
            opts.retry_interval = DEFAULT_RETRY_INTERVAL;
        }
        Ok(Self { opts, tunnel })
    }

    /// Keeps the upstream tunnel up until shutdown, reconnecting on a fixed
    /// interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                res = self.run_once() => {
                    let err = match res {
                        Ok(()) => anyhow::anyhow!("tunnel: upstream closed"),
                        Err(err) => err,
                    };
                    tracing::warn!(
                        transport=%self.opts.transport,
                        server=%self.opts.server_addr,
                        err=%format!("{err:#}"),
                        retry_in=%humantime::format_duration(self.opts.retry_interval),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(self.opts.retry_interval) => {}
            }
        }
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let tr = transport_for(self.opts.transport);
        let dial = tr.dial(
            &self.opts.server_addr,
            TransportDialOptions {
                quic: QuicDialOptions {
                    server_name: self.opts.quic.server_name.clone(),
                    ca_file: self.opts.quic.ca_file.clone(),
                    insecure_skip_verify: self.opts.quic.insecure_skip_verify,
                    next_protos: vec![],
                },
            },
        );
        let sess = tokio::time::timeout(self.opts.dial_timeout, dial)
            .await
            .context("tunnel: dial timed out")??;

        let stream = match sess.open_stream().await {
            Ok(st) => st,
            Err(err) => {
                sess.close().await;
                return Err(err.context("tunnel: open stream"));
            }
        };
        tracing::info!(
            transport=%tr.kind(),
            server=%self.opts.server_addr,
            "tunnel: upstream session established"
        );

        let st = Arc::new(StreamTunnel::new(stream));
        let options = TunnelOptions {
            send_route_change: true,
            is_default_out: true,
        };
        let res = self
            .tunnel
            .connect(
                st.clone(),
                &self.opts.token,
                self.opts.annotations.clone(),
                options,
            )
            .await;

        st.close().await;
        sess.close().await;
        res.context("tunnel: upstream")
    }
}
