use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::edgetunnel::{
    admin, config, logging, net, telemetry,
    tunnel::{
        self,
        engine::{TunnelServer, TunnelServerOptions},
    },
};

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        peer_id = %cfg.peer_id,
        admin_addr = %cfg.admin_addr,
        tunnel_endpoints = cfg.tunnel.endpoints.len(),
        upstream = cfg.tunnel.upstream.as_ref().map(|u| u.server_addr.as_str()).unwrap_or(""),
        forwards = cfg.forwards.len(),
        "edgetunnel: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let auth = tunnel::auth::from_tokens(&cfg.tunnel.auth_token, &cfg.tunnel.peer_tokens);
    let peer = TunnelServer::new(
        cfg.peer_id.clone(),
        auth,
        TunnelServerOptions {
            handshake_timeout: cfg.tunnel.handshake_timeout,
            max_pending_opens: cfg.tunnel.max_pending_opens,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut tasks = JoinSet::new();

    // Admin server.
    if !cfg.admin_addr.is_empty() {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            tunnel: peer.clone(),
            config_path: resolved.path.clone(),
            shutdown: shutdown_rx.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Endpoints downstream peers join.
    for ep in &cfg.tunnel.endpoints {
        let server = tunnel::server::Server::new(
            tunnel::server::EndpointOptions {
                listen_addr: ep.listen_addr.clone(),
                transport: ep.transport,
                quic: tunnel::server::QuicServerOptions {
                    cert_file: ep.quic.cert_file.clone(),
                    key_file: ep.quic.key_file.clone(),
                },
                annotations: cfg.annotations.clone(),
            },
            peer.clone(),
        );

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    // Upstream client.
    if let Some(up) = &cfg.tunnel.upstream {
        let client = tunnel::client::Client::new(
            tunnel::client::UpstreamOptions {
                server_addr: up.server_addr.clone(),
                transport: up.transport,
                token: up.token.clone(),
                annotations: cfg.annotations.clone(),
                dial_timeout: up.dial_timeout,
                retry_interval: up.retry_interval,
                quic: tunnel::client::QuicClientOptions {
                    server_name: up.quic.server_name.clone(),
                    ca_file: up.quic.ca_file.clone(),
                    insecure_skip_verify: up.quic.insecure_skip_verify,
                },
            },
            peer.clone(),
        )?;

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    // Periodic route updates.
    if !cfg.tunnel.keepalive_interval.is_zero() {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(peer.clone().run_keepalive(
            cfg.tunnel.keepalive_interval,
            cfg.annotations.clone(),
            shutdown,
        ));
    }
    if !cfg.tunnel.refresh_interval.is_zero() {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(peer.clone().run_refresh(
            cfg.tunnel.refresh_interval,
            cfg.annotations.clone(),
            shutdown,
        ));
    }

    // Local port forwards.
    for f in &cfg.forwards {
        let opts = tunnel::forward::ForwardOptions {
            listen_addr: f.listen_addr.clone(),
            peer: f.peer.clone(),
            network: f.network.clone(),
            address: f.address.clone(),
            dial_timeout: f.dial_timeout,
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(tunnel::forward::serve_forward(opts, peer.clone(), shutdown));
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
            let _ = shutdown_tx.send(true);
        }
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(drain_timeout), "shutdown: tasks still running; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
