//! Overlay tunnel network.
//!
//! Peers join each other over multiplexed transports, exchange reachability
//! and relay circuits hop by hop. The wire format is described in
//! `DESIGN.md` (tunnel wire protocol v1).

use tokio::sync::watch;

pub mod auth;
pub mod circuit;
pub mod client;
pub mod conn;
pub mod connections;
pub mod dialer;
pub mod engine;
pub mod event;
pub mod forward;
pub mod packet;
pub mod protocol;
pub mod route;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testutil;

/// Resolves once the shutdown flag is set (or its sender is gone).
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
