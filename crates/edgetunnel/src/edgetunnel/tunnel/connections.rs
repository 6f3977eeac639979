use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};

use crate::edgetunnel::{
    net, telemetry,
    tunnel::{
        circuit::{CircuitShared, Delivery, TunnelConn},
        conn::{ConnectedTunnel, TunnelError},
        packet::{self, Packet, PacketDataOpen, PacketKind},
        protocol::ProtocolError,
        route::{RouteError, RouteTable},
        transport::BoxedStream,
    },
};

/// Per-circuit inbound buffer; further packets are dropped while full.
pub const DEFAULT_DATA_CHANNEL_SIZE: usize = 512;
/// Upper bound on waiting for an open ack, whatever the caller asked for.
pub const MAX_OPEN_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const RELAY_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum DialError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("open {address} on {peer}: {message}")]
    Remote {
        peer: String,
        address: String,
        message: String,
    },
    #[error("empty remote connection id")]
    EmptyRemoteId,
    #[error("open {address} on {peer}: timed out")]
    Timeout { peer: String, address: String },
    #[error("use of closed circuit")]
    Closed,
    #[error("unexpected data before open ack")]
    UnexpectedData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliverError {
    #[error("use of closed circuit")]
    NotFound,
    #[error("circuit channel full")]
    Full,
}

struct Slot {
    shared: Arc<CircuitShared>,
    tx: mpsc::Sender<Delivery>,
}

/// Circuits carried over one neighbor tunnel.
///
/// Removing a slot drops the only sender of its ack channel, so the channel
/// closes exactly once.
pub struct Connections {
    local: String,
    tunnel: Arc<ConnectedTunnel>,
    next_cid: AtomicI64,
    slots: DashMap<i64, Slot>,
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("neighbor", &self.tunnel.id())
            .field("circuits", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl Connections {
    fn new(local: String, tunnel: Arc<ConnectedTunnel>) -> Self {
        Self {
            local,
            tunnel,
            next_cid: AtomicI64::new(0),
            slots: DashMap::new(),
        }
    }

    /// Registers a new circuit towards `remote` over `tun`.
    pub fn pending(
        self: &Arc<Self>,
        tun: &Arc<ConnectedTunnel>,
        remote: &str,
        remote_cid: i64,
    ) -> TunnelConn {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(DEFAULT_DATA_CHANNEL_SIZE);
        let shared = Arc::new(CircuitShared::new(
            self.local.clone(),
            cid,
            remote.to_string(),
            remote_cid,
            tun.clone(),
        ));
        self.slots.insert(
            cid,
            Slot {
                shared: shared.clone(),
                tx,
            },
        );
        metrics::gauge!(telemetry::ACTIVE_CIRCUITS).increment(1.0);
        TunnelConn::new(shared, self.clone(), rx)
    }

    /// Non-blocking hand-off to the circuit's reader.
    pub(crate) fn deliver(&self, cid: i64, delivery: Delivery) -> Result<(), DeliverError> {
        let Some(slot) = self.slots.get(&cid) else {
            return Err(DeliverError::NotFound);
        };
        match slot.tx.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::error!(
                    cid = cid,
                    remote = %slot.shared.remote_peer,
                    remote_cid = slot.shared.remote_cid(),
                    "tunnel: channel full; drop packet"
                );
                metrics::counter!(telemetry::PACKETS_DROPPED).increment(1);
                Err(DeliverError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliverError::NotFound),
        }
    }

    /// Releases a circuit. True only for the call that removed it.
    pub fn close(&self, cid: i64) -> bool {
        let Some((_, slot)) = self.slots.remove(&cid) else {
            return false;
        };
        slot.shared.mark_closed();
        metrics::gauge!(telemetry::ACTIVE_CIRCUITS).decrement(1.0);
        tracing::debug!(
            cid = cid,
            remote = %slot.shared.remote_peer,
            remote_cid = slot.shared.remote_cid(),
            "tunnel: circuit closed"
        );
        true
    }

    /// Peer-initiated close: the reader sees EOF, or `error` when set.
    pub(crate) fn close_remote(&self, cid: i64, error: &str) -> bool {
        if let Some(slot) = self.slots.get(&cid) {
            let last = if error.is_empty() {
                Delivery::Closed
            } else {
                Delivery::Error(error.to_string())
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.tx.try_send(last) {
                tracing::error!(
                    cid = cid,
                    remote = %slot.shared.remote_peer,
                    remote_cid = slot.shared.remote_cid(),
                    error = %error,
                    "tunnel: channel full; drop close reason"
                );
                metrics::counter!(telemetry::PACKETS_DROPPED).increment(1);
            }
        }
        self.close(cid)
    }

    /// Closes every circuit; returns how many were open.
    pub fn flush(&self) -> usize {
        let cids: Vec<i64> = self.slots.iter().map(|e| *e.key()).collect();
        cids.into_iter().filter(|cid| self.close(*cid)).count()
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitCount {
    pub neighbor: String,
    pub circuits: usize,
}

/// The multiplexer: one [`Connections`] per neighbor id.
#[derive(Debug)]
pub struct ConnectionManager {
    local: String,
    tunnels: DashMap<String, Arc<Connections>>,
}

impl ConnectionManager {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            tunnels: DashMap::new(),
        }
    }

    /// The circuit set bound to this very tunnel; a stale set left by an
    /// earlier tunnel with the same id is flushed and replaced.
    pub fn connections_for(&self, tun: &Arc<ConnectedTunnel>) -> Arc<Connections> {
        let mut stale = None;
        let conns = {
            let mut entry = self
                .tunnels
                .entry(tun.id().to_string())
                .or_insert_with(|| Arc::new(Connections::new(self.local.clone(), tun.clone())));
            if !Arc::ptr_eq(&entry.tunnel, tun) {
                stale = Some(std::mem::replace(
                    entry.value_mut(),
                    Arc::new(Connections::new(self.local.clone(), tun.clone())),
                ));
            }
            entry.value().clone()
        };
        if let Some(old) = stale {
            old.flush();
        }
        conns
    }

    fn get(&self, tun: &Arc<ConnectedTunnel>) -> Option<Arc<Connections>> {
        let conns = self.tunnels.get(tun.id())?;
        Arc::ptr_eq(&conns.tunnel, tun).then(|| conns.value().clone())
    }

    pub(crate) fn deliver(
        &self,
        tun: &Arc<ConnectedTunnel>,
        cid: i64,
        delivery: Delivery,
    ) -> Result<(), DeliverError> {
        self.get(tun)
            .ok_or(DeliverError::NotFound)?
            .deliver(cid, delivery)
    }

    pub(crate) fn close_remote(&self, tun: &Arc<ConnectedTunnel>, cid: i64, error: &str) -> bool {
        self.get(tun).is_some_and(|c| c.close_remote(cid, error))
    }

    /// Tunnel lost: close all of its circuits and forget the set.
    pub fn tunnel_closed(&self, tun: &Arc<ConnectedTunnel>) -> usize {
        let removed = self
            .tunnels
            .remove_if(tun.id(), |_, c| Arc::ptr_eq(&c.tunnel, tun));
        let Some((_, conns)) = removed else {
            return 0;
        };
        let n = conns.flush();
        if n > 0 {
            tracing::info!(peer=%tun.id(), circuits = n, "tunnel: lost; circuits closed");
        }
        n
    }

    pub fn total(&self) -> usize {
        self.tunnels.iter().map(|c| c.count()).sum()
    }

    pub fn snapshot(&self) -> Vec<CircuitCount> {
        let mut out: Vec<CircuitCount> = self
            .tunnels
            .iter()
            .map(|c| CircuitCount {
                neighbor: c.key().clone(),
                circuits: c.count(),
            })
            .collect();
        out.sort_by(|a, b| a.neighbor.cmp(&b.neighbor));
        out
    }

    /// Opens a circuit to `address` as dialed by peer `dest`.
    ///
    /// `remote_timeout` is what the remote peer spends dialing; `deadline`
    /// bounds the wait for its ack (never beyond
    /// [`MAX_OPEN_CONNECT_TIMEOUT`]).
    pub async fn open(
        &self,
        routes: &RouteTable,
        network: &str,
        address: &str,
        remote_timeout: Option<Duration>,
        deadline: Option<Instant>,
        dest: &str,
    ) -> Result<TunnelConn, DialError> {
        let tun = routes.select(dest).await?;
        let mut conn = self.connections_for(&tun).pending(&tun, dest, 0);

        let open = PacketDataOpen {
            network: network.to_string(),
            address: address.to_string(),
            timeout_ms: remote_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        };
        let pkt = Packet::new(PacketKind::Open, self.local.clone(), dest)
            .with_cids(conn.local_cid(), 0)
            .with_data(packet::encode(&open)?);
        if let Err(err) = tun.send(pkt).await {
            conn.close().await;
            return Err(err.into());
        }

        let timed_out = || DialError::Timeout {
            peer: dest.to_string(),
            address: address.to_string(),
        };
        let res = tokio::select! {
            d = conn.next_delivery() => match d {
                Some(Delivery::Ack { error, .. }) if !error.is_empty() => Err(DialError::Remote {
                    peer: dest.to_string(),
                    address: address.to_string(),
                    message: error,
                }),
                Some(Delivery::Ack { remote_cid: 0, .. }) => Err(DialError::EmptyRemoteId),
                Some(Delivery::Ack { remote_cid, .. }) => Ok(remote_cid),
                Some(Delivery::Error(message)) => Err(DialError::Remote {
                    peer: dest.to_string(),
                    address: address.to_string(),
                    message,
                }),
                Some(Delivery::Data(_)) => Err(DialError::UnexpectedData),
                Some(Delivery::Eof | Delivery::Closed) | None => Err(DialError::Closed),
            },
            _ = sleep_until(deadline) => Err(timed_out()),
            _ = tokio::time::sleep(MAX_OPEN_CONNECT_TIMEOUT) => Err(timed_out()),
        };

        match res {
            Ok(remote_cid) => {
                conn.shared().set_remote_cid(remote_cid);
                metrics::counter!(telemetry::CIRCUITS_OPENED).increment(1);
                tracing::debug!(
                    cid = conn.local_cid(),
                    remote = %dest,
                    remote_cid = remote_cid,
                    address = %address,
                    "tunnel: circuit opened"
                );
                Ok(conn)
            }
            Err(err) => {
                conn.close().await;
                Err(err)
            }
        }
    }

    /// Dials `open.address` on behalf of `remote`, acks, and returns the
    /// established circuit with its raw connection. Failures are reported
    /// to the opener with `Close`.
    pub async fn accept(
        &self,
        tun: &Arc<ConnectedTunnel>,
        remote: &str,
        remote_cid: i64,
        open: &PacketDataOpen,
    ) -> Option<(TunnelConn, BoxedStream)> {
        let mut conn = self.connections_for(tun).pending(tun, remote, remote_cid);
        let timeout = open.timeout().unwrap_or(DEFAULT_DIAL_TIMEOUT);

        let raw = match net::dial(&open.network, &open.address, timeout).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    remote = %remote,
                    network = %open.network,
                    address = %open.address,
                    err = %err,
                    "tunnel: dial failed"
                );
                conn.close_with_error(format!("dial {} {}: {err}", open.network, open.address))
                    .await;
                return None;
            }
        };

        let ack = conn.shared().packet(PacketKind::Ack);
        if let Err(err) = tun.send(ack).await {
            tracing::warn!(remote = %remote, err = %err, "tunnel: send open ack failed");
            conn.close().await;
            return None;
        }
        metrics::counter!(telemetry::CIRCUITS_OPENED).increment(1);
        tracing::debug!(
            cid = conn.local_cid(),
            remote = %remote,
            remote_cid = remote_cid,
            address = %open.address,
            "tunnel: circuit accepted"
        );
        Some((conn, raw))
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Copies between an accepted circuit and its raw connection. The first
/// direction to finish (EOF, peer close or error) releases the circuit and
/// the raw connection together.
pub async fn relay(mut conn: TunnelConn, raw: BoxedStream) -> io::Result<()> {
    let shared = conn.shared().clone();
    let (mut raw_rd, mut raw_wr) = tokio::io::split(raw);

    let tunnel_to_remote = async {
        loop {
            match conn.next_delivery().await {
                Some(Delivery::Data(b)) => raw_wr.write_all(&b).await?,
                Some(Delivery::Eof) => {
                    raw_wr.shutdown().await?;
                    return Ok::<(), io::Error>(());
                }
                Some(Delivery::Closed) => return Ok(()),
                Some(Delivery::Error(msg)) => return Err(io::Error::other(msg)),
                Some(Delivery::Ack { .. }) => {}
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "use of closed circuit",
                    ));
                }
            }
        }
    };

    let remote_to_tunnel = async {
        let mut buf = vec![0u8; RELAY_BUFFER_BYTES];
        loop {
            let n = raw_rd.read(&mut buf).await?;
            // n == 0 sends the end-of-stream marker before teardown.
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            shared
                .send_data(chunk)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
        }
    };

    let res = tokio::select! {
        res = tunnel_to_remote => res,
        res = remote_to_tunnel => res,
    };
    drop(raw_rd);
    drop(raw_wr);
    conn.close().await;
    res
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::edgetunnel::tunnel::{
        conn::TunnelOptions,
        event::Eventer,
        packet::PacketDataRoute,
        testutil::{self, RecordingTunnel},
    };

    fn manager_with_peer() -> (ConnectionManager, Arc<ConnectedTunnel>, Arc<RecordingTunnel>) {
        let (tun, rec) = testutil::connected("edge-1", TunnelOptions::default());
        (ConnectionManager::new("hub"), tun, rec)
    }

    #[tokio::test]
    async fn pending_allocates_increasing_ids() {
        let (mgr, tun, _rec) = manager_with_peer();
        let conns = mgr.connections_for(&tun);
        let a = conns.pending(&tun, "edge-1", 0);
        let b = conns.pending(&tun, "edge-1", 0);
        assert!(b.local_cid() > a.local_cid());
        assert_eq!(mgr.total(), 2);
    }

    #[tokio::test]
    async fn full_channel_drops_further_packets() {
        let (mgr, tun, _rec) = manager_with_peer();
        let conns = mgr.connections_for(&tun);
        let conn = conns.pending(&tun, "edge-1", 3);
        let cid = conn.local_cid();

        for _ in 0..DEFAULT_DATA_CHANNEL_SIZE {
            conns
                .deliver(cid, Delivery::Data(Bytes::from_static(b"x")))
                .unwrap();
        }
        assert_eq!(
            conns.deliver(cid, Delivery::Data(Bytes::from_static(b"x"))),
            Err(DeliverError::Full)
        );
    }

    #[tokio::test]
    async fn close_on_full_channel_counts_the_lost_reason() {
        let (mgr, tun, _rec) = manager_with_peer();
        let conns = mgr.connections_for(&tun);
        let mut conn = conns.pending(&tun, "edge-1", 3);
        let cid = conn.local_cid();
        for _ in 0..DEFAULT_DATA_CHANNEL_SIZE {
            conns
                .deliver(cid, Delivery::Data(Bytes::from_static(b"x")))
                .unwrap();
        }

        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let released =
            metrics::with_local_recorder(&recorder, || conns.close_remote(cid, "reset by peer"));
        assert!(released);
        assert_eq!(conns.count(), 0);
        assert!(
            handle
                .render()
                .contains(&format!("{} 1", telemetry::PACKETS_DROPPED)),
            "{}",
            handle.render()
        );

        // Buffered data still drains; the circuit then reads as closed, not as a clean EOF.
        for _ in 0..DEFAULT_DATA_CHANNEL_SIZE {
            assert!(matches!(conn.next_delivery().await, Some(Delivery::Data(_))));
        }
        assert!(conn.next_delivery().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mgr, tun, _rec) = manager_with_peer();
        let conns = mgr.connections_for(&tun);
        let conn = conns.pending(&tun, "edge-1", 3);
        let cid = conn.local_cid();

        assert!(conns.close(cid));
        assert!(!conns.close(cid));
        assert_eq!(
            conns.deliver(cid, Delivery::Eof),
            Err(DeliverError::NotFound)
        );
    }

    #[tokio::test]
    async fn tunnel_loss_closes_every_circuit() {
        let (mgr, tun, _rec) = manager_with_peer();
        let conns = mgr.connections_for(&tun);
        let _a = conns.pending(&tun, "edge-1", 1);
        let _b = conns.pending(&tun, "spoke", 2);

        assert_eq!(mgr.tunnel_closed(&tun), 2);
        assert_eq!(mgr.total(), 0);
        assert_eq!(mgr.tunnel_closed(&tun), 0);
    }

    #[tokio::test]
    async fn replacement_tunnel_flushes_stale_circuits() {
        let (mgr, old, _rec) = manager_with_peer();
        let stale = mgr.connections_for(&old);
        let _conn = stale.pending(&old, "edge-1", 1);

        let (new, _rec2) = testutil::connected("edge-1", TunnelOptions::default());
        let fresh = mgr.connections_for(&new);
        assert_eq!(stale.count(), 0);
        assert_eq!(fresh.count(), 0);
        assert_eq!(mgr.tunnel_closed(&old), 0);
    }

    async fn routes_with(tun: &Arc<ConnectedTunnel>) -> RouteTable {
        let routes = RouteTable::new("hub", Arc::new(Eventer::new()));
        routes
            .connect(tun.clone(), PacketDataRoute::default())
            .await
            .unwrap();
        routes
    }

    #[tokio::test(start_paused = true)]
    async fn open_without_ack_times_out_and_leaves_nothing_behind() {
        let (mgr, tun, rec) = manager_with_peer();
        let routes = routes_with(&tun).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = mgr
            .open(&routes, "tcp", "db:5432", None, Some(deadline), "edge-1")
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout { .. }), "{err}");
        assert_eq!(mgr.total(), 0);

        let kinds: Vec<PacketKind> = rec.take_sent().iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PacketKind::Open, PacketKind::Close]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_capped_without_a_deadline() {
        let (mgr, tun, _rec) = manager_with_peer();
        let routes = routes_with(&tun).await;

        let started = Instant::now();
        let err = mgr
            .open(&routes, "tcp", "db:5432", None, None, "edge-1")
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Timeout { .. }));
        assert!(started.elapsed() >= MAX_OPEN_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn open_resolves_on_ack() {
        let (mgr, tun, rec) = manager_with_peer();
        let routes = routes_with(&tun).await;
        let mgr = Arc::new(mgr);

        let opener = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.open(&routes, "tcp", "db:5432", None, None, "edge-1").await
            })
        };

        let open = testutil::wait_for_packet(&rec, PacketKind::Open).await;
        let req: PacketDataOpen = packet::decode(&open.data).unwrap();
        assert_eq!(req.address, "db:5432");

        mgr.deliver(
            &tun,
            open.src_cid,
            Delivery::Ack {
                remote_cid: 77,
                error: String::new(),
            },
        )
        .unwrap();

        let conn = opener.await.unwrap().unwrap();
        assert_eq!(conn.remote_cid(), 77);
        assert_eq!(conn.remote_peer(), "edge-1");
    }

    #[tokio::test]
    async fn open_surfaces_remote_error() {
        let (mgr, tun, rec) = manager_with_peer();
        let routes = routes_with(&tun).await;
        let mgr = Arc::new(mgr);

        let opener = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.open(&routes, "tcp", "db:5432", None, None, "edge-1").await
            })
        };

        let open = testutil::wait_for_packet(&rec, PacketKind::Open).await;
        assert!(mgr.close_remote(&tun, open.src_cid, "connection refused"));

        match opener.await.unwrap().unwrap_err() {
            DialError::Remote { message, .. } => assert_eq!(message, "connection refused"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_failure_reports_close_with_error() {
        let (mgr, tun, rec) = manager_with_peer();
        let open = PacketDataOpen {
            network: "carrier-pigeon".into(),
            address: "nowhere".into(),
            timeout_ms: 100,
        };

        assert!(mgr.accept(&tun, "spoke", 12, &open).await.is_none());

        let sent = rec.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Close);
        assert_eq!(sent[0].dest, "spoke");
        assert_eq!(sent[0].dest_cid, 12);
        assert!(sent[0].error.contains("unsupported network"), "{}", sent[0].error);
        assert_eq!(mgr.total(), 0);
    }
}
