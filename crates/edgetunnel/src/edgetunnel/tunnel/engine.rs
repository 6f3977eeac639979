//! The peer: performs the tunnel handshake, runs one dispatch loop per
//! neighbor and routes packets between neighbors and local circuits.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, mpsc, watch},
    time::{Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::edgetunnel::{
    telemetry,
    tunnel::{
        auth::Authenticator,
        circuit::{Delivery, TunnelConn},
        conn::{ConnectedTunnel, Tunnel, TunnelError, TunnelOptions},
        connections::{self, ConnectionManager, DeliverError, DialError},
        dialer::Dialer,
        event::{EventKind, EventWatcher, Eventer, TunnelEvent},
        packet::{
            self, Annotations, Packet, PacketDataConnect, PacketDataOpen, PacketDataRoute,
            PacketKind, PeerAnnotations, RouteUpdateKind,
        },
        route::RouteTable,
        shutdown_requested,
    },
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_PENDING_OPENS: usize = 1024;

// Route updates buffered per neighbor before its dispatch loop waits.
const ROUTE_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct TunnelServerOptions {
    /// Bound on auth + route exchange for one physical connection.
    pub handshake_timeout: Duration,
    /// Open requests being dialed at once; further ones are refused.
    pub max_pending_opens: usize,
}

impl Default for TunnelServerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_pending_opens: DEFAULT_MAX_PENDING_OPENS,
        }
    }
}

pub struct TunnelServer {
    id: String,
    auth: Arc<dyn Authenticator>,
    routes: RouteTable,
    connections: Arc<ConnectionManager>,
    eventer: Arc<Eventer>,
    opens: Arc<Semaphore>,
    opts: TunnelServerOptions,
}

impl TunnelServer {
    pub fn new(
        id: impl Into<String>,
        auth: Arc<dyn Authenticator>,
        opts: TunnelServerOptions,
    ) -> Arc<Self> {
        let id = id.into();
        let eventer = Arc::new(Eventer::new());
        Arc::new(Self {
            routes: RouteTable::new(id.clone(), eventer.clone()),
            connections: Arc::new(ConnectionManager::new(id.clone())),
            opens: Arc::new(Semaphore::new(opts.max_pending_opens)),
            id,
            auth,
            eventer,
            opts,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.opts.handshake_timeout
    }

    pub fn dialer_on(self: &Arc<Self>, dest: impl Into<String>) -> Dialer {
        Dialer::new(self.clone(), dest)
    }

    /// Subscribes to topology changes, starting with a snapshot of every
    /// peer reachable right now.
    pub async fn watch(&self, shutdown: watch::Receiver<bool>) -> EventWatcher {
        let snapshot = TunnelEvent {
            from: self.id.clone(),
            from_annotations: Annotations::new(),
            kind: EventKind::Connected,
            peers: self.routes.all_reachable_peers(None).await,
        };
        self.eventer.watch(snapshot, shutdown)
    }

    /// Opens a circuit to `address`, dialed by peer `dest`.
    pub async fn open(
        &self,
        network: &str,
        address: &str,
        remote_timeout: Option<Duration>,
        deadline: Option<Instant>,
        dest: &str,
    ) -> Result<TunnelConn, DialError> {
        self.connections
            .open(&self.routes, network, address, remote_timeout, deadline, dest)
            .await
    }

    /// Runs a neighbor over `tunnel` until it goes away.
    ///
    /// `annotations` describe this peer to the neighbor. The returned error
    /// is whatever ended the connection.
    pub async fn connect(
        self: &Arc<Self>,
        tunnel: Arc<dyn Tunnel>,
        token: &str,
        annotations: Annotations,
        options: TunnelOptions,
    ) -> Result<(), TunnelError> {
        let handshake = self.handshake(tunnel, token, annotations, options);
        let (tun, init) = tokio::time::timeout(self.opts.handshake_timeout, handshake)
            .await
            .map_err(|_| TunnelError::HandshakeTimeout)??;

        if let Err(err) = self.routes.connect(tun.clone(), init).await {
            self.send_close(&tun, &err).await;
            return Err(err);
        }
        tracing::info!(
            peer = %tun.id(),
            send_route_change = tun.options().send_route_change,
            default_out = tun.options().is_default_out,
            "tunnel: neighbor connected"
        );

        let mut guard = DisconnectGuard {
            server: self.clone(),
            tun: Some(tun.clone()),
        };
        let err = self.dispatch_loop(&tun).await;
        guard.tun = None;

        self.routes.disconnect(&tun, &self.connections).await;
        tracing::info!(peer = %tun.id(), err = %err, "tunnel: neighbor disconnected");
        Err(err)
    }

    async fn handshake(
        &self,
        tunnel: Arc<dyn Tunnel>,
        token: &str,
        annotations: Annotations,
        options: TunnelOptions,
    ) -> Result<(Arc<ConnectedTunnel>, PacketDataRoute), TunnelError> {
        let remote = self.auth_stage(tunnel.as_ref(), token).await?;

        if self.routes.exists(&remote).await {
            let err = TunnelError::AlreadyExists(remote.clone());
            let close = Packet::new(PacketKind::Close, self.id.clone(), remote)
                .with_error(err.to_string());
            let _ = tunnel.send(close).await;
            return Err(err);
        }

        let tun = Arc::new(ConnectedTunnel::new(remote, tunnel, options, annotations));
        let init = self.route_exchange_stage(&tun).await?;
        Ok((tun, init))
    }

    /// Exchanges `Connect`, verifies the remote and exchanges `Ack`.
    /// Returns the remote peer id.
    async fn auth_stage(&self, tunnel: &dyn Tunnel, token: &str) -> Result<String, TunnelError> {
        let hello = PacketDataConnect {
            token: token.to_string(),
        };
        tunnel
            .send(Packet::new(PacketKind::Connect, self.id.clone(), "").with_data(packet::encode(&hello)?))
            .await?;

        let pkt = tunnel.recv().await?;
        match pkt.kind {
            PacketKind::Connect => {}
            PacketKind::Close => return Err(TunnelError::RemoteClosed(pkt.error)),
            got => return Err(TunnelError::UnexpectedPacket { stage: "auth", got }),
        }

        let remote = pkt.src.clone();
        if let Err(err) = self.verify(&pkt).await {
            let close =
                Packet::new(PacketKind::Close, self.id.clone(), remote).with_error(err.to_string());
            let _ = tunnel.send(close).await;
            return Err(err);
        }

        tunnel
            .send(Packet::new(PacketKind::Ack, self.id.clone(), remote.clone()))
            .await?;
        let reply = tunnel.recv().await?;
        match reply.kind {
            PacketKind::Ack if reply.error.is_empty() => Ok(remote),
            PacketKind::Ack | PacketKind::Close => Err(TunnelError::RemoteClosed(reply.error)),
            got => Err(TunnelError::UnexpectedPacket { stage: "auth", got }),
        }
    }

    async fn verify(&self, hello: &Packet) -> Result<(), TunnelError> {
        if hello.src.is_empty() {
            return Err(TunnelError::EmptyId);
        }
        if hello.src == self.id {
            return Err(TunnelError::SelfId(hello.src.clone()));
        }
        let req: PacketDataConnect = packet::decode(&hello.data)?;
        self.auth.authenticate(&hello.src, &req.token).await?;
        Ok(())
    }

    /// Sends our `Init` and returns the neighbor's.
    async fn route_exchange_stage(
        &self,
        tun: &Arc<ConnectedTunnel>,
    ) -> Result<PacketDataRoute, TunnelError> {
        let peers = if tun.options().send_route_change {
            self.routes.all_reachable_peers(Some(tun.id())).await
        } else {
            PeerAnnotations::new()
        };
        let init = PacketDataRoute {
            kind: RouteUpdateKind::Init,
            annotations: tun.annotations_sent().clone(),
            peers,
        };
        tun.send(
            Packet::new(PacketKind::Route, self.id.clone(), tun.id())
                .with_data(packet::encode(&init)?),
        )
        .await?;

        let pkt = tun.recv().await?;
        match pkt.kind {
            PacketKind::Route => {
                let mut theirs: PacketDataRoute = packet::decode(&pkt.data)?;
                theirs.kind = RouteUpdateKind::Init;
                Ok(theirs)
            }
            PacketKind::Close => Err(TunnelError::RemoteClosed(pkt.error)),
            got => Err(TunnelError::UnexpectedPacket {
                stage: "route exchange",
                got,
            }),
        }
    }

    async fn send_close(&self, tun: &ConnectedTunnel, err: &TunnelError) {
        let close =
            Packet::new(PacketKind::Close, self.id.clone(), tun.id()).with_error(err.to_string());
        if let Err(e) = tun.send(close).await {
            tracing::debug!(peer = %tun.id(), err = %e, "tunnel: send close failed");
        }
    }

    async fn dispatch_loop(self: &Arc<Self>, tun: &Arc<ConnectedTunnel>) -> TunnelError {
        let (route_tx, mut route_rx) = mpsc::channel::<PacketDataRoute>(ROUTE_QUEUE_DEPTH);
        let worker = {
            let server = self.clone();
            let tun = tun.clone();
            tokio::spawn(async move {
                while let Some(change) = route_rx.recv().await {
                    server.routes.on_change(&tun, change).await;
                }
            })
        };

        let err = loop {
            match tun.recv().await {
                Ok(pkt) => self.pre_routing(tun, pkt, &route_tx).await,
                Err(err) => break err,
            }
        };

        drop(route_tx);
        let _ = worker.await;
        err
    }

    async fn pre_routing(
        self: &Arc<Self>,
        tun: &Arc<ConnectedTunnel>,
        mut pkt: Packet,
        route_tx: &mpsc::Sender<PacketDataRoute>,
    ) {
        if pkt.dest.is_empty() {
            pkt.dest = self.id.clone();
        }
        if pkt.dest != self.id {
            self.forward(tun, pkt).await;
        } else {
            self.local_in(tun, pkt, route_tx).await;
        }
    }

    async fn forward(&self, from: &Arc<ConnectedTunnel>, pkt: Packet) {
        let res = match self.routes.select(&pkt.dest).await {
            Ok(next) if Arc::ptr_eq(&next, from) => {
                Err(format!("routing loop for peer {}", pkt.dest))
            }
            Ok(next) => next.send(pkt.clone()).await.map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        };

        let Err(err) = res else {
            metrics::counter!(telemetry::PACKETS_FORWARDED).increment(1);
            return;
        };
        metrics::counter!(telemetry::FORWARD_ERRORS).increment(1);
        tracing::warn!(
            src = %pkt.src,
            dest = %pkt.dest,
            kind = %pkt.kind,
            via = %from.id(),
            err = %err,
            "tunnel: forward failed"
        );
        if pkt.kind != PacketKind::Close {
            self.reply(from, pkt.reject(&self.id, &err)).await;
        }
    }

    async fn local_in(
        self: &Arc<Self>,
        tun: &Arc<ConnectedTunnel>,
        pkt: Packet,
        route_tx: &mpsc::Sender<PacketDataRoute>,
    ) {
        match pkt.kind {
            PacketKind::Open => self.on_open(tun, pkt).await,
            PacketKind::Data => {
                let delivery = if !pkt.error.is_empty() {
                    Delivery::Error(pkt.error.clone())
                } else if pkt.data.is_empty() {
                    Delivery::Eof
                } else {
                    Delivery::Data(pkt.data.clone())
                };
                self.deliver(tun, &pkt, delivery).await;
            }
            PacketKind::Ack => {
                let delivery = Delivery::Ack {
                    remote_cid: pkt.src_cid,
                    error: pkt.error.clone(),
                };
                self.deliver(tun, &pkt, delivery).await;
            }
            PacketKind::Close => {
                self.connections.close_remote(tun, pkt.dest_cid, &pkt.error);
            }
            PacketKind::Route => match packet::decode::<PacketDataRoute>(&pkt.data) {
                Ok(change) => {
                    if route_tx.send(change).await.is_err() {
                        tracing::debug!(peer = %tun.id(), "tunnel: route worker gone");
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = %tun.id(), err = %err, "tunnel: bad route payload");
                }
            },
            PacketKind::Connect => {
                tracing::debug!(peer = %tun.id(), src = %pkt.src, "tunnel: connect after handshake ignored");
            }
        }
    }

    async fn deliver(&self, tun: &Arc<ConnectedTunnel>, pkt: &Packet, delivery: Delivery) {
        match self.connections.deliver(tun, pkt.dest_cid, delivery) {
            Ok(()) | Err(DeliverError::Full) => {}
            Err(err @ DeliverError::NotFound) => {
                tracing::debug!(
                    src = %pkt.src,
                    cid = pkt.dest_cid,
                    kind = %pkt.kind,
                    "tunnel: packet for unknown circuit"
                );
                self.reply(tun, pkt.reject(&self.id, err)).await;
            }
        }
    }

    async fn on_open(self: &Arc<Self>, tun: &Arc<ConnectedTunnel>, pkt: Packet) {
        let open: PacketDataOpen = match packet::decode(&pkt.data) {
            Ok(open) => open,
            Err(err) => {
                self.reply(tun, pkt.reject(&self.id, err)).await;
                return;
            }
        };
        let Ok(permit) = self.opens.clone().try_acquire_owned() else {
            tracing::warn!(src = %pkt.src, address = %open.address, "tunnel: too many pending circuits");
            self.reply(tun, pkt.reject(&self.id, "too many pending circuits"))
                .await;
            return;
        };

        let connections = self.connections.clone();
        let tun = tun.clone();
        tokio::spawn(async move {
            let accepted = connections
                .accept(&tun, &pkt.src, pkt.src_cid, &open)
                .await;
            drop(permit);
            let Some((conn, raw)) = accepted else { return };
            if let Err(err) = connections::relay(conn, raw).await {
                tracing::debug!(
                    remote = %pkt.src,
                    address = %open.address,
                    err = %err,
                    "tunnel: relay ended with error"
                );
            }
        });
    }

    async fn reply(&self, tun: &ConnectedTunnel, pkt: Packet) {
        if let Err(err) = tun.send(pkt).await {
            tracing::debug!(peer = %tun.id(), err = %err, "tunnel: reply failed");
        }
    }

    /// Reports which peers are still behind us, with fresh annotations, to
    /// every neighbor that takes route changes.
    pub async fn send_keepalive(&self, annotations: &Annotations) {
        self.send_route_update(RouteUpdateKind::KeepAlive, annotations)
            .await;
    }

    /// Re-sends the full reachable set so neighbors can drop stale children.
    pub async fn send_refresh(&self, annotations: &Annotations) {
        self.send_route_update(RouteUpdateKind::Refresh, annotations)
            .await;
    }

    async fn send_route_update(&self, kind: RouteUpdateKind, annotations: &Annotations) {
        for tun in self.routes.route_change_neighbors().await {
            let update = PacketDataRoute {
                kind,
                annotations: annotations.clone(),
                peers: self.routes.all_reachable_peers(Some(tun.id())).await,
            };
            let data = match packet::encode(&update) {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!(err = %err, "tunnel: encode route update");
                    return;
                }
            };
            let pkt = Packet::new(PacketKind::Route, self.id.clone(), tun.id()).with_data(data);
            if let Err(err) = tun.send(pkt).await {
                tracing::warn!(peer = %tun.id(), kind = ?kind, err = %err, "tunnel: send route update");
            }
        }
    }

    pub async fn run_keepalive(
        self: Arc<Self>,
        every: Duration,
        annotations: Annotations,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.run_periodic(RouteUpdateKind::KeepAlive, every, annotations, shutdown)
            .await
    }

    pub async fn run_refresh(
        self: Arc<Self>,
        every: Duration,
        annotations: Annotations,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.run_periodic(RouteUpdateKind::Refresh, every, annotations, shutdown)
            .await
    }

    async fn run_periodic(
        &self,
        kind: RouteUpdateKind,
        every: Duration,
        annotations: Annotations,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(!every.is_zero(), "tunnel: {kind:?} interval must be positive");
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                _ = ticker.tick() => match kind {
                    RouteUpdateKind::Refresh => self.send_refresh(&annotations).await,
                    _ => self.send_keepalive(&annotations).await,
                },
            }
        }
    }
}

/// Fallback disconnect for a `connect` future dropped mid-dispatch.
struct DisconnectGuard {
    server: Arc<TunnelServer>,
    tun: Option<Arc<ConnectedTunnel>>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let Some(tun) = self.tun.take() else { return };
        let server = self.server.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                server.routes.disconnect(&tun, &server.connections).await;
            });
        }
    }
}

/// A fresh peer id such as `edge-3f2a...`.
pub fn random_peer_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    use super::*;
    use crate::edgetunnel::tunnel::{
        auth::{NoAuth, TokenAuth},
        conn::StreamTunnel,
        testutil,
    };

    const UPSTREAM: TunnelOptions = TunnelOptions {
        send_route_change: true,
        is_default_out: true,
    };

    fn peer(id: &str) -> Arc<TunnelServer> {
        TunnelServer::new(id, Arc::new(NoAuth), TunnelServerOptions::default())
    }

    type Side = JoinHandle<Result<(), TunnelError>>;

    /// `down` joins `up` the way an upstream client joins a hub.
    fn link(up: &Arc<TunnelServer>, down: &Arc<TunnelServer>, token: &str) -> (Side, Side) {
        let (a, b) = testutil::stream_pair();
        let (up, down) = (up.clone(), down.clone());
        let token = token.to_string();
        let up_side = tokio::spawn(async move {
            up.connect(a, "", Annotations::new(), TunnelOptions::default())
                .await
        });
        let down_side = tokio::spawn(async move {
            let ann = Annotations::from([("role".to_string(), "agent".to_string())]);
            down.connect(b, &token, ann, UPSTREAM).await
        });
        (up_side, down_side)
    }

    async fn linked(up: &Arc<TunnelServer>, down: &Arc<TunnelServer>) -> (Side, Side) {
        let sides = link(up, down, "");
        let (up_id, down_id) = (up.id().to_string(), down.id().to_string());
        testutil::eventually(|| {
            let (up, down) = (up.clone(), down.clone());
            let (up_id, down_id) = (up_id.clone(), down_id.clone());
            async move { up.routes().exists(&down_id).await && down.routes().exists(&up_id).await }
        })
        .await;
        sides
    }

    async fn echo_server() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = sock.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn circuit_crosses_a_hub_to_a_real_socket() {
        let hub = peer("hub");
        let edge = peer("edge");
        let spoke = peer("spoke");
        let _e = linked(&hub, &edge).await;
        let _s = linked(&hub, &spoke).await;
        let addr = echo_server().await;

        let mut conn = spoke
            .dialer_on("edge")
            .dial_timeout("tcp", &addr, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.remote_peer(), "edge");
        assert_ne!(conn.remote_cid(), 0);

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.shutdown().await.unwrap();
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        conn.close().await;
        testutil::eventually(|| {
            let (spoke, edge) = (spoke.clone(), edge.clone());
            async move { spoke.connections().total() == 0 && edge.connections().total() == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn hub_learns_children_of_its_downstream() {
        let hub = peer("hub");
        let edge = peer("edge");
        let sensor = peer("sensor");
        let _a = linked(&edge, &sensor).await;
        let _b = linked(&hub, &edge).await;

        testutil::eventually(|| {
            let hub = hub.clone();
            async move {
                let reachable = hub.routes().all_reachable_peers(None).await;
                reachable.contains_key("sensor")
            }
        })
        .await;
        let snap = hub.routes().snapshot().await;
        let edge_rec = snap.neighbors.iter().find(|n| n.id == "edge").unwrap();
        assert!(edge_rec.children.contains_key("sensor"));
        assert_eq!(edge_rec.annotations["role"], "agent");
    }

    #[tokio::test]
    async fn open_to_unknown_peer_is_refused_by_the_hub() {
        let hub = peer("hub");
        let spoke = peer("spoke");
        let _s = linked(&hub, &spoke).await;

        let err = spoke
            .dialer_on("ghost")
            .dial("tcp", "127.0.0.1:1")
            .await
            .unwrap_err();
        match err {
            DialError::Remote { message, .. } => {
                assert_eq!(message, "no destination for peer ghost")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(spoke.connections().total(), 0);
    }

    #[tokio::test]
    async fn bad_token_fails_both_sides() {
        let hub = TunnelServer::new(
            "hub",
            Arc::new(TokenAuth::new("secret", HashMap::new())),
            TunnelServerOptions::default(),
        );
        let edge = peer("edge");
        let (up, down) = link(&hub, &edge, "wrong");

        assert!(matches!(up.await.unwrap(), Err(TunnelError::Auth(_))));
        match down.await.unwrap() {
            Err(TunnelError::RemoteClosed(msg)) => assert_eq!(msg, "invalid token for peer edge"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!hub.routes().exists("edge").await);
    }

    #[tokio::test]
    async fn duplicate_neighbor_id_is_refused() {
        let hub = peer("hub");
        let first = peer("edge");
        let second = peer("edge");
        let _keep = linked(&hub, &first).await;

        let (up, down) = link(&hub, &second, "");
        assert!(matches!(up.await.unwrap(), Err(TunnelError::AlreadyExists(_))));
        match down.await.unwrap() {
            Err(TunnelError::RemoteClosed(msg)) => {
                assert_eq!(msg, "id edge of tunnel already exists")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_id_is_refused() {
        let a = peer("hub");
        let b = peer("hub");
        let (up, down) = link(&a, &b, "");
        assert!(matches!(up.await.unwrap(), Err(TunnelError::SelfId(_))));
        assert!(down.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_remote_hits_handshake_timeout() {
        let hub = peer("hub");
        let (a, _b) = testutil::stream_pair();
        let err = hub
            .connect(a, "", Annotations::new(), TunnelOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn exhausted_open_budget_refuses_circuits() {
        let hub = peer("hub");
        let edge = TunnelServer::new(
            "edge",
            Arc::new(NoAuth),
            TunnelServerOptions {
                max_pending_opens: 0,
                ..Default::default()
            },
        );
        let _e = linked(&hub, &edge).await;

        let err = hub
            .dialer_on("edge")
            .dial("tcp", "127.0.0.1:1")
            .await
            .unwrap_err();
        match err {
            DialError::Remote { message, .. } => assert_eq!(message, "too many pending circuits"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn keepalive_refreshes_annotations_upstream() {
        let hub = peer("hub");
        let edge = peer("edge");
        let _e = linked(&hub, &edge).await;

        let ann = Annotations::from([("version".to_string(), "2".to_string())]);
        edge.send_keepalive(&ann).await;

        testutil::eventually(|| {
            let hub = hub.clone();
            async move {
                let snap = hub.routes().snapshot().await;
                snap.neighbors
                    .iter()
                    .any(|n| n.id == "edge" && n.annotations.get("version").map(String::as_str) == Some("2"))
            }
        })
        .await;
    }

    #[tokio::test]
    async fn periodic_refresh_reaches_the_hub_and_stops_on_shutdown() {
        let hub = peer("hub");
        let edge = peer("edge");
        let _e = linked(&hub, &edge).await;

        let (stop, shutdown) = watch::channel(false);
        let ann = Annotations::from([("version".to_string(), "3".to_string())]);
        let refreshing = tokio::spawn(edge.clone().run_refresh(Duration::from_millis(10), ann, shutdown));

        testutil::eventually(|| {
            let hub = hub.clone();
            async move {
                let snap = hub.routes().snapshot().await;
                snap.neighbors
                    .iter()
                    .any(|n| n.id == "edge" && n.annotations.get("version").map(String::as_str) == Some("3"))
            }
        })
        .await;

        stop.send(true).unwrap();
        refreshing.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watcher_sees_snapshot_then_disconnect() {
        let hub = peer("hub");
        let edge = peer("edge");
        let (_up, down) = linked(&hub, &edge).await;

        let (_stop, shutdown) = watch::channel(false);
        let mut w = hub.watch(shutdown).await;
        let first = w.recv().await.unwrap();
        assert_eq!(first.from, "hub");
        assert!(first.peers.contains_key("edge"));

        down.abort();
        loop {
            let ev = w.recv().await.unwrap();
            if ev.kind == EventKind::Disconnected {
                assert_eq!(ev.from, "edge");
                assert!(ev.peers.contains_key("edge"));
                break;
            }
        }
        assert!(!hub.routes().exists("edge").await);
    }

    /// A TCP server that hands every accepted socket to the test.
    async fn handing_server() -> (String, mpsc::Receiver<TcpStream>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            while let Ok((sock, _)) = ln.accept().await {
                if tx.send(sock).await.is_err() {
                    return;
                }
            }
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn opener_close_releases_the_dialed_socket() {
        let hub = peer("hub");
        let edge = peer("edge");
        let _e = linked(&hub, &edge).await;
        let (addr, mut accepted) = handing_server().await;

        let mut conn = hub.dialer_on("edge").dial("tcp", &addr).await.unwrap();
        let mut target = accepted.recv().await.unwrap();
        assert_eq!(edge.connections().total(), 1);

        conn.close().await;
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), target.read(&mut buf))
            .await
            .expect("dialed socket still open after close")
            .unwrap_or(0);
        assert_eq!(n, 0);
        testutil::eventually(|| {
            let edge = edge.clone();
            async move { edge.connections().total() == 0 }
        })
        .await;
    }

    #[tokio::test]
    async fn target_eof_tears_down_both_ends() {
        let hub = peer("hub");
        let edge = peer("edge");
        let _e = linked(&hub, &edge).await;
        let (addr, mut accepted) = handing_server().await;

        let mut conn = hub.dialer_on("edge").dial("tcp", &addr).await.unwrap();
        let mut target = accepted.recv().await.unwrap();
        target.write_all(b"hi").await.unwrap();
        drop(target);

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), conn.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"hi");

        // The opener still holds its conn; both circuit slots are gone anyway.
        testutil::eventually(|| {
            let (hub, edge) = (hub.clone(), edge.clone());
            async move { hub.connections().total() == 0 && edge.connections().total() == 0 }
        })
        .await;
        drop(conn);
    }

    /// Drives the far side of a tunnel by hand: joins `hub` as `edge`.
    async fn join_by_hand(hub: &Arc<TunnelServer>) -> Arc<StreamTunnel> {
        let (a, b) = testutil::stream_pair();
        {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.connect(a, "", Annotations::new(), TunnelOptions::default())
                    .await
            });
        }
        let hello = PacketDataConnect { token: String::new() };
        b.send(Packet::new(PacketKind::Connect, "edge", "").with_data(packet::encode(&hello).unwrap()))
            .await
            .unwrap();
        assert_eq!(b.recv().await.unwrap().kind, PacketKind::Connect);
        b.send(Packet::new(PacketKind::Ack, "edge", "hub")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().kind, PacketKind::Ack);
        assert_eq!(b.recv().await.unwrap().kind, PacketKind::Route);
        let init = PacketDataRoute {
            kind: RouteUpdateKind::Init,
            annotations: Annotations::new(),
            peers: PeerAnnotations::new(),
        };
        b.send(Packet::new(PacketKind::Route, "edge", "hub").with_data(packet::encode(&init).unwrap()))
            .await
            .unwrap();
        testutil::eventually(|| {
            let hub = hub.clone();
            async move { hub.routes().exists("edge").await }
        })
        .await;
        b
    }

    /// Opens a circuit from `hub` to the hand-driven `edge`, acking with `remote_cid`.
    async fn open_by_hand(
        hub: &Arc<TunnelServer>,
        edge: &StreamTunnel,
        remote_cid: i64,
    ) -> TunnelConn {
        let dialer = hub.dialer_on("edge");
        let dialing = tokio::spawn(async move { dialer.dial("tcp", "db:5432").await });
        let open = edge.recv().await.unwrap();
        assert_eq!(open.kind, PacketKind::Open);
        edge.send(Packet::new(PacketKind::Ack, "edge", "hub").with_cids(remote_cid, open.src_cid))
            .await
            .unwrap();
        dialing.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn backlogged_circuit_drops_without_stalling_its_neighbor() {
        let hub = peer("hub");
        let edge = join_by_hand(&hub).await;
        let mut slow = open_by_hand(&hub, &edge, 100).await;
        let mut fast = open_by_hand(&hub, &edge, 200).await;

        let backlog = connections::DEFAULT_DATA_CHANNEL_SIZE + 88;
        for _ in 0..backlog {
            let pkt = Packet::new(PacketKind::Data, "edge", "hub")
                .with_cids(100, slow.local_cid())
                .with_data(Bytes::from_static(b"x"));
            edge.send(pkt).await.unwrap();
        }
        let pkt = Packet::new(PacketKind::Data, "edge", "hub")
            .with_cids(200, fast.local_cid())
            .with_data(Bytes::from_static(b"ok"));
        edge.send(pkt).await.unwrap();

        let mut buf = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), fast.read_exact(&mut buf))
            .await
            .expect("second circuit stalled behind the first")
            .unwrap();
        assert_eq!(&buf, b"ok");

        let mut kept = vec![0u8; connections::DEFAULT_DATA_CHANNEL_SIZE];
        slow.read_exact(&mut kept).await.unwrap();
        assert!(kept.iter().all(|b| *b == b'x'));
        let mut more = [0u8; 1];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), slow.read(&mut more))
                .await
                .is_err(),
            "packets past the channel capacity were kept"
        );
    }

    #[test]
    fn random_ids_are_prefixed_and_distinct() {
        let a = random_peer_id("peer");
        let b = random_peer_id("peer");
        assert!(a.starts_with("peer-"));
        assert_ne!(a, b);
    }
}
