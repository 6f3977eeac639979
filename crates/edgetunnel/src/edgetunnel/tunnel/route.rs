use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::edgetunnel::{
    telemetry,
    tunnel::{
        conn::{ConnectedTunnel, TunnelError},
        connections::ConnectionManager,
        event::{Eventer, TunnelEvent},
        packet::{self, Annotations, Packet, PacketDataRoute, PacketKind, PeerAnnotations, RouteUpdateKind},
    },
};

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no destination for peer {0}")]
    NoDestination(String),
}

/// A neighbor and the peers reachable through it.
#[derive(Debug)]
pub struct ChannelWithChildren {
    pub channel: Arc<ConnectedTunnel>,
    pub annotations: Annotations,
    pub children: PeerAnnotations,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborSnapshot {
    pub id: String,
    pub annotations: Annotations,
    pub children: PeerAnnotations,
    pub send_route_change: bool,
    pub is_default_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub local: String,
    pub default_out: Option<String>,
    pub neighbors: Vec<NeighborSnapshot>,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, ChannelWithChildren>,
    default_out: Option<Arc<ConnectedTunnel>>,
}

impl State {
    /// Record for `tun`, only if it is still the registered tunnel.
    fn record_of(&mut self, tun: &Arc<ConnectedTunnel>) -> Option<&mut ChannelWithChildren> {
        self.records
            .get_mut(tun.id())
            .filter(|r| Arc::ptr_eq(&r.channel, tun))
    }

    /// A peer is a child of at most one neighbor.
    fn claim(&mut self, owner: &str, peers: &PeerAnnotations) {
        for (id, rec) in self.records.iter_mut() {
            if id != owner {
                rec.children.retain(|p, _| !peers.contains_key(p));
            }
        }
    }
}

/// Adjacency view of the overlay: direct neighbors, what each of them can
/// reach, and the default-out neighbor.
#[derive(Debug)]
pub struct RouteTable {
    local: String,
    state: RwLock<State>,
    eventer: Arc<Eventer>,
}

impl RouteTable {
    pub fn new(local: impl Into<String>, eventer: Arc<Eventer>) -> Self {
        Self {
            local: local.into(),
            state: RwLock::new(State::default()),
            eventer,
        }
    }

    /// Neighbor to hand a packet for `dest` to: a direct neighbor, else the
    /// neighbor whose children list it, else the default-out neighbor.
    pub async fn select(&self, dest: &str) -> Result<Arc<ConnectedTunnel>, RouteError> {
        let st = self.state.read().await;
        if let Some(rec) = st.records.get(dest) {
            return Ok(rec.channel.clone());
        }
        if let Some(rec) = st.records.values().find(|r| r.children.contains_key(dest)) {
            return Ok(rec.channel.clone());
        }
        st.default_out
            .clone()
            .ok_or_else(|| RouteError::NoDestination(dest.to_string()))
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.state.read().await.records.contains_key(id)
    }

    /// Registers a neighbor and applies its initial route exchange.
    pub async fn connect(
        &self,
        tun: Arc<ConnectedTunnel>,
        init: PacketDataRoute,
    ) -> Result<(), TunnelError> {
        {
            let mut st = self.state.write().await;
            if st.records.contains_key(tun.id()) {
                return Err(TunnelError::AlreadyExists(tun.id().to_string()));
            }
            st.records.insert(
                tun.id().to_string(),
                ChannelWithChildren {
                    channel: tun.clone(),
                    annotations: init.annotations.clone(),
                    children: PeerAnnotations::new(),
                },
            );
            if tun.options().is_default_out {
                st.default_out = Some(tun.clone());
            }
            metrics::gauge!(telemetry::NEIGHBORS).set(st.records.len() as f64);
        }
        self.on_change(&tun, init).await;
        Ok(())
    }

    /// Removes the neighbor (only if `tun` is still the registered tunnel),
    /// closes its circuits and advertises everything behind it as offline.
    pub async fn disconnect(&self, tun: &Arc<ConnectedTunnel>, conns: &ConnectionManager) {
        let removed = {
            let mut st = self.state.write().await;
            if st.record_of(tun).is_none() {
                None
            } else {
                let rec = st.records.remove(tun.id());
                if st
                    .default_out
                    .as_ref()
                    .is_some_and(|d| Arc::ptr_eq(d, tun))
                {
                    st.default_out = None;
                }
                metrics::gauge!(telemetry::NEIGHBORS).set(st.records.len() as f64);
                rec
            }
        };

        conns.tunnel_closed(tun);

        let Some(rec) = removed else { return };
        let mut peers = rec.children;
        peers.insert(tun.id().to_string(), rec.annotations.clone());
        self.advertise(
            tun.id(),
            PacketDataRoute {
                kind: RouteUpdateKind::Offline,
                annotations: rec.annotations,
                peers,
            },
        )
        .await;
    }

    /// Applies a route update received from neighbor `from` and propagates
    /// the resulting change.
    pub async fn on_change(&self, from: &Arc<ConnectedTunnel>, change: PacketDataRoute) {
        let id = from.id().to_string();
        let mut peers = change.peers.clone();
        peers.remove(&self.local);
        peers.remove(&id);

        let updates = {
            let mut st = self.state.write().await;
            let Some(rec) = st.record_of(from) else {
                tracing::debug!(peer=%id, kind=?change.kind, "tunnel: route change from unknown neighbor");
                return;
            };

            match change.kind {
                RouteUpdateKind::Init | RouteUpdateKind::Refresh => {
                    let gone: PeerAnnotations = rec
                        .children
                        .iter()
                        .filter(|(p, _)| !peers.contains_key(*p))
                        .map(|(p, a)| (p.clone(), a.clone()))
                        .collect();
                    rec.children = peers.clone();
                    rec.annotations = change.annotations.clone();
                    st.claim(&id, &peers);

                    let mut online = peers;
                    online.insert(id.clone(), change.annotations.clone());
                    let mut out = vec![PacketDataRoute {
                        kind: RouteUpdateKind::Online,
                        annotations: change.annotations.clone(),
                        peers: online,
                    }];
                    if !gone.is_empty() {
                        out.push(PacketDataRoute {
                            kind: RouteUpdateKind::Offline,
                            annotations: change.annotations,
                            peers: gone,
                        });
                    }
                    out
                }
                RouteUpdateKind::KeepAlive => {
                    let fresh: PeerAnnotations = peers
                        .iter()
                        .filter(|(p, _)| !rec.children.contains_key(*p))
                        .map(|(p, a)| (p.clone(), a.clone()))
                        .collect();
                    rec.children.extend(fresh.clone());
                    rec.annotations = change.annotations.clone();
                    st.claim(&id, &fresh);

                    let mut seen = peers;
                    seen.insert(id.clone(), change.annotations.clone());
                    vec![PacketDataRoute {
                        kind: RouteUpdateKind::KeepAlive,
                        annotations: change.annotations,
                        peers: seen,
                    }]
                }
                RouteUpdateKind::Online => {
                    rec.children.extend(peers.clone());
                    st.claim(&id, &peers);
                    vec![change]
                }
                RouteUpdateKind::Offline => {
                    // Only what this neighbor still owned; a peer claimed by
                    // another neighbor stays reachable.
                    let removed: PeerAnnotations = peers
                        .keys()
                        .filter_map(|p| rec.children.remove_entry(p))
                        .collect();
                    if removed.is_empty() {
                        vec![]
                    } else {
                        vec![PacketDataRoute {
                            kind: RouteUpdateKind::Offline,
                            annotations: change.annotations,
                            peers: removed,
                        }]
                    }
                }
            }
        };

        for update in updates {
            self.advertise(&id, update).await;
        }
    }

    /// Sends `change` to every neighbor that takes route changes, except the
    /// one it came from, and mirrors it to local observers.
    async fn advertise(&self, from: &str, change: PacketDataRoute) {
        let targets: Vec<Arc<ConnectedTunnel>> = {
            let st = self.state.read().await;
            st.records
                .iter()
                .filter(|(id, rec)| id.as_str() != from && rec.channel.options().send_route_change)
                .map(|(_, rec)| rec.channel.clone())
                .collect()
        };

        if let Some(event) = TunnelEvent::for_route(from, &change) {
            self.eventer.publish(event);
        }
        if targets.is_empty() {
            return;
        }

        let data = match packet::encode(&change) {
            Ok(d) => d,
            Err(err) => {
                tracing::error!(err=%err, "tunnel: encode route change");
                return;
            }
        };
        for target in targets {
            let pkt = Packet::new(PacketKind::Route, self.local.clone(), target.id())
                .with_data(data.clone());
            if let Err(err) = target.send(pkt).await {
                tracing::warn!(peer=%target.id(), kind=?change.kind, err=%err, "tunnel: advertise route change");
            }
        }
    }

    /// Every peer reachable from here, optionally leaving out one neighbor
    /// and everything behind it.
    pub async fn all_reachable_peers(&self, exclude: Option<&str>) -> PeerAnnotations {
        let st = self.state.read().await;
        let mut out = PeerAnnotations::new();
        for (id, rec) in &st.records {
            if exclude == Some(id.as_str()) {
                continue;
            }
            out.insert(id.clone(), rec.annotations.clone());
            out.extend(rec.children.iter().map(|(p, a)| (p.clone(), a.clone())));
        }
        out
    }

    /// Neighbors that take route changes from us.
    pub async fn route_change_neighbors(&self) -> Vec<Arc<ConnectedTunnel>> {
        let st = self.state.read().await;
        st.records
            .values()
            .filter(|r| r.channel.options().send_route_change)
            .map(|r| r.channel.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> RouteSnapshot {
        let st = self.state.read().await;
        let mut neighbors: Vec<NeighborSnapshot> = st
            .records
            .iter()
            .map(|(id, rec)| NeighborSnapshot {
                id: id.clone(),
                annotations: rec.annotations.clone(),
                children: rec.children.clone(),
                send_route_change: rec.channel.options().send_route_change,
                is_default_out: rec.channel.options().is_default_out,
            })
            .collect();
        neighbors.sort_by(|a, b| a.id.cmp(&b.id));
        RouteSnapshot {
            local: self.local.clone(),
            default_out: st.default_out.as_ref().map(|d| d.id().to_string()),
            neighbors,
        }
    }
}
