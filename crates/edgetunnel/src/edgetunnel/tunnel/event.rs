use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::edgetunnel::tunnel::{
    packet::{Annotations, PacketDataRoute, PeerAnnotations, RouteUpdateKind},
    shutdown_requested,
};

// Observers only need the latest state; intermediate events may be skipped.
pub const WATCH_CHANNEL_DEPTH: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Disconnected,
    KeepAlive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelEvent {
    pub from: String,
    pub from_annotations: Annotations,
    pub kind: EventKind,
    pub peers: PeerAnnotations,
}

impl TunnelEvent {
    /// The event mirrored for an advertised route change, if any.
    pub fn for_route(from: &str, change: &PacketDataRoute) -> Option<Self> {
        let kind = match change.kind {
            RouteUpdateKind::Online => EventKind::Connected,
            RouteUpdateKind::Offline => EventKind::Disconnected,
            RouteUpdateKind::KeepAlive => EventKind::KeepAlive,
            RouteUpdateKind::Init | RouteUpdateKind::Refresh => return None,
        };
        Some(Self {
            from: from.to_string(),
            from_annotations: change.annotations.clone(),
            kind,
            peers: change.peers.clone(),
        })
    }
}

/// Fan-out of topology changes to local observers.
#[derive(Debug, Default)]
pub struct Eventer {
    seq: AtomicU64,
    watchers: DashMap<u64, mpsc::Sender<TunnelEvent>>,
}

impl Eventer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. `snapshot` is delivered first; the
    /// subscription ends on shutdown or when the watcher is dropped.
    pub fn watch(
        self: &Arc<Self>,
        snapshot: TunnelEvent,
        mut shutdown: watch::Receiver<bool>,
    ) -> EventWatcher {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_DEPTH);
        let _ = tx.try_send(snapshot);

        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.watchers.insert(id, tx);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let eventer = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {}
                _ = stop_rx => {}
            }
            if let Some(eventer) = eventer.upgrade() {
                eventer.watchers.remove(&id);
            }
        });

        EventWatcher {
            rx,
            _stop: stop_tx,
        }
    }

    /// Delivers to every observer without blocking; full observers miss it.
    pub fn publish(&self, event: TunnelEvent) {
        let mut gone = Vec::new();
        for w in self.watchers.iter() {
            match w.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(watcher = *w.key(), "tunnel: event dropped; watcher busy");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*w.key()),
            }
        }
        for id in gone {
            self.watchers.remove(&id);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// Receiving end of [`Eventer::watch`].
#[derive(Debug)]
pub struct EventWatcher {
    rx: mpsc::Receiver<TunnelEvent>,
    _stop: oneshot::Sender<()>,
}

impl EventWatcher {
    /// Next event, or `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<TunnelEvent> {
        self.rx.recv().await
    }
}
