use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::edgetunnel::tunnel::{
    conn::{ConnectedTunnel, StreamTunnel, Tunnel, TunnelError, TunnelOptions},
    packet::{Annotations, Packet, PacketKind},
};

/// Records everything sent; `recv` yields packets pushed through `inbound`.
pub struct RecordingTunnel {
    sent: Mutex<Vec<Packet>>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl RecordingTunnel {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(64);
        let t = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound: tokio::sync::Mutex::new(rx),
        });
        (t, tx)
    }

    pub fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    fn find(&self, kind: PacketKind) -> Option<Packet> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl Tunnel for RecordingTunnel {
    async fn send(&self, pkt: Packet) -> Result<(), TunnelError> {
        self.sent.lock().unwrap().push(pkt);
        Ok(())
    }

    async fn recv(&self) -> Result<Packet, TunnelError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TunnelError::Closed)
    }
}

pub fn connected(id: &str, options: TunnelOptions) -> (Arc<ConnectedTunnel>, Arc<RecordingTunnel>) {
    let (rec, _inbound) = RecordingTunnel::new();
    let tun = Arc::new(ConnectedTunnel::new(
        id,
        rec.clone(),
        options,
        Annotations::new(),
    ));
    (tun, rec)
}

pub async fn wait_for_packet(rec: &RecordingTunnel, kind: PacketKind) -> Packet {
    for _ in 0..400 {
        if let Some(p) = rec.find(kind) {
            return p;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no {kind} packet sent");
}

pub async fn eventually<F, Fut>(mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if f().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Two stream tunnels joined back to back in memory.
pub fn stream_pair() -> (Arc<StreamTunnel>, Arc<StreamTunnel>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (
        Arc::new(StreamTunnel::new(Box::new(a))),
        Arc::new(StreamTunnel::new(Box::new(b))),
    )
}
