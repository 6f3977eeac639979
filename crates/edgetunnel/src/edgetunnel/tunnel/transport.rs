use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

pub const DEFAULT_ALPN: &[u8] = b"edgetunnel";

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    /// PEM bundle of roots trusted for the server certificate.
    pub ca_file: String,
    pub insecure_skip_verify: bool,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub quic: QuicDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// One physical connection carrying multiplexed streams.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    #[default]
    Tcp,
    Quic,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "quic" => Ok(Self::Quic),
            _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic)"),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Quic => "quic",
        })
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![DEFAULT_ALPN.to_vec()]
}

pub mod quic;
pub mod tcp;

pub fn transport_for(kind: TransportKind) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Tcp => Arc::new(tcp::TcpTransport::new()),
        TransportKind::Quic => Arc::new(quic::QuicTransport::new()),
    }
}
