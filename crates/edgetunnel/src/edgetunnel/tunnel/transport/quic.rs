use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use pin_project_lite::pin_project;
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, TransportConfig};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{Mutex, mpsc},
};

use crate::edgetunnel::{
    net,
    tunnel::transport::{
        BoxedStream, QuicDialOptions, QuicListenOptions, Transport, TransportDialOptions,
        TransportKind, TransportListenOptions, TransportListener, TransportSession, default_alpn,
    },
};

const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// QUIC with one bidirectional stream per tunnel.
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<TransportConfig> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into()?));
    cfg.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Ok(cfg)
}

#[async_trait]
impl Transport for QuicTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Quic
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let addr = net::resolve_socket_addr(&net::normalize_bind_addr(addr)).await?;
        let QuicListenOptions {
            cert_file,
            key_file,
            next_protos,
        } = opts.quic;

        let (cert_chain, key) = quic_tls::load_or_generate_cert(&cert_file, &key_file)?;
        let server_crypto =
            quic_tls::server_crypto_config(cert_chain, key, default_alpn(&next_protos))?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)?,
        ));
        server_cfg.transport_config(Arc::new(transport_config()?));

        let endpoint = Endpoint::server(server_cfg, addr)?;
        Ok(Box::new(QuicTransportListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let QuicDialOptions {
            server_name,
            ca_file,
            insecure_skip_verify,
            next_protos,
        } = opts.quic;

        let client_crypto = quic_tls::client_crypto_config(
            &ca_file,
            insecure_skip_verify,
            default_alpn(&next_protos),
        )?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_config()?));

        let remote = net::resolve_socket_addr(addr).await?;
        let bind = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = match server_name.trim() {
            "" => "localhost",
            n => n,
        };
        let conn = endpoint.connect(remote, name)?.await?;
        Ok(Arc::new(QuicSession::new(conn, Some(endpoint))))
    }
}

pub struct QuicTransportListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        loop {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or_else(|| anyhow::anyhow!("tunnel: quic endpoint closed"))?;
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(conn) => return Ok(Arc::new(QuicSession::new(conn, None))),
                Err(err) => {
                    tracing::debug!(client=%remote, err=%err, "tunnel: quic handshake failed");
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint.close(0u32.into(), b"");
        Ok(())
    }
}

struct QuicSession {
    conn: Connection,
    incoming: Mutex<mpsc::Receiver<(quinn::SendStream, quinn::RecvStream)>>,
    task: tokio::task::JoinHandle<()>,
    // Client sessions own their endpoint; it must outlive the connection.
    _endpoint: Option<Endpoint>,
}

impl QuicSession {
    fn new(conn: Connection, endpoint: Option<Endpoint>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let c = conn.clone();
        let task = tokio::spawn(async move {
            while let Ok(st) = c.accept_bi().await {
                if tx.send(st).await.is_err() {
                    break;
                }
            }
        });
        Self {
            conn,
            incoming: Mutex::new(rx),
            task,
            _endpoint: endpoint,
        }
    }
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        let (send, recv) = self.conn.open_bi().await?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let mut rx = self.incoming.lock().await;
        let (send, recv) = rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: session closed"))?;
        Ok(Box::new(QuicBiStream { send, recv }))
    }

    async fn close(&self) {
        self.task.abort();
        self.conn.close(0u32.into(), b"");
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }
}

pin_project! {
    struct QuicBiStream {
        #[pin]
        send: quinn::SendStream,
        #[pin]
        recv: quinn::RecvStream,
    }
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(self.project().recv, cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().send, cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(self.project().send, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(self.project().send, cx)
    }
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use anyhow::Context;
    use rcgen::generate_simple_self_signed;
    use rustls::{
        client::danger::{ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn load_or_generate_cert(
        cert_file: &str,
        key_file: &str,
    ) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let cert_file = cert_file.trim();
        let key_file = key_file.trim();

        if !cert_file.is_empty() || !key_file.is_empty() {
            if cert_file.is_empty() || key_file.is_empty() {
                anyhow::bail!(
                    "tunnel: quic requires both cert_file and key_file (or neither to auto-generate)"
                );
            }
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            return Ok((certs, key));
        }

        tracing::warn!("tunnel: quic listener using a self-signed certificate");
        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(["localhost".to_string()])?;
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
        Ok((vec![cert_der], key_der))
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path).with_context(|| format!("tunnel: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("tunnel: no certificate found in {}", path.display());
        }
        Ok(certs)
    }

    fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let data = fs::read(path).with_context(|| format!("tunnel: read {}", path.display()))?;
        let mut rd = std::io::Cursor::new(&data);
        let Some(key) = rustls_pemfile::private_key(&mut rd)? else {
            anyhow::bail!("tunnel: no private key found in {}", path.display());
        };
        Ok(key)
    }

    pub fn server_crypto_config(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ServerConfig> {
        let mut cfg = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    pub fn client_crypto_config(
        ca_file: &str,
        insecure_skip_verify: bool,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;

        let mut cfg = if insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            let ca_file = ca_file.trim();
            if !ca_file.is_empty() {
                for cert in load_certs(Path::new(ca_file))? {
                    roots.add(cert)?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    /// Accepts any server certificate, so it is open to MITM. Meant for
    /// local setups and tests.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

}
