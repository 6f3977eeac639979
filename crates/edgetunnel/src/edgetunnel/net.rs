use std::{borrow::Cow, io, net::SocketAddr, time::Duration};

use tokio::net::TcpStream;

use crate::edgetunnel::tunnel::transport::BoxedStream;

/// Normalize a bind/listen address.
///
/// Config commonly uses the shorthand `":PORT"` to mean "bind on all
/// interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs do not accept
/// `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

pub async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}

/// Dials `address` over `network` (`tcp`, `tcp4`, `tcp6`, or `unix` on unix
/// hosts) within `timeout`.
pub async fn dial(network: &str, address: &str, timeout: Duration) -> io::Result<BoxedStream> {
    match tokio::time::timeout(timeout, dial_inner(network, address)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {network} {address}: i/o timeout"),
        )),
    }
}

async fn dial_inner(network: &str, address: &str) -> io::Result<BoxedStream> {
    let family: fn(&SocketAddr) -> bool = match network {
        "" | "tcp" => |_| true,
        "tcp4" => SocketAddr::is_ipv4,
        "tcp6" => SocketAddr::is_ipv6,
        #[cfg(unix)]
        "unix" => {
            let s = tokio::net::UnixStream::connect(address).await?;
            return Ok(Box::new(s));
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {other:?}"),
            ));
        }
    };

    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await?.filter(family) {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                let _ = s.set_nodelay(true);
                return Ok(Box::new(s));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address for {address}"),
        )
    }))
}
