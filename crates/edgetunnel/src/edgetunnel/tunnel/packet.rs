use std::{collections::BTreeMap, fmt, time::Duration};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::edgetunnel::tunnel::protocol::ProtocolError;

/// Free-form key/value metadata a peer attaches to itself.
pub type Annotations = BTreeMap<String, String>;

/// Reachable peers keyed by id, each with the annotations it advertised.
pub type PeerAnnotations = BTreeMap<String, Annotations>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Connect = 1,
    Open = 2,
    Close = 3,
    Route = 4,
    Ack = 5,
}

impl PacketKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Data),
            1 => Some(Self::Connect),
            2 => Some(Self::Open),
            3 => Some(Self::Close),
            4 => Some(Self::Route),
            5 => Some(Self::Ack),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketKind::Data => "data",
            PacketKind::Connect => "connect",
            PacketKind::Open => "open",
            PacketKind::Close => "close",
            PacketKind::Route => "route",
            PacketKind::Ack => "ack",
        };
        f.write_str(s)
    }
}

/// The unit exchanged over a tunnel.
///
/// An empty `dest` is addressed to the receiving peer. A circuit id of `0`
/// means "unset".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub src: String,
    pub dest: String,
    pub src_cid: i64,
    pub dest_cid: i64,
    pub data: Bytes,
    pub error: String,
}

impl Packet {
    pub fn new(kind: PacketKind, src: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            kind,
            src: src.into(),
            dest: dest.into(),
            src_cid: 0,
            dest_cid: 0,
            data: Bytes::new(),
            error: String::new(),
        }
    }

    pub fn with_cids(mut self, src_cid: i64, dest_cid: i64) -> Self {
        self.src_cid = src_cid;
        self.dest_cid = dest_cid;
        self
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// A `Close` sent from `local` back to whoever originated `self`.
    pub fn reject(&self, local: &str, error: impl fmt::Display) -> Packet {
        Packet::new(PacketKind::Close, local, self.src.clone())
            .with_cids(self.dest_cid, self.src_cid)
            .with_error(error.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDataConnect {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDataOpen {
    pub network: String,
    pub address: String,
    /// Remote dial timeout; `0` lets the acceptor pick its default.
    #[serde(default)]
    pub timeout_ms: u64,
}

impl PacketDataOpen {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteUpdateKind {
    #[default]
    Init,
    Refresh,
    Online,
    Offline,
    KeepAlive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketDataRoute {
    pub kind: RouteUpdateKind,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default)]
    pub peers: PeerAnnotations,
}

pub fn encode<T: Serialize>(v: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(v)?))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_payload_uses_lowercase_kinds() {
        let mut peers = PeerAnnotations::new();
        peers.insert("edge-1".into(), Annotations::from([("zone".into(), "a".into())]));
        let change = PacketDataRoute {
            kind: RouteUpdateKind::KeepAlive,
            annotations: Annotations::new(),
            peers,
        };

        let raw = encode(&change).unwrap();
        let s = std::str::from_utf8(&raw).unwrap();
        assert!(s.contains(r#""kind":"keepalive""#), "{s}");

        let back: PacketDataRoute = decode(&raw).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn open_payload_defaults_timeout() {
        let open: PacketDataOpen =
            decode(br#"{"network":"tcp","address":"db:5432"}"#).unwrap();
        assert_eq!(open.address, "db:5432");
        assert_eq!(open.timeout(), None);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode::<PacketDataConnect>(b"not json").is_err());
    }

    #[test]
    fn reject_swaps_direction() {
        let pkt = Packet::new(PacketKind::Data, "spoke", "edge").with_cids(7, 3);
        let close = pkt.reject("hub", "no destination for peer edge");
        assert_eq!(close.kind, PacketKind::Close);
        assert_eq!(close.src, "hub");
        assert_eq!(close.dest, "spoke");
        assert_eq!(close.dest_cid, 7);
        assert_eq!(close.src_cid, 3);
        assert_eq!(close.error, "no destination for peer edge");
    }
}
