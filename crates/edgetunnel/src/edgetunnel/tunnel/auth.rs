use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token for peer {0}")]
    InvalidToken(String),
    #[error("peer {0} is not allowed")]
    UnknownPeer(String),
}

/// Decides whether a peer presenting `token` may join.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, peer: &str, token: &str) -> Result<(), AuthError>;
}

/// Accepts every peer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl Authenticator for NoAuth {
    async fn authenticate(&self, _peer: &str, _token: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Static tokens: a per-peer table, falling back to one shared token.
///
/// With a per-peer table and no shared token, peers missing from the table
/// are refused.
#[derive(Debug, Clone, Default)]
pub struct TokenAuth {
    shared: String,
    peers: HashMap<String, String>,
}

impl TokenAuth {
    pub fn new(shared: impl Into<String>, peers: HashMap<String, String>) -> Self {
        Self {
            shared: shared.into(),
            peers,
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuth {
    async fn authenticate(&self, peer: &str, token: &str) -> Result<(), AuthError> {
        let expected = match self.peers.get(peer) {
            Some(t) => t.as_str(),
            None if !self.shared.is_empty() => self.shared.as_str(),
            None if !self.peers.is_empty() => {
                return Err(AuthError::UnknownPeer(peer.to_string()));
            }
            None => return Ok(()),
        };
        if !token_eq(expected.as_bytes(), token.as_bytes()) {
            tracing::warn!(peer=%peer, "tunnel: bad token");
            return Err(AuthError::InvalidToken(peer.to_string()));
        }
        Ok(())
    }
}

fn token_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Builds the authenticator for a peer's configured tokens.
pub fn from_tokens(shared: &str, peers: &HashMap<String, String>) -> Arc<dyn Authenticator> {
    if shared.is_empty() && peers.is_empty() {
        Arc::new(NoAuth)
    } else {
        Arc::new(TokenAuth::new(shared, peers.clone()))
    }
}
