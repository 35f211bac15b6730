//! Authentication step run on every connection before it carries data.
//!
//! The initiator (the side that dialed) calls [`Authenticator::request`], the
//! acceptor calls [`Authenticator::authorize`]. All reads use
//! [`RecvMode::Just`] so that nothing after the handshake is pulled into the
//! inbound buffer.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::connection::{Connection, RecvMode};
use crate::error::{Result, TransportError};
use crate::status::StatusCode;
use crate::wire::{Blob, FixedBuf};

const NONCE_LEN: usize = 32;
const MAC_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Authentication method shared by both ends of a connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticates this side to the acceptor.
    async fn request(&self, conn: &mut Connection) -> Result<()>;

    /// Verifies the initiator and returns its identity.
    async fn authorize(&self, conn: &mut Connection) -> Result<String>;
}

async fn expect_granted(conn: &mut Connection) -> Result<()> {
    let status: StatusCode = conn.recv_value(RecvMode::Just).await?;
    if !status.is_ok() {
        return Err(TransportError::AuthFailed {
            reason: format!("rejected by {}: {}", conn.peer(), status),
        });
    }
    Ok(())
}

/// Accepts whatever identity the initiator claims. For trusted networks and
/// tests.
#[derive(Debug, Clone)]
pub struct TrustedPeer {
    identity: String,
}

impl TrustedPeer {
    /// Authenticates as `identity` when initiating.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TrustedPeer {
    async fn request(&self, conn: &mut Connection) -> Result<()> {
        conn.send(self.identity.as_str()).await?;
        expect_granted(conn).await
    }

    async fn authorize(&self, conn: &mut Connection) -> Result<String> {
        let identity: String = conn.recv_value(RecvMode::Just).await?;
        conn.send(&StatusCode::Ok).await?;
        conn.flush().await?;
        debug!(peer = conn.peer(), identity = %identity, "peer trusted");
        Ok(identity)
    }
}

/// HMAC-SHA256 challenge-response over a pre-shared secret.
///
/// The acceptor sends a random nonce; the initiator answers with its identity
/// and `HMAC(secret, nonce || service || identity)`.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Vec<u8>,
    service: String,
    identity: String,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("service", &self.service)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// Creates an authenticator for `service`, authenticating as `identity`.
    pub fn new(
        secret: impl Into<Vec<u8>>,
        service: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            service: service.into(),
            identity: identity.into(),
        }
    }

    fn mac(&self, nonce: &[u8], identity: &str) -> Result<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|e| TransportError::AuthFailed {
                reason: format!("bad secret: {}", e),
            })?;
        mac.update(nonce);
        mac.update(self.service.as_bytes());
        mac.update(identity.as_bytes());
        Ok(mac)
    }
}

#[async_trait]
impl Authenticator for SharedSecret {
    async fn request(&self, conn: &mut Connection) -> Result<()> {
        let nonce: FixedBuf<NONCE_LEN> = conn.recv_value(RecvMode::Just).await?;
        if nonce.actual != NONCE_LEN {
            return Err(TransportError::AuthFailed {
                reason: format!("nonce of {} bytes", nonce.actual),
            });
        }
        let tag = self.mac(&nonce.data, &self.identity)?.finalize().into_bytes();
        conn.send(&(self.identity.as_str(), Blob(tag.as_slice()))).await?;
        expect_granted(conn).await
    }

    async fn authorize(&self, conn: &mut Connection) -> Result<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        conn.send(&Blob(&nonce)).await?;

        let (identity, tag): (String, FixedBuf<MAC_LEN>) = conn.recv_value(RecvMode::Just).await?;
        let verified = !tag.is_truncated()
            && self.mac(&nonce, &identity)?.verify_slice(&tag.data).is_ok();
        if !verified {
            warn!(peer = conn.peer(), identity = %identity, "authentication rejected");
            conn.send(&StatusCode::PermissionDenied).await?;
            conn.flush().await?;
            return Err(TransportError::AuthFailed {
                reason: format!("bad credentials for {} from {}", identity, conn.peer()),
            });
        }
        conn.send(&StatusCode::Ok).await?;
        conn.flush().await?;
        debug!(peer = conn.peer(), identity = %identity, "peer authenticated");
        Ok(identity)
    }
}
