//! Session registry: `/register`, `/heartbeat`, authentication, and the
//! idle-TTL eviction sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::display_name;
use crate::store::Store;

const MIN_HEARTBEAT_SECS: u64 = 10;
const MAX_HEARTBEAT_SECS: u64 = 300;

fn session_key(client_id: Uuid) -> String {
    format!("sess:{client_id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn hash_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Constant-time comparison, so a session-token check can't be timed to
/// learn how many leading bytes matched.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub client_id: Uuid,
    token_hash: [u8; 32],
    pub display_name: String,
    pub device_label: String,
    pub heartbeat_interval_secs: u64,
    pub last_seen_epoch_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Registered {
    pub client_id: Uuid,
    pub session_token: String,
    pub display_name: String,
    pub heartbeat_interval_secs: u64,
}

/// `SessionUnknown` and `SessionExpired` are deliberately folded into one
/// variant at this layer — distinguishing them to the caller would let an
/// attacker enumerate which client ids ever existed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("session unknown or expired")]
    Unauthenticated,
}

pub struct SessionRegistry {
    store: Arc<dyn Store>,
    idle_ttl: Duration,
    heartbeat_interval_secs: u64,
    /// Approximate live-session gauge for `/health`. Incremented on
    /// `register`, decremented on explicit `close` — idle-TTL expiry
    /// doesn't walk this down precisely, so treat it as a load indicator,
    /// not an exact count.
    active_count: AtomicU64,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            idle_ttl: Duration::from_secs(config.session_idle_ttl_secs),
            heartbeat_interval_secs: clamp_heartbeat(config.session_idle_ttl_secs / 2),
            active_count: AtomicU64::new(0),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    pub async fn register(&self, device_label: String) -> Result<Registered, crate::error::SignalingError> {
        let client_id = Uuid::new_v4();
        let session_token = generate_session_token();
        let display_name = display_name::assign(&client_id);
        let heartbeat_interval_secs = self.heartbeat_interval_secs;

        let session = Session {
            client_id,
            token_hash: hash_token(&session_token),
            display_name: display_name.clone(),
            device_label,
            heartbeat_interval_secs,
            last_seen_epoch_ms: now_ms(),
        };

        let encoded = serde_json::to_vec(&session).map_err(|e| crate::error::SignalingError::internal(e))?;
        self.store
            .set(&session_key(client_id), &encoded, self.idle_ttl)
            .await
            .map_err(|_| crate::error::SignalingError::ServiceUnavailable)?;
        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Registered {
            client_id,
            session_token,
            display_name,
            heartbeat_interval_secs,
        })
    }

    /// Authenticate a request and bump `last_seen`. Every authenticated
    /// call refreshes liveness, so clients that only make data calls may
    /// skip heartbeats entirely.
    pub async fn authenticate(&self, client_id: Uuid, session_token: &str) -> Result<Session, AuthError> {
        let raw = self
            .store
            .get(&session_key(client_id))
            .await
            .map_err(|_| AuthError::Unauthenticated)?
            .ok_or(AuthError::Unauthenticated)?;
        let mut session: Session =
            serde_json::from_slice(&raw).map_err(|_| AuthError::Unauthenticated)?;

        if !constant_time_eq(&session.token_hash, &hash_token(session_token)) {
            return Err(AuthError::Unauthenticated);
        }

        session.last_seen_epoch_ms = now_ms();
        if let Ok(encoded) = serde_json::to_vec(&session) {
            let _ = self.store.set(&session_key(client_id), &encoded, self.idle_ttl).await;
        }
        Ok(session)
    }

    /// Advisory next-heartbeat interval. Currently static, but the seam
    /// for scaling it up under load is here.
    pub async fn heartbeat(&self, client_id: Uuid, session_token: &str) -> Result<u64, AuthError> {
        let session = self.authenticate(client_id, session_token).await?;
        Ok(session.heartbeat_interval_secs)
    }

    /// Explicit logout. Idempotent — closing an already-closed or unknown
    /// session is not an error.
    pub async fn close(&self, client_id: Uuid, session_token: &str) -> Result<(), AuthError> {
        self.authenticate(client_id, session_token).await?;
        let _ = self.store.delete(&session_key(client_id)).await;
        self.active_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1))).ok();
        Ok(())
    }
}

fn clamp_heartbeat(secs: u64) -> u64 {
    secs.clamp(MIN_HEARTBEAT_SECS, MAX_HEARTBEAT_SECS)
}

fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemoryStore::new()), &ServerConfig::default())
    }

    #[tokio::test]
    async fn register_then_authenticate_succeeds() {
        let registry = registry();
        let registered = registry.register("laptop".into()).await.unwrap();
        let session = registry
            .authenticate(registered.client_id, &registered.session_token)
            .await
            .unwrap();
        assert_eq!(session.client_id, registered.client_id);
        assert_eq!(session.display_name, registered.display_name);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let registry = registry();
        let registered = registry.register("phone".into()).await.unwrap();
        let err = registry
            .authenticate(registered.client_id, "not-the-token")
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
    }

    #[tokio::test]
    async fn unknown_client_id_is_rejected_uniformly() {
        let registry = registry();
        let err = registry.authenticate(Uuid::new_v4(), "whatever").await.unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
    }

    #[tokio::test]
    async fn heartbeat_returns_advisory_interval() {
        let registry = registry();
        let registered = registry.register("tablet".into()).await.unwrap();
        let interval = registry
            .heartbeat(registered.client_id, &registered.session_token)
            .await
            .unwrap();
        assert!((MIN_HEARTBEAT_SECS..=MAX_HEARTBEAT_SECS).contains(&interval));
    }

    #[tokio::test]
    async fn close_invalidates_the_session() {
        let registry = registry();
        let registered = registry.register("desktop".into()).await.unwrap();
        registry.close(registered.client_id, &registered.session_token).await.unwrap();
        let err = registry
            .authenticate(registered.client_id, &registered.session_token)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Unauthenticated);
    }

    #[tokio::test]
    async fn register_allocates_fresh_ids() {
        let registry = registry();
        let a = registry.register("a".into()).await.unwrap();
        let b = registry.register("b".into()).await.unwrap();
        assert_ne!(a.client_id, b.client_id);
        assert_ne!(a.session_token, b.session_token);
    }
}
