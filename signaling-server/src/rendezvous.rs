//! Rendezvous registry: `/connection/init` and `/connection/join`.
//!
//! A rendezvous token is a single-use claim check binding a public
//! `rendezvous_id` (generated by the initiator, never the secret itself)
//! to a freshly created mailbox. The claim itself goes through
//! [`Store::cas_delete`] so two joiners racing on the same token can
//! never both win.
//!
//! The pairing secret and everything derived from it (`k_sig`, `k_mac`,
//! the SAS) never reach this module, or this server at all — they live
//! only in the initiator's URL fragment and are derived locally by both
//! peers via [`crate::crypto`]. This registry only ever sees the public
//! `rendezvous_id` the initiator chooses to embed in the query string.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::SignalingError;
use crate::store::Store;

/// Longest `rendezvous_id`/token we'll store a key for. The data model
/// calls for 128 bits base64url-encoded (~22 chars); this is generous
/// headroom, not a real limit on client-chosen encodings.
const MAX_TOKEN_LEN: usize = 256;

fn token_key(token: &str) -> String {
    format!("rendezvous:{token}")
}

/// `rendezvous_id`/`token_b64` values are opaque to the server but still
/// become store keys, so bound their length and keep them to the
/// base64url alphabet the data model specifies.
pub fn validate_token_shape(token: &str) -> Result<(), SignalingError> {
    let ok = !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(SignalingError::Validation("malformed rendezvous id".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RendezvousRecord {
    mailbox_id: Uuid,
    initiator_client_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct Joined {
    pub mailbox_id: Uuid,
    pub initiator_client_id: Uuid,
}

pub struct RendezvousRegistry {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl RendezvousRegistry {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(config.rendezvous_ttl_secs),
        }
    }

    /// Bind a client-chosen `rendezvous_id` to `mailbox_id` for `ttl`.
    /// The initiator generated `rendezvous_id` itself (it's the public
    /// half of the pairing link, `?token=<rendezvous_id>`); this call just
    /// makes the server aware of it. Fails if the id is already bound —
    /// vanishingly unlikely for a genuine 128-bit random value, but a
    /// reused or guessed id must not silently steal someone else's slot.
    pub async fn create(
        &self,
        initiator_client_id: Uuid,
        mailbox_id: Uuid,
        rendezvous_id: &str,
    ) -> Result<(), SignalingError> {
        validate_token_shape(rendezvous_id)?;
        let record = RendezvousRecord {
            mailbox_id,
            initiator_client_id,
        };
        let encoded = serde_json::to_vec(&record).map_err(SignalingError::internal)?;
        let bound = self
            .store
            .set_if_absent(&token_key(rendezvous_id), &encoded, self.ttl)
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?;
        if !bound {
            return Err(SignalingError::Validation("rendezvous id already in use".into()));
        }
        Ok(())
    }

    /// Claim a token exactly once. The second caller to reach this for the
    /// same token — whether a slow retry or an eavesdropper — gets
    /// [`SignalingError::TokenConsumed`].
    pub async fn claim(&self, rendezvous_id: &str) -> Result<Joined, SignalingError> {
        validate_token_shape(rendezvous_id)?;
        let raw = self
            .store
            .get(&token_key(rendezvous_id))
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?;
        if raw.is_none() {
            return Err(SignalingError::TokenUnknown);
        }

        let claimed = self
            .store
            .cas_delete(&token_key(rendezvous_id))
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?;

        match claimed {
            Some(bytes) => {
                let record: RendezvousRecord =
                    serde_json::from_slice(&bytes).map_err(SignalingError::internal)?;
                Ok(Joined {
                    mailbox_id: record.mailbox_id,
                    initiator_client_id: record.initiator_client_id,
                })
            }
            // Existed at the `get` above but is gone now: either the TTL
            // lapsed in between or another caller already claimed it.
            None => Err(SignalingError::TokenConsumed),
        }
    }
}
