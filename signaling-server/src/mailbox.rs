//! Mailbox store: the durable (TTL-bounded) queue each pair of peers
//! exchanges signaling messages through.
//!
//! Appends must be linearized so `seq` is strictly increasing and gap-free
//! per mailbox — two peers sending at once must not race into the same
//! slot. The backing [`Store`] has no read-modify-write primitive, so this
//! module keeps one in-process `tokio::sync::Mutex` per mailbox id as a
//! single-writer gate in front of it. That's sufficient because this
//! service runs as a single process; a multi-node deployment would need
//! the lock itself to move into the store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::SignalingError;
use crate::store::Store;

fn mailbox_key(id: Uuid) -> String {
    format!("mailbox:{id}")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    /// The sender's private reference within this mailbox — never the
    /// sender's global `client_id`, so two paired peers can't learn each
    /// other's identity just by exchanging messages. The initiator's
    /// reference is the mailbox id itself (it is, after all, their
    /// mailbox); a joiner's reference is a fresh id minted when they're
    /// added as a participant.
    pub from_mailbox_id: Uuid,
    pub ciphertext_b64: String,
    pub created_at_epoch_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MailboxRecord {
    id: Uuid,
    created_at_epoch_ms: u64,
    participants: Vec<Uuid>,
    /// `client_id -> from_mailbox_id` for every participant, so `append`
    /// never has to put a global client id on the wire.
    participant_refs: HashMap<Uuid, Uuid>,
    messages: Vec<Message>,
    next_seq: u64,
}

impl MailboxRecord {
    fn new(id: Uuid, initiator: Uuid) -> Self {
        let mut participant_refs = HashMap::new();
        participant_refs.insert(initiator, id);
        Self {
            id,
            created_at_epoch_ms: now_ms(),
            participants: vec![initiator],
            participant_refs,
            messages: Vec::new(),
            next_seq: 0,
        }
    }
}

pub struct MailboxStore {
    store: Arc<dyn Store>,
    initial_ttl: Duration,
    idle_extension: Duration,
    max_lifetime: Duration,
    max_queue_len: usize,
    max_participants: usize,
    write_locks: SyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Approximate live-mailbox gauge for `/health`; see the equivalent
    /// note on `SessionRegistry::active_count`.
    active_count: AtomicU64,
}

impl MailboxStore {
    pub fn new(store: Arc<dyn Store>, config: &ServerConfig) -> Self {
        Self {
            store,
            initial_ttl: Duration::from_secs(config.mailbox_ttl_secs),
            idle_extension: Duration::from_secs(config.mailbox_idle_extension_secs),
            max_lifetime: Duration::from_secs(config.mailbox_max_lifetime_secs),
            max_queue_len: config.mailbox_max_queue_len,
            max_participants: config.mailbox_max_participants,
            write_locks: SyncMutex::new(HashMap::new()),
            active_count: AtomicU64::new(0),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    fn lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
        self.write_locks.lock().entry(id).or_default().clone()
    }

    pub async fn create(&self, initiator_client_id: Uuid) -> Result<Uuid, SignalingError> {
        let id = Uuid::new_v4();
        let record = MailboxRecord::new(id, initiator_client_id);
        let encoded = serde_json::to_vec(&record).map_err(SignalingError::internal)?;
        self.store
            .set(&mailbox_key(id), &encoded, self.initial_ttl)
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?;
        self.active_count.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    async fn load(&self, id: Uuid) -> Result<MailboxRecord, SignalingError> {
        let raw = self
            .store
            .get(&mailbox_key(id))
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?
            .ok_or(SignalingError::MailboxGone)?;
        serde_json::from_slice(&raw).map_err(SignalingError::internal)
    }

    /// The idle-extension TTL to apply on the next successful read or
    /// write, clamped so it never pushes `expires_at` past `max_lifetime`
    /// from `created_at_epoch_ms`.
    fn next_ttl(&self, record: &MailboxRecord) -> Duration {
        let remaining_lifetime = self
            .max_lifetime
            .saturating_sub(Duration::from_millis(now_ms().saturating_sub(record.created_at_epoch_ms)));
        self.idle_extension.min(remaining_lifetime).max(Duration::from_secs(1))
    }

    async fn save(&self, record: &MailboxRecord) -> Result<(), SignalingError> {
        let ttl = self.next_ttl(record);
        let encoded = serde_json::to_vec(record).map_err(SignalingError::internal)?;
        self.store
            .set(&mailbox_key(record.id), &encoded, ttl)
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)
    }

    /// Add the joining peer. Rejects a third participant outright — this
    /// service only ever pairs two peers per mailbox.
    pub async fn add_participant(&self, id: Uuid, client_id: Uuid) -> Result<(), SignalingError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        if record.participants.contains(&client_id) {
            return Ok(());
        }
        if record.participants.len() >= self.max_participants {
            return Err(SignalingError::ParticipantLimitExceeded);
        }
        record.participants.push(client_id);
        record.participant_refs.insert(client_id, Uuid::new_v4());
        self.save(&record).await
    }

    /// Append a ciphertext envelope and hand back the stored message,
    /// `seq` assigned. Callers needing the wire-ready record (the hub
    /// publish path) get it without a second lookup or a re-derived
    /// timestamp.
    pub async fn append(
        &self,
        id: Uuid,
        sender_client_id: Uuid,
        ciphertext: String,
    ) -> Result<Message, SignalingError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.load(id).await?;
        let Some(&from_mailbox_id) = record.participant_refs.get(&sender_client_id) else {
            return Err(SignalingError::AuthFailed);
        };
        if record.messages.len() >= self.max_queue_len {
            return Err(SignalingError::MailboxFull);
        }

        let seq = record.next_seq;
        record.next_seq += 1;
        let message = Message {
            seq,
            from_mailbox_id,
            ciphertext_b64: ciphertext,
            created_at_epoch_ms: now_ms(),
        };
        record.messages.push(message.clone());
        self.save(&record).await?;
        Ok(message)
    }

    /// Messages strictly after `after_seq`, in order. `None` returns the
    /// full backlog — `seq` is zero-indexed, so
    /// unlike a `0` sentinel this can't be confused with "everything after
    /// the first message."
    pub async fn read_since(&self, id: Uuid, after_seq: Option<u64>) -> Result<Vec<Message>, SignalingError> {
        let record = self.load(id).await?;
        let ttl = self.next_ttl(&record);
        let _ = self.store.extend_ttl(&mailbox_key(id), ttl).await;
        Ok(record
            .messages
            .into_iter()
            .filter(|m| match after_seq {
                Some(cutoff) => m.seq > cutoff,
                None => true,
            })
            .collect())
    }

    pub async fn exists(&self, id: Uuid) -> bool {
        self.load(id).await.is_ok()
    }

    /// Drop write-lock entries for mailboxes no longer present in the
    /// backing store. `write_locks` only self-prunes on `delete`, but TTL
    /// reap — the normal way an ephemeral mailbox goes away — never calls
    /// `delete`; without this sweep a lock entry would outlive every
    /// mailbox it ever guarded for the life of the process.
    pub async fn prune_expired_locks(&self) {
        let ids: Vec<Uuid> = self.write_locks.lock().keys().copied().collect();
        for id in ids {
            if !self.exists(id).await {
                self.write_locks.lock().remove(&id);
            }
        }
    }

    /// Remove a mailbox's record straight from the backing store, bypassing
    /// `delete`'s own lock cleanup — this is what a TTL reap looks like
    /// from `prune_expired_locks`'s perspective, for tests that exercise
    /// that path specifically.
    #[cfg(test)]
    pub async fn expire_record_for_test(&self, id: Uuid) {
        self.store.delete(&mailbox_key(id)).await.unwrap();
    }

    #[cfg(test)]
    pub fn lock_count(&self) -> usize {
        self.write_locks.lock().len()
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), SignalingError> {
        self.write_locks.lock().remove(&id);
        self.store
            .delete(&mailbox_key(id))
            .await
            .map_err(|_| SignalingError::ServiceUnavailable)?;
        self.active_count.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| Some(c.saturating_sub(1))).ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn mailboxes() -> MailboxStore {
        MailboxStore::new(Arc::new(MemoryStore::new()), &ServerConfig::default())
    }

    #[tokio::test]
    async fn create_then_append_assigns_increasing_seq() {
        let mailboxes = mailboxes();
        let initiator = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();

        let first = mailboxes.append(id, initiator, "ct1".into()).await.unwrap();
        let second = mailboxes.append(id, initiator, "ct2".into()).await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn third_participant_is_rejected() {
        let mailboxes = mailboxes();
        let id = mailboxes.create(Uuid::new_v4()).await.unwrap();
        mailboxes.add_participant(id, Uuid::new_v4()).await.unwrap();

        let err = mailboxes.add_participant(id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SignalingError::ParticipantLimitExceeded));
    }

    #[tokio::test]
    async fn rejoining_same_client_is_idempotent() {
        let mailboxes = mailboxes();
        let initiator = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();
        mailboxes.add_participant(id, initiator).await.unwrap();
        mailboxes.add_participant(id, initiator).await.unwrap();
    }

    #[tokio::test]
    async fn append_from_non_participant_is_rejected() {
        let mailboxes = mailboxes();
        let id = mailboxes.create(Uuid::new_v4()).await.unwrap();
        let err = mailboxes
            .append(id, Uuid::new_v4(), "ct".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::AuthFailed));
    }

    #[tokio::test]
    async fn read_since_filters_already_seen_messages() {
        let mailboxes = mailboxes();
        let initiator = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();
        mailboxes.append(id, initiator, "ct1".into()).await.unwrap();
        mailboxes.append(id, initiator, "ct2".into()).await.unwrap();

        let all = mailboxes.read_since(id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 0);
        assert_eq!(all[1].seq, 1);

        let tail = mailboxes.read_since(id, Some(0)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 1);
    }

    #[tokio::test]
    async fn queue_full_rejects_further_appends() {
        let store = Arc::new(MemoryStore::new());
        let mut config = ServerConfig::default();
        config.mailbox_max_queue_len = 2;
        let mailboxes = MailboxStore::new(store, &config);
        let initiator = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();

        mailboxes.append(id, initiator, "ct1".into()).await.unwrap();
        mailboxes.append(id, initiator, "ct2".into()).await.unwrap();
        let err = mailboxes.append(id, initiator, "ct3".into()).await.unwrap_err();
        assert!(matches!(err, SignalingError::MailboxFull));
    }

    #[tokio::test]
    async fn operations_on_deleted_mailbox_report_gone() {
        let mailboxes = mailboxes();
        let id = mailboxes.create(Uuid::new_v4()).await.unwrap();
        mailboxes.delete(id).await.unwrap();
        let err = mailboxes.read_since(id, None).await.unwrap_err();
        assert!(matches!(err, SignalingError::MailboxGone));
    }

    #[tokio::test]
    async fn message_from_mailbox_id_never_leaks_the_client_id() {
        let mailboxes = mailboxes();
        let initiator = Uuid::new_v4();
        let joiner = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();
        mailboxes.add_participant(id, joiner).await.unwrap();

        let from_initiator = mailboxes.append(id, initiator, "ct1".into()).await.unwrap();
        assert_eq!(from_initiator.from_mailbox_id, id);
        assert_ne!(from_initiator.from_mailbox_id, joiner);

        let from_joiner = mailboxes.append(id, joiner, "ct2".into()).await.unwrap();
        assert_ne!(from_joiner.from_mailbox_id, joiner);
        assert_ne!(from_joiner.from_mailbox_id, initiator);
        assert_ne!(from_joiner.from_mailbox_id, from_initiator.from_mailbox_id);
    }

    #[tokio::test]
    async fn prune_expired_locks_drops_locks_for_mailboxes_reaped_by_ttl() {
        let mailboxes = mailboxes();
        let id = mailboxes.create(Uuid::new_v4()).await.unwrap();
        mailboxes.add_participant(id, Uuid::new_v4()).await.unwrap();
        assert_eq!(mailboxes.lock_count(), 1);

        // Simulate TTL reap: the record vanishes from the store directly,
        // without going through `delete` (which would self-prune the lock).
        mailboxes.expire_record_for_test(id).await;
        assert_eq!(mailboxes.lock_count(), 1);

        mailboxes.prune_expired_locks().await;
        assert_eq!(mailboxes.lock_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_appends_never_collide_on_seq() {
        let mailboxes = Arc::new(mailboxes());
        let initiator = Uuid::new_v4();
        let id = mailboxes.create(initiator).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let mailboxes = mailboxes.clone();
            handles.push(tokio::spawn(async move {
                mailboxes.append(id, initiator, format!("ct{i}")).await.unwrap().seq
            }));
        }
        let mut seqs: Vec<u64> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }
}
