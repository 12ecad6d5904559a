//! Background TTL sweep. Redis expires its own keys; the in-process store
//! needs an explicit sweep so dead sessions, rendezvous tokens, and
//! mailboxes don't sit in the map forever once their TTL lapses without
//! being read again.
//!
//! Also prunes hub subscriptions left behind when a mailbox disappears out
//! from under a still-subscribed WebSocket (TTL expiry or explicit close),
//! since the hub has no other way to learn that, and prunes the mailbox
//! store's per-mailbox write locks left behind by the same TTL expiry.

use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

pub fn spawn(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.config.reaper_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            sweep_once(&state).await;
        }
    })
}

async fn sweep_once(state: &AppState) {
    if let Some(mem) = &state.mem_store {
        let swept = mem.sweep_expired();
        if swept > 0 {
            tracing::debug!(swept, "reaper swept expired in-process entries");
        }
    }

    state.mailboxes.prune_expired_locks().await;

    for mailbox_id in state.hub.active_mailboxes() {
        if !state.mailboxes.exists(mailbox_id).await {
            tracing::debug!(%mailbox_id, "reaper dropping subscribers of expired mailbox");
            state.hub.drop_mailbox(mailbox_id);
        }
    }
}
