//! Shared server state handed to every route via axum's `State` extractor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::mailbox::MailboxStore;
use crate::ratelimit::RateLimiter;
use crate::rendezvous::RendezvousRegistry;
use crate::session::SessionRegistry;
use crate::store::memory::MemoryStore;
use crate::store::redis_store::RedisStore;
use crate::store::Store;

pub struct AppState {
    pub config: ServerConfig,
    pub sessions: SessionRegistry,
    pub rendezvous: RendezvousRegistry,
    pub mailboxes: MailboxStore,
    pub hub: Hub,
    pub register_limiter: RateLimiter,
    pub connection_limiter: RateLimiter,
    /// `Some` only for the in-process backend — Redis expires its own keys,
    /// so the reaper has nothing to sweep there.
    pub mem_store: Option<Arc<MemoryStore>>,
    /// Per-HTTP-status error tally, logged at shutdown. Deliberately not
    /// exposed as a `/metrics` endpoint (out of scope) — this is ambient
    /// observability for the server's own logs, nothing else scrapes it.
    error_counts: Mutex<HashMap<u16, u64>>,
}

impl AppState {
    /// Record one response's status for the shutdown tally. Only
    /// non-2xx/3xx responses are worth counting.
    pub fn record_status(&self, status: u16) {
        if status < 400 {
            return;
        }
        *self.error_counts.lock().entry(status).or_insert(0) += 1;
    }

    /// Emit the accumulated error tally. Called once, from the shutdown
    /// path in `main.rs`.
    pub fn log_error_counts(&self) {
        let counts = self.error_counts.lock().clone();
        if counts.is_empty() {
            tracing::info!("shutting down with no error responses recorded");
        } else {
            tracing::info!(?counts, "error response tally at shutdown");
        }
    }
}

impl AppState {
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>, anyhow::Error> {
        config.validate_redis_tls()?;

        let mut mem_store = None;
        let raw_store: Arc<dyn Store> = match &config.redis_url {
            Some(url) => {
                tracing::info!("connecting to redis backing store");
                Arc::new(RedisStore::connect(url).await?)
            }
            None => {
                tracing::info!("no SIGNALING_REDIS_URL set, using in-process store");
                let mem = Arc::new(MemoryStore::new());
                mem_store = Some(mem.clone());
                mem
            }
        };
        // §4.6/§7: a transient backend error is retried internally before
        // it ever reaches session/rendezvous/mailbox code, so every caller
        // of `store` downstream of this point gets that behavior for free.
        let store: Arc<dyn Store> = Arc::new(crate::store::retry::RetryingStore::new(raw_store));

        let sessions = SessionRegistry::new(store.clone(), &config);
        let rendezvous = RendezvousRegistry::new(store.clone(), &config);
        let mailboxes = MailboxStore::new(store.clone(), &config);
        let hub = Hub::new();
        let register_limiter = RateLimiter::new(Duration::from_secs(60));
        let connection_limiter = RateLimiter::new(Duration::from_secs(1));

        Ok(Arc::new(Self {
            config,
            sessions,
            rendezvous,
            mailboxes,
            hub,
            register_limiter,
            connection_limiter,
            mem_store,
            error_counts: Mutex::new(HashMap::new()),
        }))
    }
}
