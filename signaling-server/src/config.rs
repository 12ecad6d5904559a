//! Process configuration: CLI flags with `SIGNALING_*` env fallbacks.

use clap::Parser;

/// Server configuration, parsed from CLI args with environment fallbacks.
#[derive(Debug, Clone, Parser)]
#[command(name = "signaling-server", version, about = "Rendezvous signaling service")]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener.
    #[arg(long, env = "SIGNALING_ADDR", default_value = "0.0.0.0")]
    pub addr: String,

    /// Bind port for the HTTP/WebSocket listener.
    #[arg(long, env = "SIGNALING_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Backing store URL (`redis://` or `rediss://`). Falls back to an
    /// in-process store when unset — fine for a single node, but
    /// mailboxes won't survive a restart either way (ephemeral by design).
    #[arg(long, env = "SIGNALING_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Refuse non-TLS Redis URLs when set.
    #[arg(long, env = "SIGNALING_REDIS_REQUIRE_TLS", default_value_t = false)]
    pub redis_require_tls: bool,

    /// Initial mailbox TTL in seconds.
    #[arg(long, env = "SIGNALING_MAILBOX_TTL_SECS", default_value_t = 300)]
    pub mailbox_ttl_secs: u64,

    /// Base URL used when the server renders a shareable pairing link.
    #[arg(long, env = "SIGNALING_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Emit JSON logs instead of human-readable ones.
    #[arg(long, env = "SIGNALING_LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Idle TTL for a registered session, in seconds.
    #[arg(skip = 300)]
    pub session_idle_ttl_secs: u64,

    /// Cadence of the session/mailbox eviction sweep, in seconds.
    #[arg(skip = 15)]
    pub reaper_interval_secs: u64,

    /// Rendezvous token lifetime, in seconds.
    #[arg(skip = 30)]
    pub rendezvous_ttl_secs: u64,

    /// How much a successful read/write extends a mailbox's TTL, in seconds.
    #[arg(skip = 60)]
    pub mailbox_idle_extension_secs: u64,

    /// Hard ceiling on a mailbox's lifetime from creation, in seconds.
    #[arg(skip = 600)]
    pub mailbox_max_lifetime_secs: u64,

    /// Maximum buffered messages per mailbox.
    #[arg(skip = 128)]
    pub mailbox_max_queue_len: usize,

    /// Maximum participants per mailbox.
    #[arg(skip = 2)]
    pub mailbox_max_participants: usize,

    /// Maximum concurrent subscribers per mailbox.
    #[arg(skip = 4)]
    pub max_subscribers_per_mailbox: usize,

    /// Bounded channel capacity per subscriber.
    #[arg(skip = 64)]
    pub subscriber_channel_capacity: usize,

    /// Maximum encoded message size, in bytes.
    #[arg(skip = 65536)]
    pub max_message_size_bytes: usize,

    /// `/register` rate limit, requests per minute per source IP.
    #[arg(skip = 10)]
    pub register_rate_per_min: u32,

    /// `/signal*` and `/connection/*` rate limit, requests per second per client.
    #[arg(skip = 60)]
    pub connection_rate_per_sec: u32,

    /// Server-side request deadline, in seconds.
    #[arg(skip = 15)]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        // `clap::Parser::parse_from` with no args applies every default_value/skip,
        // which keeps this in lock-step with the `#[arg(...)]` declarations above.
        Self::parse_from(std::iter::empty::<String>())
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Whether the configured Redis URL (if any) satisfies the TLS requirement.
    pub fn validate_redis_tls(&self) -> Result<(), anyhow::Error> {
        if self.redis_require_tls {
            if let Some(url) = &self.redis_url
                && !url.starts_with("rediss://")
            {
                anyhow::bail!("SIGNALING_REDIS_REQUIRE_TLS is set but redis URL is not rediss://");
            }
        }
        Ok(())
    }
}
