//! Shared gateway state: the registry, auth manager, vault handle,
//! upstream chat bridge, dedupe cache, and the job watch set, all
//! reachable from every handler.
//!
//! `DedupeCache` is grounded on `gateway::state::DedupeCache`: a
//! TTL-bounded idempotency cache keyed by client-supplied request id,
//! swept lazily on insert rather than by a background task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use relay_chat::UpstreamChatBridge;
use relay_vault::VaultFacade;

use crate::auth::AuthManager;
use crate::registry::ClientRegistry;

const DEDUPE_TTL: Duration = Duration::from_secs(120);

/// Caches the outcome of a request by id so a retransmitted frame (same
/// `requestId`) is answered from cache instead of re-executed.
pub struct DedupeCache {
    entries: Mutex<HashMap<String, (Instant, ())>>,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl DedupeCache {
    /// Returns `true` if `request_id` was already seen within the TTL
    /// window (and should be treated as a duplicate), else records it
    /// and returns `false`. Expired entries are swept opportunistically.
    pub fn check_and_insert(&self, request_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (seen, ())| now.duration_since(*seen) < DEDUPE_TTL);

        if entries.contains_key(request_id) {
            return true;
        }
        entries.insert(request_id.to_string(), (now, ()));
        false
    }
}

/// Jobs a session is actively watching, so job-lifecycle events are
/// forwarded only to interested sessions rather than broadcast widely.
#[derive(Default)]
pub struct WatchSet {
    by_job: RwLock<HashMap<String, HashSet<String>>>,
}

impl WatchSet {
    pub fn watch(&self, job_id: &str, session_token: &str) {
        self.by_job.write().unwrap().entry(job_id.to_string()).or_default().insert(session_token.to_string());
    }

    pub fn watchers(&self, job_id: &str) -> Vec<String> {
        self.by_job.read().unwrap().get(job_id).map(|s| s.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn stop_watching_job(&self, job_id: &str) {
        self.by_job.write().unwrap().remove(job_id);
    }

    pub fn remove_session(&self, session_token: &str) {
        let mut map = self.by_job.write().unwrap();
        for watchers in map.values_mut() {
            watchers.remove(session_token);
        }
        map.retain(|_, watchers| !watchers.is_empty());
    }
}

/// Configuration for the synchronous fallback chat completion path.
pub struct ChatFallbackConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
}

pub struct GatewayState {
    pub vault: VaultFacade,
    pub auth: AuthManager,
    pub registry: ClientRegistry,
    pub dedupe: DedupeCache,
    pub watches: WatchSet,
    pub chat_bridge: Option<UpstreamChatBridge>,
    pub chat_fallback: ChatFallbackConfig,
    pub http_client: reqwest::Client,
    /// requestId → owning session, populated while an upstream chat
    /// request is in flight so the Event Forwarder knows where to route
    /// the bridge's response frames.
    pub pending_chat_requests: Mutex<HashMap<String, String>>,
    /// requestId → one-shot fired the moment the bridge produces its
    /// first event for that request, arming the Chat Handler's race
    /// against the fallback timer.
    pub chat_armed: Mutex<HashMap<String, tokio::sync::oneshot::Sender<()>>>,
    /// requestId → next delta index, so upstream-routed `chat:delta`
    /// frames carry a strictly increasing index per request.
    pub chat_delta_index: Mutex<HashMap<String, u64>>,
    /// Per-session bang-command settings (active model, thread id, ...),
    /// keyed by session token. Owned here so it is created at boot and
    /// dropped with the rest of gateway state at shutdown instead of
    /// living as a process-wide singleton.
    pub command_settings: Mutex<HashMap<String, HashMap<String, String>>>,
    started_at: Instant,
    seq: AtomicU64,
}

impl GatewayState {
    pub fn new(
        vault: VaultFacade,
        auth: AuthManager,
        chat_bridge: Option<UpstreamChatBridge>,
        chat_fallback: ChatFallbackConfig,
    ) -> Self {
        Self {
            vault,
            auth,
            registry: ClientRegistry::new(),
            dedupe: DedupeCache::default(),
            watches: WatchSet::default(),
            chat_bridge,
            chat_fallback,
            http_client: reqwest::Client::new(),
            pending_chat_requests: Mutex::new(HashMap::new()),
            chat_armed: Mutex::new(HashMap::new()),
            chat_delta_index: Mutex::new(HashMap::new()),
            command_settings: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn server_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn next_chat_delta_index(&self, request_id: &str) -> u64 {
        let mut map = self.chat_delta_index.lock().unwrap();
        let slot = map.entry(request_id.to_string()).or_insert(0);
        let index = *slot;
        *slot += 1;
        index
    }

    pub fn clear_chat_delta_index(&self, request_id: &str) {
        self.chat_delta_index.lock().unwrap().remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_cache_flags_repeated_request_id() {
        let cache = DedupeCache::default();
        assert!(!cache.check_and_insert("req-1"));
        assert!(cache.check_and_insert("req-1"));
    }

    #[test]
    fn watch_set_tracks_and_clears_per_job() {
        let watches = WatchSet::default();
        watches.watch("job-1", "tok-a");
        watches.watch("job-1", "tok-b");
        assert_eq!(watches.watchers("job-1").len(), 2);

        watches.stop_watching_job("job-1");
        assert!(watches.watchers("job-1").is_empty());
    }

    #[test]
    fn watch_set_removes_session_across_all_jobs() {
        let watches = WatchSet::default();
        watches.watch("job-1", "tok-a");
        watches.watch("job-2", "tok-a");
        watches.remove_session("tok-a");
        assert!(watches.watchers("job-1").is_empty());
        assert!(watches.watchers("job-2").is_empty());
    }
}
