//! Plugin session registry.
//!
//! Owns every live [`Session`](session::Session) in the process, keyed by
//! (user, plugin). Mutations for one user are serialized on a per-user lock
//! created lazily; a coarser lock over the session map is taken only briefly
//! and never across a transport call.
//!
//! ```text
//!   load/unload/reload/get_or_reconnect ──► user lock ──► sessions map ──► TransportClient
//!   get/call_tool/list_tools ────────────────────────────► sessions map ──► TransportClient
//!   idle sweep / health sweep (background) ─► sessions map (+ user lock per expired key)
//! ```

pub mod session;
mod sweeps;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::transport::{ConnectionTest, ToolDefinition, TransportFactory};
use crate::types::{Error, PluginConfig, RegistryConfig, Result, SessionKey};

use session::Session;
pub use session::{HealthThresholds, SessionHandle, SessionInfo, SessionStatus};
pub use sweeps::HealthSweepStats;
use sweeps::SweepTasks;

/// Registry-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub capacity: usize,
    pub active: usize,
    pub degraded: usize,
    pub error: usize,
    pub user_locks: usize,
    pub sweeps_running: bool,
}

/// Process-wide session registry. Construct once and share the `Arc`.
pub struct SessionRegistry {
    config: RegistryConfig,
    factory: Arc<dyn TransportFactory>,
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    sweeps: Mutex<Option<SweepTasks>>,
    shut_down: AtomicBool,
    self_ref: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            factory,
            sessions: RwLock::new(HashMap::new()),
            user_locks: DashMap::new(),
            sweeps: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lookup(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create (or replace) the session for `config`'s key.
    ///
    /// Returns `false` on configuration or connection failure; no session is
    /// stored in that case.
    pub async fn load(&self, config: &PluginConfig) -> bool {
        let lock = self.user_lock(&config.user_id);
        let _guard = lock.lock().await;
        self.load_or_log(config).await
    }

    async fn load_or_log(&self, config: &PluginConfig) -> bool {
        match self.load_locked(config).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    "session_load_failed: user={}, plugin={}, error={}",
                    config.user_id,
                    config.plugin_name,
                    e
                );
                false
            }
        }
    }

    /// Caller must hold the user lock for `config.user_id`.
    async fn load_locked(&self, config: &PluginConfig) -> Result<SessionHandle> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::internal("session registry is shut down"));
        }
        config.validate()?;
        self.start_background_tasks().await;

        let key = SessionKey::new(&config.user_id, &config.plugin_name);
        if self.unload_locked(&key).await {
            tracing::info!("session_replaced: key={}", key);
        }

        let evicted = {
            let mut sessions = self.sessions.write().await;
            take_lru_over_capacity(&mut sessions, self.config.max_sessions)
        };
        self.close_evicted(evicted).await;

        let client = self.factory.create(config)?;
        let connected = tokio::time::timeout(config.timeout, client.connect()).await;
        let failure = match connected {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_elapsed) => Some(Error::connection(format!(
                "connect to {} timed out after {}ms",
                key,
                config.timeout.as_millis()
            ))),
        };
        if let Some(e) = failure {
            if let Err(close_err) = client.close().await {
                tracing::debug!("session_close_after_failed_connect: key={}, error={}", key, close_err);
            }
            return Err(e);
        }

        let session = Arc::new(Session::new(key.clone(), config.clone(), client));
        let handle = session.handle();
        let inserted = {
            let mut sessions = self.sessions.write().await;
            // shutdown sets the flag before draining under this lock
            if self.shut_down.load(Ordering::Acquire) {
                None
            } else {
                let evicted = take_lru_over_capacity(&mut sessions, self.config.max_sessions);
                sessions.insert(key.clone(), session.clone());
                Some((evicted, sessions.len()))
            }
        };
        let Some((evicted, live)) = inserted else {
            close_session(&session).await;
            return Err(Error::internal(format!(
                "session registry shut down while connecting {key}"
            )));
        };
        self.close_evicted(evicted).await;

        tracing::info!(
            "session_loaded: key={}, transport={:?}, live={}/{}",
            key,
            config.transport,
            live,
            self.config.max_sessions
        );
        Ok(handle)
    }

    /// Remove and close the session for (user, plugin). Returns whether one existed.
    pub async fn unload(&self, user_id: &str, plugin_name: &str) -> bool {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.unload_locked(&SessionKey::new(user_id, plugin_name)).await
    }

    /// Caller must hold the user lock for `key.user_id`.
    async fn unload_locked(&self, key: &SessionKey) -> bool {
        let removed = self.sessions.write().await.remove(key);
        match removed {
            Some(session) => {
                close_session(&session).await;
                tracing::info!("session_unloaded: key={}", key);
                true
            }
            None => false,
        }
    }

    /// Unload then load under a single hold of the user lock.
    pub async fn reload(&self, config: &PluginConfig) -> bool {
        let lock = self.user_lock(&config.user_id);
        let _guard = lock.lock().await;
        self.unload_locked(&SessionKey::new(&config.user_id, &config.plugin_name))
            .await;
        self.load_or_log(config).await
    }

    async fn close_evicted(&self, evicted: Vec<Arc<Session>>) {
        for session in evicted {
            tracing::info!(
                "session_evicted: key={}, idle_secs={}, capacity={}",
                session.key,
                session.idle_for(Instant::now()).as_secs(),
                self.config.max_sessions
            );
            close_session(&session).await;
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Handle for a usable session. Touches the session; returns `None` when
    /// absent or in error status.
    pub async fn get(&self, user_id: &str, plugin_name: &str) -> Option<SessionHandle> {
        let key = SessionKey::new(user_id, plugin_name);
        let session = self.lookup(&key).await?;
        if session.status() == SessionStatus::Error {
            tracing::debug!("session_refused: key={}, status=error", key);
            return None;
        }
        session.touch();
        Some(session.handle())
    }

    /// Like [`get`](Self::get) but leaves last-access and the request
    /// counter alone. For callers that go on to `call_tool`, which counts the use.
    pub async fn peek(&self, user_id: &str, plugin_name: &str) -> Option<SessionHandle> {
        let session = self.lookup(&SessionKey::new(user_id, plugin_name)).await?;
        (session.status() != SessionStatus::Error).then(|| session.handle())
    }

    /// Return a usable session, replacing an errored one and loading a missing one.
    pub async fn get_or_reconnect(&self, config: &PluginConfig) -> Result<SessionHandle> {
        let key = SessionKey::new(&config.user_id, &config.plugin_name);
        let lock = self.user_lock(&config.user_id);
        let _guard = lock.lock().await;

        if let Some(session) = self.lookup(&key).await {
            if session.status() != SessionStatus::Error {
                return Ok(session.handle());
            }
            tracing::info!("session_reconnecting: key={}, reason=error_status", key);
            self.unload_locked(&key).await;
        }
        self.load_locked(config).await
    }

    pub async fn contains(&self, user_id: &str, plugin_name: &str) -> bool {
        self.sessions
            .read()
            .await
            .contains_key(&SessionKey::new(user_id, plugin_name))
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    // =========================================================================
    // Transport operations
    // =========================================================================

    /// Invoke a tool and fold the outcome into the session's health.
    ///
    /// Errored sessions are still reachable here; only `get` refuses them.
    pub async fn call_tool(
        &self,
        user_id: &str,
        plugin_name: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value> {
        let key = SessionKey::new(user_id, plugin_name);
        let session = self
            .lookup(&key)
            .await
            .ok_or_else(|| Error::session_unavailable(&key))?;
        session.touch();

        match session.client.call_tool(tool, arguments).await {
            Ok(value) => {
                session.record_success(&self.config.health);
                Ok(value)
            }
            Err(e) => {
                self.note_failure(&session, tool, &e);
                Err(e)
            }
        }
    }

    /// Count a failure observed outside the transport (a caller-side timeout).
    pub async fn record_failure(&self, user_id: &str, plugin_name: &str, tool: &str, error: &Error) {
        if let Some(session) = self.lookup(&SessionKey::new(user_id, plugin_name)).await {
            self.note_failure(&session, tool, error);
        }
    }

    fn note_failure(&self, session: &Session, tool: &str, error: &Error) {
        let (previous, current) = session.record_failure(&self.config.health);
        if previous != current {
            tracing::warn!(
                "session_status_changed: key={}, from={}, to={}, tool={}, error={}",
                session.key,
                previous,
                current,
                tool,
                error
            );
        } else {
            tracing::debug!("session_call_failed: key={}, tool={}, error={}", session.key, tool, error);
        }
    }

    /// Underlying list-tools call (the invocation service caches the result).
    pub async fn list_tools(&self, user_id: &str, plugin_name: &str) -> Result<Vec<ToolDefinition>> {
        let key = SessionKey::new(user_id, plugin_name);
        let session = self
            .lookup(&key)
            .await
            .ok_or_else(|| Error::session_unavailable(&key))?;
        session.touch();
        session.client.list_tools().await
    }

    pub async fn read_resource(&self, user_id: &str, plugin_name: &str, uri: &str) -> Result<Value> {
        let key = SessionKey::new(user_id, plugin_name);
        let session = self
            .lookup(&key)
            .await
            .ok_or_else(|| Error::session_unavailable(&key))?;
        session.touch();
        session.client.read_resource(uri).await
    }

    /// Probe an endpoint with a throwaway client; never stores a session.
    pub async fn test_connection(&self, config: &PluginConfig) -> ConnectionTest {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        if let Err(e) = config.validate() {
            return ConnectionTest::failed(0, &e);
        }
        let client = match self.factory.create(config) {
            Ok(client) => client,
            Err(e) => return ConnectionTest::failed(elapsed_ms(), &e),
        };
        let result = match tokio::time::timeout(config.timeout, client.connect()).await {
            Ok(Ok(())) => {
                let mut probe = client.test_connection().await;
                probe.latency_ms = elapsed_ms();
                probe
            }
            Ok(Err(e)) => ConnectionTest::failed(elapsed_ms(), &e),
            Err(_elapsed) => ConnectionTest::failed(
                elapsed_ms(),
                &Error::connection(format!("connect timed out after {}ms", config.timeout.as_millis())),
            ),
        };
        if let Err(e) = client.close().await {
            tracing::debug!("connection_test_close_failed: plugin={}, error={}", config.plugin_name, e);
        }
        tracing::info!(
            "connection_tested: plugin={}, ok={}, latency_ms={}, tools={}",
            config.plugin_name,
            result.ok,
            result.latency_ms,
            result.tool_count
        );
        result
    }

    // =========================================================================
    // Administration & snapshots
    // =========================================================================

    /// Unload every session matching the filter (`None` matches all).
    pub async fn clear(&self, user_id: Option<&str>, plugin_name: Option<&str>) -> usize {
        let keys: Vec<SessionKey> = self
            .sessions
            .read()
            .await
            .keys()
            .filter(|k| k.matches(user_id, plugin_name))
            .cloned()
            .collect();

        let mut removed = 0;
        for key in keys {
            let lock = self.user_lock(&key.user_id);
            let _guard = lock.lock().await;
            if self.unload_locked(&key).await {
                removed += 1;
            }
        }
        tracing::info!(
            "sessions_cleared: user={:?}, plugin={:?}, removed={}",
            user_id,
            plugin_name,
            removed
        );
        removed
    }

    /// One entry per live session, sorted by key. `persisted` is the
    /// currently stored plugin configuration used for the `in_sync` flag.
    pub async fn sessions_info(&self, persisted: &[PluginConfig]) -> Vec<SessionInfo> {
        let persisted: HashMap<SessionKey, &PluginConfig> = persisted
            .iter()
            .map(|c| (SessionKey::new(&c.user_id, &c.plugin_name), c))
            .collect();
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.info(persisted.get(&s.key).copied(), now))
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            capacity: self.config.max_sessions,
            user_locks: self.user_locks.len(),
            sweeps_running: self.sweeps.lock().await.is_some(),
            ..Default::default()
        };
        for session in self.sessions.read().await.values() {
            stats.live_sessions += 1;
            match session.status() {
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Degraded => stats.degraded += 1,
                SessionStatus::Error => stats.error += 1,
            }
        }
        stats
    }

    // =========================================================================
    // Background tasks & shutdown
    // =========================================================================

    /// Start the idle-expiry and health sweeps if not already running.
    /// Called implicitly by the first `load`.
    pub async fn start_background_tasks(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let mut sweeps = self.sweeps.lock().await;
        if sweeps.is_none() {
            *sweeps = Some(SweepTasks::spawn(self.self_ref.clone(), &self.config));
            tracing::info!(
                "registry_sweeps_started: idle_interval_secs={}, health_interval_secs={}, ttl_secs={}",
                self.config.sweep_interval.as_secs(),
                self.config.health_check_interval.as_secs(),
                self.config.session_ttl.as_secs()
            );
        }
    }

    /// Stop the sweeps and close every live session. Later loads fail.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let tasks = self.sweeps.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.stop().await;
        }

        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let closed = drained.len();
        for session in drained {
            close_session(&session).await;
        }
        self.user_locks.clear();
        tracing::info!("registry_shutdown: sessions_closed={}", closed);
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("user_locks", &self.user_locks.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Remove least-recently-used sessions until there is room for one more.
/// Ties go to whichever comes first in map iteration order.
fn take_lru_over_capacity(
    sessions: &mut HashMap<SessionKey, Arc<Session>>,
    capacity: usize,
) -> Vec<Arc<Session>> {
    let mut evicted = Vec::new();
    while !sessions.is_empty() && sessions.len() >= capacity {
        let oldest = sessions
            .iter()
            .min_by_key(|(_, s)| s.last_access())
            .map(|(k, _)| k.clone());
        match oldest.and_then(|k| sessions.remove(&k)) {
            Some(session) => evicted.push(session),
            None => break,
        }
    }
    evicted
}

async fn close_session(session: &Session) {
    if let Err(e) = session.client.close().await {
        tracing::warn!("session_close_failed: key={}, error={}", session.key, e);
    }
}

// =============================================================================
// Tests
// =============================================================================
