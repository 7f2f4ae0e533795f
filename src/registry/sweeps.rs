//! Background maintenance for the session registry.
//!
//! Two periodic sweeps run for the lifetime of the registry:
//! - Idle expiry: unloads sessions not used within `session_ttl`
//! - Health: recomputes status from error ratios and warns about sessions
//!   close to expiring
//!
//! The tasks hold only a `Weak` reference, so dropping the registry ends them
//! on their next tick; `shutdown` stops them immediately.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::session::SessionStatus;
use super::SessionRegistry;
use crate::types::{RegistryConfig, SessionKey};

/// Outcome of one health sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSweepStats {
    /// Sessions inspected.
    pub checked: usize,
    /// Sessions whose status changed.
    pub status_changes: usize,
    /// Expiry warnings emitted this sweep.
    pub expiry_warnings: usize,
}

/// Handles for the spawned sweep loops.
#[derive(Debug)]
pub(crate) struct SweepTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Idle,
    Health,
}

impl SweepTasks {
    pub fn spawn(registry: Weak<SessionRegistry>, config: &RegistryConfig) -> Self {
        let cancel = CancellationToken::new();
        let handles = vec![
            spawn_loop(registry.clone(), config.sweep_interval, cancel.clone(), Sweep::Idle),
            spawn_loop(registry, config.health_check_interval, cancel.clone(), Sweep::Health),
        ];
        Self { cancel, handles }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("registry_sweep_join_failed: {}", e);
            }
        }
        tracing::info!("registry_sweeps_stopped");
    }
}

fn spawn_loop(
    registry: Weak<SessionRegistry>,
    period: Duration,
    cancel: CancellationToken,
    sweep: Sweep,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    match sweep {
                        Sweep::Idle => {
                            registry.sweep_idle().await;
                        }
                        Sweep::Health => {
                            registry.check_health().await;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!("registry_sweep_exited: sweep={:?}", sweep);
    })
}

impl SessionRegistry {
    /// Unload every session idle for longer than `session_ttl`.
    ///
    /// Each candidate is re-checked under its user's lock, so a session used
    /// between the scan and the unload survives. Returns the number removed.
    pub async fn sweep_idle(&self) -> usize {
        let ttl = self.config.session_ttl;
        let now = Instant::now();
        let candidates: Vec<SessionKey> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, s)| s.idle_for(now) > ttl)
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            let lock = self.user_lock(&key.user_id);
            let _guard = lock.lock().await;
            let still_idle = match self.lookup(&key).await {
                Some(session) => session.idle_for(Instant::now()) > ttl,
                None => false,
            };
            if still_idle && self.unload_locked(&key).await {
                tracing::info!("session_expired: key={}, ttl_secs={}", key, ttl.as_secs());
                removed += 1;
            }
        }

        let pruned = self.prune_user_locks().await;
        tracing::debug!(
            "idle_sweep_completed: expired={}, user_locks_pruned={}",
            removed,
            pruned
        );
        removed
    }

    /// Drop per-user locks for users with no sessions that nobody holds.
    async fn prune_user_locks(&self) -> usize {
        let users: HashSet<String> = self
            .sessions
            .read()
            .await
            .keys()
            .map(|k| k.user_id.clone())
            .collect();
        let before = self.user_locks.len();
        self.user_locks
            .retain(|user, lock| users.contains(user) || Arc::strong_count(lock) > 1);
        before.saturating_sub(self.user_locks.len())
    }

    /// Recompute each session's status and emit one-time expiry warnings.
    pub async fn check_health(&self) -> HealthSweepStats {
        let ttl = self.config.session_ttl;
        let warn_within = self.config.expiry_warning;
        let thresholds = &self.config.health;
        let now = Instant::now();
        let mut stats = HealthSweepStats::default();

        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            stats.checked += 1;
            let mut state = session.state();

            let next = SessionStatus::evaluate(
                state.status,
                state.error_count,
                state.request_count,
                thresholds,
            );
            if next != state.status {
                tracing::warn!(
                    "session_health_changed: key={}, from={}, to={}, error_rate={:.2}, requests={}",
                    session.key,
                    state.status,
                    next,
                    state.error_rate(),
                    state.request_count
                );
                state.status = next;
                stats.status_changes += 1;
            }

            let idle = now.saturating_duration_since(state.last_access);
            let remaining = ttl.saturating_sub(idle);
            if !state.expiry_warned && remaining < warn_within {
                tracing::warn!(
                    "session_expiring_soon: key={}, remaining_secs={}",
                    session.key,
                    remaining.as_secs()
                );
                state.expiry_warned = true;
                stats.expiry_warnings += 1;
            }
        }

        tracing::debug!(
            "health_sweep_completed: checked={}, changes={}, warnings={}",
            stats.checked,
            stats.status_changes,
            stats.expiry_warnings
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{plugin_config, test_registry_config, FakeFactory};
    use crate::transport::{MockTransportClient, TransportClient};
    use crate::types::{PluginConfig, Result};
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_removes_expired_and_closes_once() {
        let mut mock = MockTransportClient::new();
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_close().times(1).returning(|| Ok(()));
        let client: Arc<dyn TransportClient> = Arc::new(mock);
        let slot = std::sync::Mutex::new(Some(client));
        let factory = move |_: &PluginConfig| -> Result<Arc<dyn TransportClient>> {
            Ok(slot.lock().unwrap().take().unwrap())
        };
        let config = test_registry_config();
        let ttl = config.session_ttl;
        let registry = SessionRegistry::new(config, Arc::new(factory));

        assert!(registry.load(&plugin_config("u1", "github")).await);
        tokio::time::advance(ttl / 2).await;
        assert_eq!(registry.sweep_idle().await, 0);

        tokio::time::advance(ttl).await;
        assert_eq!(registry.sweep_idle().await, 1);
        assert!(registry.is_empty().await);
        assert_eq!(registry.sweep_idle().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_spares_recently_used() {
        let factory = FakeFactory::new();
        let config = test_registry_config();
        let ttl = config.session_ttl;
        let registry = SessionRegistry::new(config, factory.clone());

        registry.load(&plugin_config("u1", "github")).await;
        registry.load(&plugin_config("u1", "notion")).await;
        tokio::time::advance(ttl - Duration::from_secs(1)).await;
        registry.get("u1", "notion").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(registry.sweep_idle().await, 1);
        assert!(registry.contains("u1", "notion").await);
        assert_eq!(factory.plugin("github").closes(), 1);
        assert_eq!(factory.plugin("notion").closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_prunes_unused_user_locks() {
        let factory = FakeFactory::new();
        let config = test_registry_config();
        let ttl = config.session_ttl;
        let registry = SessionRegistry::new(config, factory);

        registry.load(&plugin_config("u1", "github")).await;
        assert_eq!(registry.stats().await.user_locks, 1);
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        registry.sweep_idle().await;
        assert_eq!(registry.stats().await.user_locks, 0);
    }

    #[tokio::test]
    async fn test_health_sweep_recomputes_status() {
        let factory = FakeFactory::new();
        let registry = SessionRegistry::new(test_registry_config(), factory.clone());
        registry.load(&plugin_config("u1", "github")).await;

        let key = SessionKey::new("u1", "github");
        {
            let session = registry.lookup(&key).await.unwrap();
            let mut state = session.state();
            state.request_count = 20;
            state.error_count = 8;
        }
        let stats = registry.check_health().await;
        assert_eq!(stats.checked, 1);
        assert_eq!(stats.status_changes, 1);
        assert_eq!(registry.lookup(&key).await.unwrap().status(), SessionStatus::Degraded);

        {
            let session = registry.lookup(&key).await.unwrap();
            session.state().error_count = 12;
        }
        registry.check_health().await;
        assert!(registry.get("u1", "github").await.is_none());
    }

    #[tokio::test]
    async fn test_health_sweep_waits_for_min_requests() {
        let factory = FakeFactory::new();
        let registry = SessionRegistry::new(test_registry_config(), factory);
        registry.load(&plugin_config("u1", "github")).await;
        {
            let session = registry.lookup(&SessionKey::new("u1", "github")).await.unwrap();
            let mut state = session.state();
            state.request_count = 3;
            state.error_count = 3;
        }
        let stats = registry.check_health().await;
        assert_eq!(stats.status_changes, 0);
        assert!(registry.get("u1", "github").await.is_some());
    }

    #[traced_test]
    #[tokio::test(start_paused = true)]
    async fn test_expiry_warning_is_emitted_once_and_reset_on_use() {
        let factory = FakeFactory::new();
        let config = test_registry_config();
        let ttl = config.session_ttl;
        let warning = config.expiry_warning;
        let registry = SessionRegistry::new(config, factory);
        registry.load(&plugin_config("u1", "github")).await;

        tokio::time::advance(ttl - warning + Duration::from_secs(1)).await;
        assert_eq!(registry.check_health().await.expiry_warnings, 1);
        assert_eq!(registry.check_health().await.expiry_warnings, 0);
        assert!(logs_contain("session_expiring_soon"));

        // Reuse clears the flag; a later approach to expiry warns again
        registry.get("u1", "github").await.unwrap();
        assert_eq!(registry.check_health().await.expiry_warnings, 0);
        tokio::time::advance(ttl - warning + Duration::from_secs(1)).await;
        assert_eq!(registry.check_health().await.expiry_warnings, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_expires_sessions() {
        let factory = FakeFactory::new();
        let config = RegistryConfig {
            session_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            ..test_registry_config()
        };
        let registry = SessionRegistry::new(config, factory.clone());
        registry.load(&plugin_config("u1", "github")).await;

        tokio::time::sleep(Duration::from_secs(90)).await;

        assert!(registry.is_empty().await);
        assert_eq!(factory.plugin("github").closes(), 1);
    }
}
