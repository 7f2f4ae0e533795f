//! Session record and status transitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};

use crate::transport::TransportClient;
use crate::types::{Error, PluginConfig, Result, SessionKey};

// =============================================================================
// Health thresholds
// =============================================================================

/// Error-ratio thresholds driving session status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// Error ratio above which a session is degraded (default: 0.3).
    pub degraded_error_rate: f64,
    /// Error ratio above which a session is in error (default: 0.5).
    pub error_error_rate: f64,
    /// Requests required before the ratio is evaluated (default: 10).
    pub min_requests: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_error_rate: 0.3,
            error_error_rate: 0.5,
            min_requests: 10,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.degraded_error_rate) || !in_range(self.error_error_rate) {
            return Err(Error::config("health thresholds must be within 0.0..=1.0"));
        }
        if self.degraded_error_rate > self.error_error_rate {
            return Err(Error::config(
                "health.degraded_error_rate must not exceed health.error_error_rate",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Session health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Degraded,
    Error,
}

impl SessionStatus {
    /// Status after re-evaluating the error ratio.
    ///
    /// `Error` is sticky: only an unload and reload leaves it. Below
    /// `min_requests` the current status is kept.
    pub fn evaluate(
        current: SessionStatus,
        error_count: u64,
        request_count: u64,
        thresholds: &HealthThresholds,
    ) -> SessionStatus {
        if current == SessionStatus::Error {
            return SessionStatus::Error;
        }
        if request_count == 0 || request_count < thresholds.min_requests {
            return current;
        }
        let rate = error_count as f64 / request_count as f64;
        if rate > thresholds.error_error_rate {
            SessionStatus::Error
        } else if rate > thresholds.degraded_error_rate {
            SessionStatus::Degraded
        } else {
            SessionStatus::Active
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Active => "active",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug)]
pub(crate) struct SessionState {
    pub last_access: Instant,
    pub request_count: u64,
    pub error_count: u64,
    pub status: SessionStatus,
    pub expiry_warned: bool,
}

impl SessionState {
    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }
}

/// A registry-owned live connection for one (user, plugin) pair.
pub(crate) struct Session {
    pub key: SessionKey,
    pub config: PluginConfig,
    pub client: Arc<dyn TransportClient>,
    pub created_at: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(key: SessionKey, config: PluginConfig, client: Arc<dyn TransportClient>) -> Self {
        let now = Instant::now();
        Self {
            key,
            config,
            client,
            created_at: now,
            state: Mutex::new(SessionState {
                last_access: now,
                request_count: 0,
                error_count: 0,
                status: SessionStatus::Active,
                expiry_warned: false,
            }),
        }
    }

    /// Short synchronous critical section; never held across an await.
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    pub fn last_access(&self) -> Instant {
        self.state().last_access
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    /// Record a use: bump last-access and the request counter, clear any
    /// pending expiry warning.
    pub fn touch(&self) {
        let mut state = self.state();
        state.last_access = Instant::now();
        state.request_count += 1;
        state.expiry_warned = false;
    }

    /// Degraded sessions recover once the ratio is back under the warning line.
    pub fn record_success(&self, thresholds: &HealthThresholds) -> SessionStatus {
        let mut state = self.state();
        if state.status == SessionStatus::Degraded {
            let next = SessionStatus::evaluate(
                state.status,
                state.error_count,
                state.request_count,
                thresholds,
            );
            if next == SessionStatus::Active {
                state.status = SessionStatus::Active;
            }
        }
        state.status
    }

    /// Returns `(previous, current)` status.
    pub fn record_failure(&self, thresholds: &HealthThresholds) -> (SessionStatus, SessionStatus) {
        let mut state = self.state();
        state.error_count += 1;
        let previous = state.status;
        state.status = SessionStatus::evaluate(
            state.status,
            state.error_count,
            state.request_count,
            thresholds,
        );
        (previous, state.status)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            key: self.key.clone(),
            status: self.status(),
        }
    }

    pub fn info(&self, persisted: Option<&PluginConfig>, now: Instant) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            key: self.key.clone(),
            status: state.status,
            error_rate: state.error_rate(),
            request_count: state.request_count,
            error_count: state.error_count,
            idle_secs: now.saturating_duration_since(state.last_access).as_secs(),
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
            in_sync: persisted.map_or(false, |p| *p == self.config),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

/// Key-based handle to a live session. Never exposes the transport client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHandle {
    pub key: SessionKey,
    pub status: SessionStatus,
}

/// Snapshot of one live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub status: SessionStatus,
    pub error_rate: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub idle_secs: u64,
    pub age_secs: u64,
    /// Stored config equals the persisted config for the same key.
    pub in_sync: bool,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds::default()
    }

    #[test]
    fn test_below_min_requests_keeps_status() {
        let t = thresholds();
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Active, 9, 9, &t),
            SessionStatus::Active
        );
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Degraded, 0, 0, &t),
            SessionStatus::Degraded
        );
    }

    #[test]
    fn test_ratio_thresholds() {
        let t = thresholds();
        // 4/10 = 40% -> degraded
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Active, 4, 10, &t),
            SessionStatus::Degraded
        );
        // 6/10 = 60% -> error
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Degraded, 6, 10, &t),
            SessionStatus::Error
        );
        // exactly 30% is not above the warning line
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Degraded, 3, 10, &t),
            SessionStatus::Active
        );
    }

    #[test]
    fn test_error_is_sticky() {
        assert_eq!(
            SessionStatus::evaluate(SessionStatus::Error, 0, 100, &thresholds()),
            SessionStatus::Error
        );
    }

    #[test]
    fn test_threshold_validation() {
        let inverted = HealthThresholds {
            degraded_error_rate: 0.6,
            error_error_rate: 0.5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        assert!(thresholds().validate().is_ok());
    }

    proptest! {
        #[test]
        fn prop_status_follows_ratio(requests in 10u64..10_000, errors_pct in 0u64..=100) {
            let t = thresholds();
            let errors = requests * errors_pct / 100;
            let status = SessionStatus::evaluate(SessionStatus::Active, errors, requests, &t);
            let rate = errors as f64 / requests as f64;
            if rate > t.error_error_rate {
                prop_assert_eq!(status, SessionStatus::Error);
            } else if rate < t.degraded_error_rate {
                prop_assert_eq!(status, SessionStatus::Active);
            } else if rate > t.degraded_error_rate {
                prop_assert_eq!(status, SessionStatus::Degraded);
            }
        }

        #[test]
        fn prop_error_never_leaves_error(errors in 0u64..1000, requests in 0u64..1000) {
            let status = SessionStatus::evaluate(SessionStatus::Error, errors, requests, &thresholds());
            prop_assert_eq!(status, SessionStatus::Error);
        }
    }

    mod session {
        use super::*;
        use crate::transport::MockTransportClient;
        use crate::types::TransportKind;

        fn session() -> Session {
            let config =
                PluginConfig::new("u1", "github", "https://gh.local", TransportKind::Sse);
            Session::new(
                SessionKey::new("u1", "github"),
                config,
                Arc::new(MockTransportClient::new()),
            )
        }

        #[test]
        fn test_degraded_recovers_on_success() {
            let t = thresholds();
            let s = session();
            for _ in 0..10 {
                s.touch();
            }
            for _ in 0..4 {
                s.record_failure(&t);
            }
            assert_eq!(s.status(), SessionStatus::Degraded);

            // 4 errors in 14 requests = 28%
            for _ in 0..4 {
                s.touch();
            }
            assert_eq!(s.record_success(&t), SessionStatus::Active);
        }

        #[test]
        fn test_failures_escalate_to_error() {
            let t = thresholds();
            let s = session();
            for _ in 0..10 {
                s.touch();
            }
            let mut last = (SessionStatus::Active, SessionStatus::Active);
            for _ in 0..6 {
                last = s.record_failure(&t);
            }
            assert_eq!(last.1, SessionStatus::Error);
            // success cannot clear error
            assert_eq!(s.record_success(&t), SessionStatus::Error);
        }

        #[test]
        fn test_info_in_sync_flag() {
            let s = session();
            let same = s.config.clone();
            let mut changed = s.config.clone();
            changed.endpoint_url = "https://gh2.local".into();
            let now = Instant::now();
            assert!(s.info(Some(&same), now).in_sync);
            assert!(!s.info(Some(&changed), now).in_sync);
            assert!(!s.info(None, now).in_sync);
        }
    }
}
