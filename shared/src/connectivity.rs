//! Debounced, hysteresis-stabilised reachability.
//!
//! The visible online flag flips to offline only after `max_retry_count`
//! consecutive failed cycles, and back to online on the first success.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::http::HttpError;
use crate::clock::{Clock, UnixTimeMs};
use crate::config::{ConfigError, OfflineConfig};
use crate::event::{ConnectivityEvent, ListenerRegistry, Subscription};
use crate::race::{first_to_complete, RaceOutcome};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeError {
    #[error("probe timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("backend resource '{resource}' unreachable: {message}")]
    Backend { resource: String, message: String },

    #[error("no reachability checks configured")]
    NoChecks,

    #[error("all {count} reachability checks failed, last: {last_error}")]
    AllChecksFailed { count: usize, last_error: String },

    #[error("probe task failed")]
    TaskFailed,
}

impl From<HttpError> for ProbeError {
    fn from(e: HttpError) -> Self {
        match e {
            HttpError::Timeout { timeout_ms } => ProbeError::Timeout { timeout_ms },
            other => ProbeError::Network(other.to_string()),
        }
    }
}

/// A single reachability check against one external endpoint.
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), ProbeError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Minimal "does this resource answer" query against the backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn resource_reachable(&self, resource: &str) -> Result<(), BackendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityPhase {
    Online,
    /// Visible flag still online but at least one cycle failed.
    Degraded,
    Offline,
}

/// Result of one raw probe cycle, before hysteresis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    Unreachable {
        internet_reachable: bool,
        error: ProbeError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub internet_reachable: bool,
    pub backend_reachable: bool,
    pub last_checked_at: Option<UnixTimeMs>,
    pub consecutive_failures: u32,
    pub last_error: Option<ProbeError>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self::optimistic()
    }
}

impl ConnectivityState {
    /// Process-start state: assume online until a probe says otherwise.
    pub fn optimistic() -> Self {
        Self {
            internet_reachable: true,
            backend_reachable: true,
            last_checked_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.internet_reachable && self.backend_reachable
    }

    pub fn phase(&self) -> ConnectivityPhase {
        if !self.is_online() {
            ConnectivityPhase::Offline
        } else if self.consecutive_failures > 0 {
            ConnectivityPhase::Degraded
        } else {
            ConnectivityPhase::Online
        }
    }

    pub fn event(&self) -> ConnectivityEvent {
        ConnectivityEvent {
            internet_reachable: self.internet_reachable,
            backend_reachable: self.backend_reachable,
        }
    }

    /// Folds one probe outcome into the state. Returns true when the visible
    /// online flag changed.
    pub fn apply(
        &mut self,
        outcome: ProbeOutcome,
        max_retry_count: u32,
        checked_at: UnixTimeMs,
    ) -> bool {
        let was_online = self.is_online();

        match outcome {
            ProbeOutcome::Reachable => {
                self.internet_reachable = true;
                self.backend_reachable = true;
                self.consecutive_failures = 0;
                self.last_error = None;
            }
            ProbeOutcome::Unreachable {
                internet_reachable,
                error,
            } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(error);
                if self.consecutive_failures >= max_retry_count {
                    self.internet_reachable = internet_reachable;
                    self.backend_reachable = false;
                }
            }
        }

        self.last_checked_at = Some(checked_at);
        was_online != self.is_online()
    }
}

pub struct ConnectivityProbe {
    config: OfflineConfig,
    clock: Arc<dyn Clock>,
    checks: Vec<Arc<dyn ReachabilityCheck>>,
    backend: Arc<dyn BackendClient>,
    state: Mutex<ConnectivityState>,
    listeners: ListenerRegistry<ConnectivityEvent>,
}

impl ConnectivityProbe {
    pub fn new(
        config: OfflineConfig,
        clock: Arc<dyn Clock>,
        checks: Vec<Arc<dyn ReachabilityCheck>>,
        backend: Arc<dyn BackendClient>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if checks.is_empty() && !config.probing_disabled {
            warn!("connectivity probe created without reachability checks");
        }

        Ok(Self {
            config,
            clock,
            checks,
            backend,
            state: Mutex::new(ConnectivityState::optimistic()),
            listeners: ListenerRegistry::new(),
        })
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.lock_state().is_online()
    }

    pub fn phase(&self) -> ConnectivityPhase {
        self.lock_state().phase()
    }

    pub fn snapshot(&self) -> ConnectivityState {
        self.lock_state().clone()
    }

    /// Listener fires only when the visible online flag changes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectivityEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn add_connectivity_listener<On, Off>(&self, on_online: On, on_offline: Off) -> Subscription
    where
        On: Fn() + Send + Sync + 'static,
        Off: Fn() + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |event: &ConnectivityEvent| {
            if event.is_online() {
                on_online()
            } else {
                on_offline()
            }
        })
    }

    /// Runs a probe cycle unless one completed within the debounce window,
    /// in which case the cached state is returned.
    #[instrument(skip(self))]
    pub async fn check(&self) -> ConnectivityEvent {
        let now = self.clock.now();

        if !self.config.probing_disabled {
            let state = self.lock_state();
            if let Some(last) = state.last_checked_at {
                if now.millis_since(last) < self.config.min_check_interval_ms {
                    debug!("within debounce window, serving cached state");
                    return state.event();
                }
            }
        }

        self.run_cycle(now).await
    }

    /// Probe cycle that ignores the debounce window.
    #[instrument(skip(self))]
    pub async fn check_now(&self) -> ConnectivityEvent {
        let now = self.clock.now();
        self.run_cycle(now).await
    }

    /// Raw internet reachability, no state change.
    pub async fn check_internet(&self) -> bool {
        self.probe_internet().await.is_ok()
    }

    /// Raw backend reachability, no state change.
    pub async fn check_backend(&self) -> bool {
        self.probe_backend().await.is_ok()
    }

    async fn run_cycle(&self, started_at: UnixTimeMs) -> ConnectivityEvent {
        if self.config.probing_disabled {
            return self.record(ProbeOutcome::Reachable, started_at);
        }

        let outcome = match self.probe_internet().await {
            Ok(()) => match self.probe_backend().await {
                Ok(()) => ProbeOutcome::Reachable,
                Err(error) => ProbeOutcome::Unreachable {
                    internet_reachable: true,
                    error,
                },
            },
            // No network, no point asking the backend.
            Err(error) => ProbeOutcome::Unreachable {
                internet_reachable: false,
                error,
            },
        };

        self.record(outcome, started_at)
    }

    fn record(&self, outcome: ProbeOutcome, checked_at: UnixTimeMs) -> ConnectivityEvent {
        let (event, changed, failures) = {
            let mut state = self.lock_state();
            if let ProbeOutcome::Unreachable { error, .. } = &outcome {
                debug!(
                    failures = state.consecutive_failures.saturating_add(1),
                    error = %error,
                    "probe cycle failed"
                );
            }
            let changed = state.apply(outcome, self.config.max_retry_count, checked_at);
            (state.event(), changed, state.consecutive_failures)
        };

        if changed {
            if event.is_online() {
                info!("connectivity restored");
            } else {
                warn!(
                    failures,
                    internet = event.internet_reachable,
                    "connectivity lost"
                );
            }
            self.listeners.emit(&event);
        }

        event
    }

    async fn probe_internet(&self) -> Result<(), ProbeError> {
        if self.checks.is_empty() {
            return Err(ProbeError::NoChecks);
        }

        let total = self.checks.len();
        let per_check = self.config.probe_timeout();
        let (tx, mut rx) = mpsc::channel(total);

        for check in &self.checks {
            let check = Arc::clone(check);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(per_check, check.check()).await {
                    Ok(result) => result,
                    Err(_) => Err(ProbeError::Timeout {
                        timeout_ms: per_check.as_millis() as u64,
                    }),
                };
                if let Err(e) = &result {
                    debug!(endpoint = check.name(), error = %e, "reachability check failed");
                }
                // Receiver is gone once another check already succeeded.
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let any_success = async move {
            let mut last_error = None;
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(()) => return Ok(()),
                    Err(e) => last_error = Some(e),
                }
            }
            Err(ProbeError::AllChecksFailed {
                count: total,
                last_error: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            })
        };

        let deadline = self.config.internet_check_timeout();
        match first_to_complete(any_success, deadline).await {
            RaceOutcome::Completed(result) => result,
            RaceOutcome::TimedOut => Err(ProbeError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
            RaceOutcome::Failed => Err(ProbeError::TaskFailed),
        }
    }

    async fn probe_backend(&self) -> Result<(), ProbeError> {
        let backend = Arc::clone(&self.backend);
        let primary = self.config.primary_backend_resource.clone();
        let fallback = self.config.fallback_backend_resource.clone();

        let query = async move {
            match backend.resource_reachable(&primary).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // One resource can fail on permissions or schema while the
                    // backend itself is healthy.
                    debug!(
                        resource = %primary,
                        error = %e,
                        "primary resource failed, trying fallback"
                    );
                    backend
                        .resource_reachable(&fallback)
                        .await
                        .map_err(|e| ProbeError::Backend {
                            resource: fallback,
                            message: e.message,
                        })
                }
            }
        };

        let deadline = self.config.backend_check_timeout();
        match first_to_complete(query, deadline).await {
            RaceOutcome::Completed(result) => result,
            RaceOutcome::TimedOut => Err(ProbeError::Timeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
            RaceOutcome::Failed => Err(ProbeError::TaskFailed),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnectivityState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("connectivity state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedBackend, ScriptedCheck};
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> OfflineConfig {
        OfflineConfig {
            max_retry_count: 3,
            min_check_interval_ms: 3_000,
            ..Default::default()
        }
    }

    fn probe_with(
        config: OfflineConfig,
        checks: &[Arc<ScriptedCheck>],
        backend: Arc<ScriptedBackend>,
    ) -> (ConnectivityProbe, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
        let checks = checks
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ReachabilityCheck>)
            .collect();
        let probe = ConnectivityProbe::new(config, clock.clone(), checks, backend).unwrap();
        (probe, clock)
    }

    fn five_checks(reachable: bool) -> Vec<Arc<ScriptedCheck>> {
        ["cloudflare", "google", "microsoft", "cdn-a", "cdn-b"]
            .iter()
            .map(|n| ScriptedCheck::new(n, reachable))
            .collect()
    }

    fn set_all(checks: &[Arc<ScriptedCheck>], reachable: bool) {
        for c in checks {
            c.set_reachable(reachable);
        }
    }

    #[test]
    fn starts_optimistically_online() {
        let (probe, _) = probe_with(config(), &five_checks(true), ScriptedBackend::new(true, true));
        assert!(probe.is_online());
        assert_eq!(probe.phase(), ConnectivityPhase::Online);
        assert!(probe.snapshot().last_checked_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn one_reachable_endpoint_is_enough() {
        let checks = five_checks(false);
        checks[3].set_reachable(true);
        let (probe, _) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        assert!(probe.check_internet().await);
    }

    #[tokio::test(start_paused = true)]
    async fn all_endpoints_down_means_no_internet() {
        let (probe, _) = probe_with(config(), &five_checks(false), ScriptedBackend::new(true, true));
        assert!(!probe.check_internet().await);
        assert!(matches!(
            probe.probe_internet().await,
            Err(ProbeError::AllChecksFailed { count: 5, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_endpoints_hit_the_timeout() {
        let checks = five_checks(true);
        for c in &checks {
            c.hang.store(true, Ordering::SeqCst);
        }
        let (probe, _) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        let started = tokio::time::Instant::now();
        let result = probe.probe_internet().await;

        assert!(result.is_err());
        assert!(started.elapsed() <= Duration::from_millis(2_500));
    }

    #[tokio::test(start_paused = true)]
    async fn backend_falls_back_to_secondary_resource() {
        let backend = ScriptedBackend::new(false, true);
        let (probe, _) = probe_with(config(), &five_checks(true), backend.clone());

        assert!(probe.check_backend().await);
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["health_check".to_string(), "profiles".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backend_down_when_both_resources_fail() {
        let backend = ScriptedBackend::new(false, false);
        let (probe, _) = probe_with(config(), &five_checks(true), backend);

        assert!(matches!(
            probe.probe_backend().await,
            Err(ProbeError::Backend { ref resource, .. }) if resource == "profiles"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_backend_hits_its_deadline() {
        let backend = ScriptedBackend::new(true, true);
        backend.hang.store(true, Ordering::SeqCst);
        let (probe, _) = probe_with(config(), &five_checks(true), backend.clone());

        let started = tokio::time::Instant::now();
        let result = probe.probe_backend().await;

        assert_eq!(result, Err(ProbeError::Timeout { timeout_ms: 4_000 }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4_000));
        assert!(elapsed < Duration::from_millis(4_500));

        let event = probe.check_now().await;
        let state = probe.snapshot();
        assert!(event.is_online());
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(probe.phase(), ConnectivityPhase::Degraded);
        assert_eq!(
            state.last_error,
            Some(ProbeError::Timeout { timeout_ms: 4_000 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backend_not_queried_without_internet() {
        let backend = ScriptedBackend::new(true, true);
        let cfg = OfflineConfig {
            max_retry_count: 1,
            ..config()
        };
        let (probe, _) = probe_with(cfg, &five_checks(false), backend.clone());

        let event = probe.check().await;

        assert!(!event.internet_reachable);
        assert!(!event.backend_reachable);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_serves_cached_state() {
        let checks = five_checks(true);
        let (probe, clock) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        probe.check().await;
        let after_first = checks[0].calls.load(Ordering::SeqCst);

        clock.advance_ms(1_000);
        set_all(&checks, false);
        let cached = probe.check().await;

        assert!(cached.is_online());
        assert_eq!(checks[0].calls.load(Ordering::SeqCst), after_first);
        assert_eq!(probe.snapshot().consecutive_failures, 0);

        clock.advance_ms(3_000);
        probe.check().await;
        assert_eq!(probe.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn check_now_ignores_debounce() {
        let checks = five_checks(true);
        let (probe, _) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        probe.check().await;
        probe.check_now().await;

        assert_eq!(checks[0].calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hysteresis_sequence_emits_once_per_transition() {
        let checks = five_checks(false);
        let (probe, clock) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        let online_events = Arc::new(AtomicUsize::new(0));
        let offline_events = Arc::new(AtomicUsize::new(0));
        let (on, off) = (online_events.clone(), offline_events.clone());
        let _sub = probe.add_connectivity_listener(
            move || {
                on.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                off.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut phases = vec![probe.phase()];
        for _ in 0..3 {
            probe.check().await;
            phases.push(probe.phase());
            clock.advance_ms(3_000);
        }
        set_all(&checks, true);
        probe.check().await;
        phases.push(probe.phase());

        assert_eq!(
            phases,
            vec![
                ConnectivityPhase::Online,
                ConnectivityPhase::Degraded,
                ConnectivityPhase::Degraded,
                ConnectivityPhase::Offline,
                ConnectivityPhase::Online,
            ]
        );
        assert_eq!(offline_events.load(Ordering::SeqCst), 1);
        assert_eq!(online_events.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_kept_for_diagnostics_and_cleared_on_success() {
        let checks = five_checks(false);
        let (probe, clock) = probe_with(config(), &checks, ScriptedBackend::new(true, true));

        probe.check().await;
        assert!(probe.snapshot().last_error.is_some());

        clock.advance_ms(3_000);
        set_all(&checks, true);
        probe.check().await;
        let state = probe.snapshot();
        assert!(state.last_error.is_none());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_probing_always_connected() {
        let checks = five_checks(false);
        let backend = ScriptedBackend::new(false, false);
        let cfg = OfflineConfig {
            probing_disabled: true,
            max_retry_count: 1,
            ..config()
        };
        let (probe, _) = probe_with(cfg, &checks, backend.clone());

        for _ in 0..5 {
            assert!(probe.check().await.is_online());
        }
        assert_eq!(checks[0].calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.call_count(), 0);
    }

    #[test]
    fn invalid_config_rejected() {
        let clock = Arc::new(ManualClock::default());
        let result = ConnectivityProbe::new(
            OfflineConfig {
                max_retry_count: 0,
                ..Default::default()
            },
            clock,
            Vec::new(),
            ScriptedBackend::new(true, true),
        );
        assert!(result.is_err());
    }

    fn failure() -> ProbeOutcome {
        ProbeOutcome::Unreachable {
            internet_reachable: false,
            error: ProbeError::Network("down".into()),
        }
    }

    proptest! {
        #[test]
        fn offline_only_after_max_consecutive_failures(
            outcomes in proptest::collection::vec(any::<bool>(), 0..64),
            max in 1u32..6,
        ) {
            let mut state = ConnectivityState::optimistic();
            for (i, ok) in outcomes.into_iter().enumerate() {
                let outcome = if ok { ProbeOutcome::Reachable } else { failure() };
                state.apply(outcome, max, UnixTimeMs(i as u64));
                if !state.is_online() {
                    prop_assert!(state.consecutive_failures >= max);
                }
            }
        }

        #[test]
        fn single_success_restores_online(
            failures in 0usize..32,
            max in 1u32..6,
        ) {
            let mut state = ConnectivityState::optimistic();
            for i in 0..failures {
                state.apply(failure(), max, UnixTimeMs(i as u64));
            }
            state.apply(ProbeOutcome::Reachable, max, UnixTimeMs(1_000));
            prop_assert!(state.is_online());
            prop_assert_eq!(state.consecutive_failures, 0);
            prop_assert_eq!(state.phase(), ConnectivityPhase::Online);
        }
    }
}
