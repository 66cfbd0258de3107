//! Per-service circuit breaker.
//!
//! # States
//! - Closed: requests pass, outcomes accumulate in the current window
//! - Open: requests are rejected without contacting the upstream
//! - Half-Open: one probe request is let through to test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:      total >= minimum_samples and failures/total >= threshold
//! Open → Half-Open:   half_open_after elapsed since opened_at (on the next can_pass)
//! Half-Open → Closed: probe classified as success, counters reset
//! Half-Open → Open:   probe failed, opened_at reset to now
//! ```
//!
//! The window is reset when more than `window` has passed since the last recorded
//! outcome, not on fixed boundaries. A slow trickle of failures can therefore keep
//! resetting the counters without ever tripping.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use scc::HashMap;
use serde::Serialize;

use crate::{config::CircuitBreakerConfig, core::classifier::Classification, ports::Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub window: Duration,
    pub failure_threshold_percent: u32,
    pub minimum_samples: u32,
    pub half_open_after: Duration,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            window: Duration::from_millis(config.window_ms),
            failure_threshold_percent: config.failure_threshold_percent,
            minimum_samples: config.minimum_samples,
            half_open_after: Duration::from_millis(config.half_open_after_ms),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

/// Point-in-time view of a breaker, used by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub total: u32,
    pub window_age_ms: u64,
    pub open_for_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub retry_after_secs: Option<u64>,
}

/// State and counters, always mutated together under one lock.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    total: u32,
    window_started_at: Instant,
    last_recorded_at: Option<Instant>,
    opened_at: Option<Instant>,
    probe_started_at: Option<Instant>,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            total: 0,
            window_started_at: now,
            last_recorded_at: None,
            opened_at: None,
            probe_started_at: None,
        }
    }

    fn reset_window(&mut self, now: Instant) {
        self.failures = 0;
        self.total = 0;
        self.window_started_at = now;
        self.last_recorded_at = None;
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_started_at = None;
    }

    /// Admission decision. May move Open → HalfOpen and hand out the probe permit.
    fn admit(&mut self, now: Instant, settings: &BreakerSettings) -> (bool, Option<CircuitState>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now.duration_since(opened_at) >= settings.half_open_after {
                    self.state = CircuitState::HalfOpen;
                    self.probe_started_at = Some(now);
                    (true, Some(CircuitState::HalfOpen))
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => match self.probe_started_at {
                Some(started) if now.duration_since(started) < settings.half_open_after => {
                    (false, None)
                }
                // No probe outstanding, or the previous one was abandoned
                _ => {
                    self.probe_started_at = Some(now);
                    (true, None)
                }
            },
        }
    }

    fn record(
        &mut self,
        success: bool,
        now: Instant,
        settings: &BreakerSettings,
    ) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                if let Some(last) = self.last_recorded_at {
                    if now.duration_since(last) > settings.window {
                        self.reset_window(now);
                    }
                }
                if self.total == u32::MAX {
                    // Steady traffic never resets the window; halving keeps the ratio
                    self.total /= 2;
                    self.failures /= 2;
                }
                self.total += 1;
                if !success {
                    self.failures += 1;
                }
                self.last_recorded_at = Some(now);

                let over_threshold = u64::from(self.failures) * 100
                    >= u64::from(settings.failure_threshold_percent) * u64::from(self.total);
                if self.total >= settings.minimum_samples && over_threshold {
                    self.trip(now);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    self.state = CircuitState::Closed;
                    self.opened_at = None;
                    self.probe_started_at = None;
                    self.reset_window(now);
                    Some(CircuitState::Closed)
                } else {
                    self.trip(now);
                    Some(CircuitState::Open)
                }
            }
            // Late outcomes from attempts started before the trip
            CircuitState::Open => None,
        }
    }

    fn remaining_cooldown(&self, now: Instant, settings: &BreakerSettings) -> Option<Duration> {
        let started = match self.state {
            CircuitState::Closed => return None,
            CircuitState::Open => self.opened_at?,
            CircuitState::HalfOpen => self.probe_started_at?,
        };
        Some(
            settings
                .half_open_after
                .saturating_sub(now.duration_since(started)),
        )
    }
}

/// Round a cooldown up to whole seconds, never below one, for `Retry-After`.
fn whole_seconds(remaining: Duration) -> Duration {
    let secs = remaining.as_millis().div_ceil(1000).max(1);
    Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
}

/// Circuit breaker guarding one logical upstream service.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            service: service.into(),
            settings,
            clock,
            inner: Mutex::new(BreakerState::new(now)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // Every mutation leaves the state consistent, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a request may contact the upstream right now.
    ///
    /// Returns false while Open and cooling down, and in Half-Open while the single
    /// probe is outstanding. The first call after the cooldown performs the
    /// Open → Half-Open transition and returns true.
    pub fn can_pass(&self) -> bool {
        let now = self.clock.now();
        let (allowed, transition) = self.lock().admit(now, &self.settings);
        if let Some(state) = transition {
            self.announce(state);
        }
        if !allowed {
            crate::metrics::increment_circuit_rejections(&self.service);
        }
        allowed
    }

    /// Record the outcome of one upstream attempt. Never fails.
    pub fn record(&self, outcome: Classification) {
        let now = self.clock.now();
        let transition = self
            .lock()
            .record(outcome.is_success(), now, &self.settings);
        if let Some(state) = transition {
            self.announce(state);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Remaining cooldown rounded up to whole seconds, when the breaker is not Closed.
    pub fn retry_after(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock()
            .remaining_cooldown(now, &self.settings)
            .map(whole_seconds)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            total: inner.total,
            window_age_ms: millis(now.duration_since(inner.window_started_at)),
            open_for_ms: inner.opened_at.map(|at| millis(now.duration_since(at))),
            probe_in_flight: inner.state == CircuitState::HalfOpen
                && inner.probe_started_at.is_some(),
            retry_after_secs: inner
                .remaining_cooldown(now, &self.settings)
                .map(|d| whole_seconds(d).as_secs()),
        }
    }

    fn announce(&self, state: CircuitState) {
        match state {
            CircuitState::Open => tracing::warn!(
                service = %self.service,
                threshold_percent = self.settings.failure_threshold_percent,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::warn!(
                service = %self.service,
                "circuit breaker transitioning to half-open state"
            ),
            CircuitState::Closed => tracing::info!(
                service = %self.service,
                "circuit breaker closed after successful probe"
            ),
        }
        crate::metrics::set_circuit_state(&self.service, state);
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// One breaker per logical service, created lazily on first access.
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: HashMap::new(),
            settings,
            clock,
        }
    }

    /// Breaker for `service`, creating it in the Closed state if needed.
    pub async fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(entry) = self.breakers.get_async(service).await {
            return entry.get().clone();
        }
        self.breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| {
                tracing::debug!(service, "creating circuit breaker");
                Arc::new(CircuitBreaker::new(
                    service,
                    self.settings.clone(),
                    self.clock.clone(),
                ))
            })
            .get()
            .clone()
    }

    /// Snapshot of an existing breaker. Services never called have none.
    pub async fn snapshot(&self, service: &str) -> Option<BreakerSnapshot> {
        let breaker = self
            .breakers
            .get_async(service)
            .await
            .map(|entry| entry.get().clone())?;
        Some(breaker.snapshot())
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
