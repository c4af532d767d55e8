//! Circuit breakers for downstream dependencies
//!
//! Each breaker counts consecutive failures. Reaching the threshold opens it;
//! after the recovery timeout the next request is let through as a half-open
//! probe, which either closes the breaker again or re-opens it. Every state
//! change is published on the registry's transition channel so the resilience
//! coordinator can react without polling.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::error::ConclaveError;

/// Transitions buffered for the recompute loop before new ones are dropped
pub const TRANSITION_BACKLOG: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&ResilienceConfig> for BreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold.max(1),
            recovery_timeout: config.breaker_recovery_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<mpsc::Sender<BreakerTransition>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_events(name, config, None)
    }

    fn with_events(
        name: impl Into<String>,
        config: BreakerConfig,
        events: Option<mpsc::Sender<BreakerTransition>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Whether a request may go through now. Moves Open to HalfOpen once the
    /// recovery timeout has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        let (allowed, transition) = match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => (true, None),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    (true, self.set_state(&mut inner, CircuitState::HalfOpen))
                } else {
                    (false, None)
                }
            }
        };
        drop(inner);
        self.publish(transition);
        allowed
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        let transition = if inner.state == CircuitState::Closed {
            None
        } else {
            inner.opened_at = None;
            self.set_state(&mut inner, CircuitState::Closed)
        };
        drop(inner);
        self.publish(transition);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        let transition = if trip {
            inner.opened_at = Some(Instant::now());
            self.set_state(&mut inner, CircuitState::Open)
        } else {
            None
        };
        drop(inner);
        self.publish(transition);
    }

    /// Open regardless of the failure count
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.opened_at = Some(Instant::now());
        let transition = self.set_state(&mut inner, CircuitState::Open);
        drop(inner);
        self.publish(transition);
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        let transition = self.set_state(&mut inner, CircuitState::Closed);
        drop(inner);
        self.publish(transition);
    }

    /// Run `operation` through the breaker, recording its outcome
    pub async fn call<F, Fut, T>(&self, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.allow_request() {
            return Err(ConclaveError::DegradedDependency {
                dependency: self.name.clone(),
                reason: "circuit open".into(),
            }
            .into());
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn set_state(&self, inner: &mut BreakerInner, to: CircuitState) -> Option<BreakerTransition> {
        let from = inner.state;
        if from == to {
            return None;
        }
        inner.state = to;
        Some(BreakerTransition {
            breaker: self.name.clone(),
            from,
            to,
        })
    }

    fn publish(&self, transition: Option<BreakerTransition>) {
        let Some(transition) = transition else {
            return;
        };
        match transition.to {
            CircuitState::Open => {
                warn!(breaker = %self.name, from = ?transition.from, "Circuit opened")
            }
            _ => info!(breaker = %self.name, from = ?transition.from, to = ?transition.to, "Circuit state changed"),
        }
        if let Some(events) = &self.events {
            // A full backlog already has a recompute pending; a closed one has no reader.
            if let Err(mpsc::error::TrySendError::Full(dropped)) = events.try_send(transition) {
                debug!(breaker = %dropped.breaker, "Transition backlog full, event dropped");
            }
        }
    }
}

/// Named breakers sharing one config and one transition channel
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
    events: mpsc::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> (Self, mpsc::Receiver<BreakerTransition>) {
        let (events, rx) = mpsc::channel(TRANSITION_BACKLOG);
        (
            Self {
                config,
                breakers: RwLock::new(BTreeMap::new()),
                events,
            },
            rx,
        )
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }
        let mut breakers = self.breakers.write();
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_events(
                name,
                self.config.clone(),
                Some(self.events.clone()),
            ))
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Breakers that are not closed. Half-open counts as open until a probe succeeds.
    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() != CircuitState::Closed)
            .count()
    }

    pub fn states(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .read()
            .iter()
            .map(|(name, b)| (name.clone(), b.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}
