use crate::events::CircuitBreakerEvent;
use crate::{CircuitBreaker, CircuitState, SharedFailureClassifier};
use redgate_core::{EventListeners, FnListener};
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by the circuit state machine.
pub struct CircuitBreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) success_threshold: u32,
    pub(crate) recovery_timeout: Duration,
    pub(crate) operation_timeout: Duration,
    pub(crate) event_listeners: EventListeners<CircuitBreakerEvent>,
    pub(crate) name: String,
}

impl CircuitBreakerConfig {
    /// Creates a new configuration builder.
    pub fn builder<E>() -> CircuitBreakerBuilder<E> {
        CircuitBreakerBuilder::new()
    }
}

/// Builder for configuring and constructing a [`CircuitBreaker`].
pub struct CircuitBreakerBuilder<E> {
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    operation_timeout: Duration,
    failure_classifier: SharedFailureClassifier<E>,
    event_listeners: EventListeners<CircuitBreakerEvent>,
    name: String,
}

impl<E> CircuitBreakerBuilder<E> {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            operation_timeout: Duration::from_secs(10),
            failure_classifier: Arc::new(|_| true),
            event_listeners: EventListeners::new(),
            name: String::from("<unnamed>"),
        }
    }

    /// Sets the number of classified failures that opens the circuit.
    ///
    /// Default: 5
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Sets the number of half-open successes that closes the circuit.
    ///
    /// Default: 3
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Sets how long the circuit stays open before a recovery probe is
    /// allowed.
    ///
    /// Default: 60 seconds
    pub fn recovery_timeout(mut self, duration: Duration) -> Self {
        self.recovery_timeout = duration;
        self
    }

    /// Sets the timeout applied to every call through the breaker.
    ///
    /// Default: 10 seconds
    pub fn operation_timeout(mut self, duration: Duration) -> Self {
        self.operation_timeout = duration;
        self
    }

    /// Sets the classifier deciding which errors count against the breaker.
    ///
    /// Errors for which the classifier returns false propagate to the
    /// caller without affecting circuit state.
    ///
    /// Default: every error counts
    pub fn failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.failure_classifier = Arc::new(classifier);
        self
    }

    /// Give this breaker a human-readable name for observability.
    ///
    /// Default: `<unnamed>`
    pub fn name<N: Into<String>>(mut self, n: N) -> Self {
        self.name = n.into();
        self
    }

    /// Register a callback for state transition events.
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &CircuitBreakerEvent| {
                if let CircuitBreakerEvent::StateTransition {
                    from_state,
                    to_state,
                    ..
                } = event
                {
                    f(*from_state, *to_state);
                }
            }));
        self
    }

    /// Register a callback for call rejected events.
    pub fn on_call_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &CircuitBreakerEvent| {
                if matches!(event, CircuitBreakerEvent::CallRejected { .. }) {
                    f();
                }
            }));
        self
    }

    /// Register a callback for recorded failures.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(CircuitState) + Send + Sync + 'static,
    {
        self.event_listeners
            .add(FnListener::new(move |event: &CircuitBreakerEvent| {
                if let CircuitBreakerEvent::FailureRecorded { state, .. } = event {
                    f(*state);
                }
            }));
        self
    }

    pub(crate) fn build_config(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            recovery_timeout: self.recovery_timeout,
            operation_timeout: self.operation_timeout,
            event_listeners: self.event_listeners,
            name: self.name,
        }
    }

    /// Builds the circuit breaker.
    pub fn build(self) -> CircuitBreaker<E> {
        let classifier = Arc::clone(&self.failure_classifier);
        CircuitBreaker::new(self.build_config(), classifier)
    }
}

impl<E> Default for CircuitBreakerBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
