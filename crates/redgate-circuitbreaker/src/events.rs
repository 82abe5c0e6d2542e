use crate::circuit::CircuitState;
use redgate_core::SubstrateEvent;

/// Events emitted by the circuit breaker.
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    /// The circuit changed state.
    StateTransition {
        breaker_name: String,
        from_state: CircuitState,
        to_state: CircuitState,
    },
    /// A call was permitted through the circuit.
    CallPermitted {
        breaker_name: String,
        state: CircuitState,
    },
    /// A call was rejected because the circuit is open.
    CallRejected { breaker_name: String },
    /// A successful call was recorded.
    SuccessRecorded {
        breaker_name: String,
        state: CircuitState,
    },
    /// A classified failure was recorded.
    FailureRecorded {
        breaker_name: String,
        state: CircuitState,
    },
}

impl SubstrateEvent for CircuitBreakerEvent {
    fn kind(&self) -> &'static str {
        match self {
            CircuitBreakerEvent::StateTransition { .. } => "state_transition",
            CircuitBreakerEvent::CallPermitted { .. } => "call_permitted",
            CircuitBreakerEvent::CallRejected { .. } => "call_rejected",
            CircuitBreakerEvent::SuccessRecorded { .. } => "success_recorded",
            CircuitBreakerEvent::FailureRecorded { .. } => "failure_recorded",
        }
    }

    fn component(&self) -> &str {
        match self {
            CircuitBreakerEvent::StateTransition { breaker_name, .. }
            | CircuitBreakerEvent::CallPermitted { breaker_name, .. }
            | CircuitBreakerEvent::CallRejected { breaker_name }
            | CircuitBreakerEvent::SuccessRecorded { breaker_name, .. }
            | CircuitBreakerEvent::FailureRecorded { breaker_name, .. } => breaker_name,
        }
    }
}
