//! Event system shared by the substrate components.
//!
//! Each component (circuit breaker, queue, alert manager, ...) defines its
//! own event enum and emits through an [`EventListeners`] collection, so
//! callers can observe behavior without the components knowing about any
//! particular sink.

use std::fmt;
use std::sync::Arc;

/// Trait for events emitted by substrate components.
pub trait SubstrateEvent: Send + Sync + fmt::Debug {
    /// Short event kind, e.g. "state_transition" or "task_dead_lettered".
    fn kind(&self) -> &'static str;

    /// Name of the component instance that emitted this event.
    fn component(&self) -> &str;
}

/// Trait for listening to substrate events.
pub trait EventListener<E: SubstrateEvent>: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &E);
}

/// Type alias for shared event listeners.
pub type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// A collection of event listeners.
///
/// Emission isolates listener panics: a panicking listener is logged and
/// the remaining listeners still run.
#[derive(Clone)]
pub struct EventListeners<E: SubstrateEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: SubstrateEvent> EventListeners<E> {
    /// Creates an empty listener collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all registered listeners.
    pub fn emit(&self, event: &E) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if result.is_err() {
                tracing::warn!(
                    listener_index = index,
                    component = event.component(),
                    event_kind = event.kind(),
                    "substrate event listener panicked"
                );

                #[cfg(feature = "metrics")]
                metrics::counter!(
                    "redgate_event_listener_panics_total",
                    "component" => event.component().to_string(),
                    "event_kind" => event.kind().to_string()
                )
                .increment(1);
            }
        }
    }

    /// Returns true if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E: SubstrateEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A function-based event listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Wraps a closure as a listener.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: SubstrateEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct TestEvent {
        name: String,
    }

    impl SubstrateEvent for TestEvent {
        fn kind(&self) -> &'static str {
            "test"
        }

        fn component(&self) -> &str {
            &self.name
        }
    }

    #[test]
    fn listeners_receive_every_emit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(move |_event: &TestEvent| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let event = TestEvent {
            name: "test".to_string(),
        };

        listeners.emit(&event);
        listeners.emit(&event);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let successful = Arc::new(AtomicUsize::new(0));
        let successful_clone = Arc::clone(&successful);

        let mut listeners = EventListeners::new();
        listeners.add(FnListener::new(|_: &TestEvent| panic!("boom")));
        listeners.add(FnListener::new(move |_: &TestEvent| {
            successful_clone.fetch_add(1, Ordering::SeqCst);
        }));

        listeners.emit(&TestEvent {
            name: "panic-test".to_string(),
        });
        assert_eq!(successful.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_collection_reports_empty() {
        let listeners: EventListeners<TestEvent> = EventListeners::new();
        assert!(listeners.is_empty());
        assert_eq!(listeners.len(), 0);
    }
}
