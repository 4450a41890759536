use std::sync::Arc;

use crate::chat::ChatMessage;
use crate::state::{SessionPhase, VisitState};

/// Terminal outcome of a visit, delivered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The encounter ran to its end (provider or patient hung up normally).
    Completed,
    CancelledByUser,
    DeclinedByProvider,
    /// The same participant joined the visit from another device.
    JoinedElsewhere,
    ExceededReconnectAttempt,
    /// Non-virtual modality: no transport session was ever opened.
    PhoneVisit,
    PermissionDenied,
    SubscribeFailed,
    /// Fatal, non-retryable transport failure.
    TransportFailed,
}

/// Fire-and-forget notifications emitted by the core to registered listeners.
///
/// Purely observational: nothing a listener does can affect orchestrator
/// state.
#[derive(Debug, Clone)]
pub enum VisitEvent {
    StateChanged(VisitState),
    WaitingRoomLaunched,
    TechCheckSubmitted,
    Reconnecting(SessionPhase),
    Reconnected(SessionPhase),
    VisitStarted,
    VisitCompleted(CompletionReason),
    CancelledByUser,
    DeclinedByProvider,
    DevicePairInitiated,
    SoftError(String),
    WaitTimeUpdated(String),
    ChatMessageReceived(SessionPhase, ChatMessage),
    RemoteTypingStarted { display_name: String },
    RemoteTypingStopped,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait VisitEventListener: Send + Sync {
    fn on_event(&self, event: VisitEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn VisitEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn VisitEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: VisitEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl VisitEventListener for CountingListener {
        fn on_event(&self, _event: VisitEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_listener() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));
        emitter.add_listener(Arc::new(CountingListener { count: count.clone() }));

        emitter.emit(VisitEvent::VisitStarted);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emitter_dispatches_to_multiple_listeners() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(VisitEvent::WaitingRoomLaunched);

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    struct EventCapture {
        events: Arc<std::sync::Mutex<Vec<VisitEvent>>>,
    }

    impl VisitEventListener for EventCapture {
        fn on_event(&self, event: VisitEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn emitter_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        emitter.add_listener(Arc::new(EventCapture { events: events.clone() }));

        emitter.emit(VisitEvent::VisitCompleted(CompletionReason::Completed));

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            VisitEvent::VisitCompleted(reason) => {
                assert_eq!(*reason, CompletionReason::Completed)
            }
            _ => panic!("expected VisitCompleted"),
        }
    }
}
