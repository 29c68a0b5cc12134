// App Proxy - State Channel
// In-process publish/subscribe for session state, with replay on subscribe

use std::sync::Mutex;

use tokio::sync::broadcast;

use app_proxy_common::SessionState;

/// Broadcasts session state transitions to any number of observers.
///
/// A subscriber attaching mid-session receives the current state up front
/// and then every later transition in publication order. Unsubscribing is
/// dropping the receiver.
pub struct StateChannel {
    current: Mutex<SessionState>,
    tx: broadcast::Sender<SessionState>,
}

/// What a subscriber gets: the state at subscription time plus the live feed.
pub struct StateSubscription {
    pub current: SessionState,
    pub rx: broadcast::Receiver<SessionState>,
}

impl StateChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self {
            current: Mutex::new(SessionState::Stopped),
            tx,
        }
    }

    /// Record and broadcast a transition. Publication order is subscription
    /// delivery order; the current-state lock makes publish and subscribe
    /// mutually atomic so no transition is dropped or duplicated.
    pub fn publish(&self, state: SessionState) {
        let mut current = self.current.lock().expect("state lock poisoned");
        *current = state.clone();
        // No receivers is fine; send only fails when nobody listens.
        let _ = self.tx.send(state);
    }

    pub fn current(&self) -> SessionState {
        self.current.lock().expect("state lock poisoned").clone()
    }

    pub fn subscribe(&self) -> StateSubscription {
        let current = self.current.lock().expect("state lock poisoned");
        StateSubscription {
            current: current.clone(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for StateChannel {
    fn default() -> Self {
        Self::new()
    }
}
