//! Connection state fan-out

use std::sync::{Mutex, MutexGuard, PoisonError};

use access_ssh_proto::{ConnectionState, Failure};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Stream of state changes, starting with the state at subscription time
pub type StateStream = UnboundedReceiverStream<ConnectionState>;

struct HubInner {
    current: ConnectionState,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

/// Current state plus every live subscriber. Publishing and subscribing
/// share one lock, so no subscriber misses or reorders a transition.
pub(crate) struct StateHub {
    inner: Mutex<HubInner>,
}

impl StateHub {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                current: ConnectionState::Idle,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.lock().current.clone()
    }

    pub(crate) fn subscribe(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Receiver is alive, send cannot fail
        let _ = tx.send(inner.current.clone());
        inner.subscribers.push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub(crate) fn publish(&self, state: ConnectionState) {
        let mut inner = self.lock();
        Self::publish_locked(&mut inner, state);
    }

    /// Start a connect attempt: check the current state, run `prepare`, then
    /// publish `authenticating`. Either rejection publishes `failed`. The whole
    /// step holds the lock so two callers cannot both start.
    pub(crate) fn begin_connect<T, F>(&self, prepare: F) -> Result<T, Failure>
    where
        F: FnOnce() -> Result<T, Failure>,
    {
        let mut inner = self.lock();
        if !inner.current.can_start_connection() {
            let failure =
                Failure::invalid_state(format!("cannot connect from state {}", inner.current));
            Self::publish_locked(&mut inner, ConnectionState::Failed(failure.clone()));
            return Err(failure);
        }

        match prepare() {
            Ok(prepared) => {
                Self::publish_locked(&mut inner, ConnectionState::Authenticating);
                Ok(prepared)
            }
            Err(failure) => {
                Self::publish_locked(&mut inner, ConnectionState::Failed(failure.clone()));
                Err(failure)
            }
        }
    }

    fn publish_locked(inner: &mut HubInner, state: ConnectionState) {
        debug!("Connection state -> {}", state);
        inner.current = state.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(state.clone()).is_ok());
    }
}

impl Default for StateHub {
    fn default() -> Self {
        Self::new()
    }
}
