//! Bookkeeping for live bridge tasks

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) struct TrackedBridge {
    pub(crate) cancel: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

/// Map of bridge id -> (cancellation, task). A bridge removes itself when it
/// finishes; `drain` hands everything still running to the closer.
#[derive(Default)]
pub(crate) struct BridgeTracker {
    bridges: Mutex<HashMap<Uuid, TrackedBridge>>,
}

impl BridgeTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TrackedBridge>> {
        self.bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Spawn a bridge task and register it before it can finish
    pub(crate) fn spawn<F, Fut>(self: &Arc<Self>, make: F) -> Uuid
    where
        F: FnOnce(Uuid, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let task = make(id, cancel.clone());
        let tracker = Arc::clone(self);

        let mut bridges = self.lock();
        let handle = tokio::spawn(async move {
            task.await;
            tracker.finish(id);
        });
        bridges.insert(id, TrackedBridge { cancel, handle });
        id
    }

    fn finish(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    pub(crate) fn drain(&self) -> Vec<TrackedBridge> {
        self.lock().drain().map(|(_, bridge)| bridge).collect()
    }

    pub(crate) fn cancel_all(&self) {
        for bridge in self.lock().values() {
            bridge.cancel.cancel();
        }
    }
}
