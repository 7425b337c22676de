//! Live-engine bookkeeping.
//!
//! One slot per rule id. Control operations on an id first take that id's
//! async gate, so `start` and `stop` for the same rule never interleave while
//! different rules proceed in parallel. The data plane never touches the gate.

use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Listener,
    Session,
}

struct Tracked {
    cancel: CancellationToken,
    abort: Option<AbortHandle>,
}

/// Bridged connections owned by one live engine.
pub struct ConnectionSet {
    open: Mutex<HashMap<Uuid, Tracked>>,
    tracker: TaskTracker,
    parent: CancellationToken,
}

/// Drops a connection's entry when its task ends, aborted or not.
struct Untrack {
    set: Arc<ConnectionSet>,
    key: Uuid,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        locked(&self.set.open).remove(&self.key);
    }
}

impl ConnectionSet {
    pub fn new(parent: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            parent,
        })
    }

    /// Runs `task` as a tracked connection. The token it receives fires when
    /// the connection is force-closed.
    pub fn spawn<F, Fut>(self: &Arc<Self>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = Uuid::new_v4();
        let cancel = self.parent.child_token();
        locked(&self.open).insert(
            key,
            Tracked {
                cancel: cancel.clone(),
                abort: None,
            },
        );

        let untrack = Untrack {
            set: Arc::clone(self),
            key,
        };
        let fut = task(cancel);
        let handle = self.tracker.spawn(async move {
            let _untrack = untrack;
            fut.await;
        });

        // The task may already be gone, in which case there is nothing to abort.
        if let Some(tracked) = locked(&self.open).get_mut(&key) {
            tracked.abort = Some(handle.abort_handle());
        }
    }

    pub fn len(&self) -> usize {
        locked(&self.open).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        let open = locked(&self.open);
        debug!("Force-closing {} connections", open.len());
        for tracked in open.values() {
            tracked.cancel.cancel();
        }
    }

    /// Aborts connections that ignored `close_all`.
    pub fn abort_all(&self) {
        let open = locked(&self.open);
        if !open.is_empty() {
            warn!("Aborting {} connections that did not close", open.len());
        }
        for abort in open.values().filter_map(|tracked| tracked.abort.as_ref()) {
            abort.abort();
        }
    }

    pub async fn wait_closed(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// A running listener or SSH session registered under a rule id.
pub struct LiveEngine {
    pub instance: Uuid,
    pub kind: EngineKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    connections: Arc<ConnectionSet>,
}

impl LiveEngine {
    pub fn new(
        instance: Uuid,
        kind: EngineKind,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        connections: Arc<ConnectionSet>,
    ) -> Self {
        Self {
            instance,
            kind,
            cancel,
            task,
            connections,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    /// Cancels the engine and every connection, then waits up to `grace` for
    /// all of them to finish. The engine task and any connection still open
    /// after that are aborted.
    pub async fn shutdown(self, grace: Duration) {
        let LiveEngine {
            instance,
            kind,
            cancel,
            mut task,
            connections,
        } = self;

        connections.close_all();
        cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            let _ = (&mut task).await;
            connections.wait_closed().await;
        })
        .await;

        if drained.is_err() {
            warn!(
                "{:?} {} did not stop within {:?}, aborting",
                kind, instance, grace
            );
            task.abort();
            connections.abort_all();
        }
    }

    /// Tears down connections without waiting on the engine task itself;
    /// used by the engine task when it retires its own entry. Connections
    /// still open after `grace` are aborted.
    pub async fn retire(self, grace: Duration) {
        self.connections.close_all();
        self.cancel.cancel();
        if tokio::time::timeout(grace, self.connections.wait_closed())
            .await
            .is_err()
        {
            warn!("Connections of {} did not close within {:?}", self.instance, grace);
            self.connections.abort_all();
        }
    }
}

struct Slot {
    gate: Arc<AsyncMutex<()>>,
    engine: Mutex<Option<LiveEngine>>,
}

#[derive(Default)]
pub struct EngineRegistry {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive control of `id`.
    pub async fn lock(self: &Arc<Self>, id: &str) -> KeyGuard {
        let slot = {
            let mut slots = locked(&self.slots);
            Arc::clone(slots.entry(id.to_string()).or_insert_with(|| {
                Arc::new(Slot {
                    gate: Arc::new(AsyncMutex::new(())),
                    engine: Mutex::new(None),
                })
            }))
        };
        let gate = Arc::clone(&slot.gate).lock_owned().await;
        KeyGuard {
            registry: Arc::clone(self),
            id: id.to_string(),
            slot,
            _gate: gate,
        }
    }

    pub fn is_live(&self, id: &str) -> bool {
        locked(&self.slots)
            .get(id)
            .is_some_and(|slot| locked(&slot.engine).is_some())
    }

    pub fn live_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = locked(&self.slots)
            .iter()
            .filter(|(_, slot)| locked(&slot.engine).is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn connection_count(&self, id: &str) -> usize {
        locked(&self.slots)
            .get(id)
            .and_then(|slot| {
                locked(&slot.engine)
                    .as_ref()
                    .map(|engine| engine.connections.len())
            })
            .unwrap_or(0)
    }

    /// Removes every live engine, taking each key's gate in turn.
    pub async fn drain(self: &Arc<Self>) -> Vec<(String, LiveEngine)> {
        let ids: Vec<String> = locked(&self.slots).keys().cloned().collect();
        let mut drained = Vec::new();
        for id in ids {
            let guard = self.lock(&id).await;
            if let Some(engine) = guard.take() {
                drained.push((id, engine));
            }
        }
        drained
    }
}

/// Exclusive access to one rule id's slot.
pub struct KeyGuard {
    registry: Arc<EngineRegistry>,
    id: String,
    slot: Arc<Slot>,
    _gate: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_live(&self) -> bool {
        locked(&self.slot.engine).is_some()
    }

    /// True while the slot still holds the engine started as `instance`.
    pub fn holds(&self, instance: Uuid) -> bool {
        locked(&self.slot.engine)
            .as_ref()
            .is_some_and(|engine| engine.instance == instance)
    }

    pub fn insert(&self, engine: LiveEngine) {
        let previous = locked(&self.slot.engine).replace(engine);
        debug_assert!(previous.is_none(), "engine {} registered twice", self.id);
    }

    pub fn take(&self) -> Option<LiveEngine> {
        locked(&self.slot.engine).take()
    }

    /// Removes the entry only if it still belongs to `instance`.
    pub fn take_if(&self, instance: Uuid) -> Option<LiveEngine> {
        let mut engine = locked(&self.slot.engine);
        if engine.as_ref().is_some_and(|live| live.instance == instance) {
            engine.take()
        } else {
            None
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Forget empty slots nobody else is waiting on.
        let mut slots = locked(&self.registry.slots);
        if locked(&self.slot.engine).is_none() && Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.id);
        }
    }
}
