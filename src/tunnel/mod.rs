pub mod bridge;
pub mod forward;
pub mod model;
pub mod registry;
pub mod reverse;
pub mod ssh;

use crate::database::models::{AppSettings, RuleStatus};
use crate::error::{TunnelError, TunnelResult};
use crate::events::StatusNotifier;
use crate::store::RuleStore;
use log::{debug, info, warn};
use registry::{EngineRegistry, KeyGuard};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an engine needs to run a rule: persistence, the live table,
/// the observer and the active settings.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<RuleStore>,
    pub registry: Arc<EngineRegistry>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub settings: Arc<AppSettings>,
}

impl EngineContext {
    pub fn new(
        store: Arc<RuleStore>,
        registry: Arc<EngineRegistry>,
        notifier: Arc<dyn StatusNotifier>,
        settings: AppSettings,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            settings: Arc::new(settings),
        }
    }

    /// Persists a status transition, then tells observers about it and about
    /// the refreshed rule list.
    pub async fn publish_status(&self, id: &str, status: RuleStatus, error: Option<String>) {
        match &error {
            Some(message) => warn!("Rule {} is now {}: {}", id, status, message),
            None => info!("Rule {} is now {}", id, status),
        }

        let persisted = self.store.set_status(id, status, error.clone()).await;
        self.notifier
            .rule_status_changed(id, status, error.as_deref());
        match persisted {
            Ok(rules) => self.notifier.rule_list_changed(&rules),
            Err(e) => warn!("Failed to persist status of rule {}: {}", id, e),
        }
    }

    pub fn connection_failed(&self, id: &str, error: &TunnelError) {
        warn!("Connection for rule {} failed: {}", id, error);
        self.notifier.connection_failed(id, &error.to_string());
    }

    /// Tears down the live engine for `id`, if any, and publishes `stopped`.
    pub async fn stop(&self, id: &str) -> TunnelResult<()> {
        let guard = self.registry.lock(id).await;
        self.stop_locked(&guard).await;
        Ok(())
    }

    /// Same as [`stop`](Self::stop) for a caller that already holds the gate
    /// and keeps it for follow-up store changes. Returns whether an engine
    /// was running.
    pub async fn stop_locked(&self, guard: &KeyGuard) -> bool {
        let id = guard.id();
        let Some(engine) = guard.take() else {
            debug!("Rule {} has no live engine, nothing to stop", id);
            return false;
        };

        debug!("Stopping {:?} for rule {}", engine.kind, id);
        engine.shutdown(self.settings.shutdown_grace()).await;
        self.publish_status(id, RuleStatus::Stopped, None).await;
        true
    }

    /// Called by an engine task that ended on its own. Removes the entry only
    /// if it still belongs to `instance`; a concurrent stop owns the outcome
    /// otherwise.
    pub(crate) async fn retire(
        &self,
        id: &str,
        instance: Uuid,
        cancel: &CancellationToken,
        status: RuleStatus,
        error: Option<String>,
    ) {
        let guard = tokio::select! {
            guard = self.registry.lock(id) => guard,
            _ = cancel.cancelled() => return,
        };
        let Some(engine) = guard.take_if(instance) else {
            return;
        };

        engine.retire(self.settings.shutdown_grace()).await;
        self.publish_status(id, status, error).await;
    }
}

/// Opens the outbound half of a bridged connection within the connect timeout.
pub(crate) async fn dial(ctx: &EngineContext, target: &str) -> TunnelResult<TcpStream> {
    let limit = ctx.settings.connect_timeout();
    let stream = tokio::time::timeout(limit, TcpStream::connect(target))
        .await
        .map_err(|_| {
            TunnelError::Connection(format!("Timed out connecting to {target} after {limit:?}"))
        })?
        .map_err(|e| TunnelError::Connection(format!("Failed to connect to {target}: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY on {}: {}", target, e);
    }
    Ok(stream)
}
