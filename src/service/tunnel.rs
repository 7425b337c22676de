use crate::database::models::{AppSettings, ForwardSpec, ReverseSpec, Rule, RuleSpec, RuleStatus};
use crate::error::{TunnelError, TunnelResult};
use crate::events::StatusNotifier;
use crate::store::RuleStore;
use crate::tunnel::registry::EngineRegistry;
use crate::tunnel::{forward, reverse, EngineContext};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Entry point for everything the UI (or the daemon) can ask of the engines.
#[derive(Clone)]
pub struct TunnelService {
    ctx: EngineContext,
}

impl TunnelService {
    pub fn new(
        store: Arc<RuleStore>,
        notifier: Arc<dyn StatusNotifier>,
        settings: AppSettings,
    ) -> Self {
        Self::with_registry(store, Arc::new(EngineRegistry::new()), notifier, settings)
    }

    pub fn with_registry(
        store: Arc<RuleStore>,
        registry: Arc<EngineRegistry>,
        notifier: Arc<dyn StatusNotifier>,
        settings: AppSettings,
    ) -> Self {
        Self {
            ctx: EngineContext::new(store, registry, notifier, settings),
        }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.ctx.registry
    }

    pub fn settings(&self) -> &AppSettings {
        &self.ctx.settings
    }

    pub async fn start_forward(
        &self,
        remote_host: &str,
        remote_port: u16,
        local_port: u16,
    ) -> TunnelResult<String> {
        debug!(
            "Starting forward {}:{} on local port {}",
            remote_host, remote_port, local_port
        );
        let spec = ForwardSpec::new(remote_host, remote_port, local_port);
        let result = forward::start(&self.ctx, spec).await;
        if let Err(e) = &result {
            error!("Failed to start forward to {}:{}: {}", remote_host, remote_port, e);
        }
        result
    }

    pub async fn start_reverse_tunnel(
        &self,
        spec: ReverseSpec,
        id: Option<String>,
    ) -> TunnelResult<String> {
        debug!("Starting reverse tunnel via {}:{}", spec.ssh_host, spec.ssh_port);
        let target = spec.ssh_host.clone();
        let result = reverse::start(&self.ctx, spec, id).await;
        if let Err(e) = &result {
            error!("Failed to start reverse tunnel via {}: {}", target, e);
        }
        result
    }

    /// Starts a stored rule with its stored configuration and id.
    pub async fn start_rule(&self, rule: &Rule) -> TunnelResult<String> {
        match &rule.spec {
            RuleSpec::Forward(spec) => {
                let derived = spec.derive_id();
                if rule.id != derived {
                    // Starting under the derived id would orphan this record.
                    let message = format!(
                        "Stored id {} does not match its address fields ({}); save the rule again",
                        rule.id, derived
                    );
                    let guard = self.ctx.registry.lock(&rule.id).await;
                    self.ctx
                        .publish_status(&rule.id, RuleStatus::Error, Some(message.clone()))
                        .await;
                    drop(guard);
                    return Err(TunnelError::Config(message));
                }
                forward::start(&self.ctx, spec.clone()).await
            }
            RuleSpec::ReverseSsh(spec) => {
                reverse::start(&self.ctx, spec.clone(), Some(rule.id.clone())).await
            }
        }
    }

    /// Stores a rule without starting it. An existing record with the same
    /// id is refreshed rather than duplicated.
    pub async fn add_rule(&self, rule: Rule) -> TunnelResult<Rule> {
        rule.spec.validate().map_err(TunnelError::Config)?;
        let id = effective_id(&rule);
        let added = self.ctx.store.ensure(&id, rule.spec).await?;
        info!("Rule {} saved", id);
        self.publish_list().await;
        Ok(added)
    }

    pub async fn stop(&self, id: &str) -> TunnelResult<()> {
        debug!("Stopping rule {}", id);
        self.ctx.stop(id).await
    }

    pub async fn delete(&self, id: &str) -> TunnelResult<()> {
        debug!("Deleting rule {}", id);
        let guard = self.ctx.registry.lock(id).await;
        self.ctx.stop_locked(&guard).await;
        let rules = self.ctx.store.remove(id).await?;
        drop(guard);
        info!("Rule {} deleted", id);
        self.ctx.notifier.rule_list_changed(&rules);
        Ok(())
    }

    /// Replaces `old_id` with `new_rule`. A live engine for `old_id` is torn
    /// down first; the edited rule is left stopped.
    pub async fn edit(&self, old_id: &str, new_rule: Rule) -> TunnelResult<Rule> {
        new_rule.spec.validate().map_err(TunnelError::Config)?;
        let new_id = effective_id(&new_rule);

        // Both gates are held until the store is updated, always taken in id
        // order so two crossing renames cannot deadlock.
        let (guard, _renamed_guard) = if new_id == old_id {
            (self.ctx.registry.lock(old_id).await, None)
        } else if old_id < new_id.as_str() {
            let guard = self.ctx.registry.lock(old_id).await;
            let renamed = self.ctx.registry.lock(&new_id).await;
            (guard, Some(renamed))
        } else {
            let renamed = self.ctx.registry.lock(&new_id).await;
            let guard = self.ctx.registry.lock(old_id).await;
            (guard, Some(renamed))
        };

        let existing = self
            .ctx
            .store
            .find(old_id)
            .await
            .ok_or_else(|| TunnelError::NotFound(old_id.to_string()))?;
        if new_id != old_id && self.ctx.store.find(&new_id).await.is_some() {
            warn!("Refusing to rename {} to {}: id in use", old_id, new_id);
            return Err(TunnelError::IdCollision(new_id));
        }

        self.ctx.stop_locked(&guard).await;

        let edited = Rule {
            id: new_id,
            spec: new_rule.spec,
            status: RuleStatus::Stopped,
            error: None,
            created_at: existing.created_at,
        };
        let rules = self.ctx.store.replace(old_id, edited.clone()).await?;
        info!("Rule {} updated as {}", old_id, edited.id);
        self.ctx.notifier.rule_list_changed(&rules);
        Ok(edited)
    }

    pub async fn list_rules(&self) -> Vec<Rule> {
        self.ctx.store.get().await
    }

    /// Restarts every rule whose persisted status is `running`. Returns the
    /// ids that came up; failures end as `error` records.
    pub async fn replay(&self) -> Vec<String> {
        let rules = self.ctx.store.get().await;
        let pending: Vec<&Rule> = rules.iter().filter(|rule| rule.is_running()).collect();
        info!(
            "Replaying {} of {} stored rules",
            pending.len(),
            rules.len()
        );

        let mut started = Vec::new();
        for rule in pending {
            match self.start_rule(rule).await {
                Ok(id) => started.push(id),
                Err(e) => warn!("Replay of {} failed: {}", rule.id, e),
            }
        }
        started
    }

    /// Cancels every listener, session and connection, waiting at most
    /// `grace` per engine. Persisted statuses are left alone so the next
    /// start can replay them.
    pub async fn shutdown(&self, grace: Duration) {
        let engines = self.ctx.registry.drain().await;
        if engines.is_empty() {
            return;
        }
        info!("Shutting down {} live engines", engines.len());

        let mut pending = JoinSet::new();
        for (id, engine) in engines {
            pending.spawn(async move {
                engine.shutdown(grace).await;
                id
            });
        }
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(id) => debug!("Engine {} shut down", id),
                Err(e) => warn!("Engine shutdown task failed: {}", e),
            }
        }
    }

    async fn publish_list(&self) {
        let rules = self.ctx.store.get().await;
        self.ctx.notifier.rule_list_changed(&rules);
    }
}

fn effective_id(rule: &Rule) -> String {
    match &rule.spec {
        RuleSpec::Forward(spec) => spec.derive_id(),
        RuleSpec::ReverseSsh(spec) => {
            let id = rule.id.trim();
            if id.is_empty() {
                spec.derive_id()
            } else {
                id.to_string()
            }
        }
    }
}
