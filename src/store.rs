use crate::database::models::{Rule, RuleSpec, RuleStatus};
use crate::error::{TunnelError, TunnelResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Whole-collection persistence for the rule list.
#[async_trait]
pub trait RuleBackend: Send + Sync {
    async fn load(&self) -> Result<Vec<Rule>>;
    async fn save(&self, rules: &[Rule]) -> Result<()>;
}

/// In-process backend. `fail_reads` makes every `load` error out.
#[derive(Default)]
pub struct MemoryBackend {
    rules: StdMutex<Vec<Rule>>,
    fail_reads: AtomicBool,
}

impl MemoryBackend {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: StdMutex::new(rules),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn rules(&self) -> std::sync::MutexGuard<'_, Vec<Rule>> {
        self.rules.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RuleBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Rule>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("rule backend is unreadable"));
        }
        Ok(self.rules().clone())
    }

    async fn save(&self, rules: &[Rule]) -> Result<()> {
        *self.rules() = rules.to_vec();
        Ok(())
    }
}

/// Serializes every read-modify-write of the rule collection.
///
/// Reads fail closed: a backend error yields the last snapshot that was read
/// or written successfully. Writes fail instead, so an unreadable backend is
/// never overwritten with stale rules.
pub struct RuleStore {
    backend: Arc<dyn RuleBackend>,
    snapshot: Mutex<Vec<Rule>>,
}

impl RuleStore {
    pub fn new(backend: Arc<dyn RuleBackend>) -> Self {
        Self {
            backend,
            snapshot: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::default()))
    }

    pub async fn get(&self) -> Vec<Rule> {
        let mut snapshot = self.snapshot.lock().await;
        Self::refresh(self.backend.as_ref(), &mut snapshot).await;
        snapshot.clone()
    }

    pub async fn find(&self, id: &str) -> Option<Rule> {
        self.get().await.into_iter().find(|rule| rule.id == id)
    }

    pub async fn upsert(&self, rule: Rule) -> TunnelResult<Vec<Rule>> {
        self.modify(move |rules| {
            match rules.iter_mut().find(|existing| existing.id == rule.id) {
                Some(existing) => *existing = rule,
                None => rules.push(rule),
            }
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> TunnelResult<Vec<Rule>> {
        self.modify(|rules| {
            let before = rules.len();
            rules.retain(|rule| rule.id != id);
            if rules.len() == before {
                return Err(TunnelError::NotFound(id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Inserts a `stopped` record for `id`, or refreshes the addressing of the
    /// existing one while keeping its status, error and creation time.
    pub async fn ensure(&self, id: &str, spec: RuleSpec) -> TunnelResult<Rule> {
        let mut ensured = None;
        self.modify(|rules| {
            let rule = match rules.iter_mut().find(|rule| rule.id == id) {
                Some(existing) => {
                    existing.spec = spec;
                    existing.clone()
                }
                None => {
                    let rule = Rule::new(id, spec);
                    rules.push(rule.clone());
                    rule
                }
            };
            ensured = Some(rule);
            Ok(())
        })
        .await?;
        ensured.ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: RuleStatus,
        error: Option<String>,
    ) -> TunnelResult<Vec<Rule>> {
        self.modify(|rules| {
            let rule = rules
                .iter_mut()
                .find(|rule| rule.id == id)
                .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
            rule.status = status;
            rule.error = error;
            Ok(())
        })
        .await
    }

    /// Swaps the record `old_id` for `rule`, keeping its position.
    pub async fn replace(&self, old_id: &str, rule: Rule) -> TunnelResult<Vec<Rule>> {
        self.modify(|rules| {
            if rule.id != old_id && rules.iter().any(|existing| existing.id == rule.id) {
                return Err(TunnelError::IdCollision(rule.id.clone()));
            }
            let slot = rules
                .iter_mut()
                .find(|existing| existing.id == old_id)
                .ok_or_else(|| TunnelError::NotFound(old_id.to_string()))?;
            *slot = rule;
            Ok(())
        })
        .await
    }

    async fn modify<F>(&self, apply: F) -> TunnelResult<Vec<Rule>>
    where
        F: FnOnce(&mut Vec<Rule>) -> TunnelResult<()>,
    {
        let mut snapshot = self.snapshot.lock().await;
        // Never write over a collection we could not read back.
        *snapshot = self
            .backend
            .load()
            .await
            .map_err(|e| TunnelError::Store(e.context("Failed to read rules before writing")))?;

        let mut rules = snapshot.clone();
        apply(&mut rules)?;

        self.backend
            .save(&rules)
            .await
            .map_err(TunnelError::Store)?;
        *snapshot = rules;
        Ok(snapshot.clone())
    }

    async fn refresh(backend: &dyn RuleBackend, snapshot: &mut Vec<Rule>) {
        match backend.load().await {
            Ok(rules) => *snapshot = rules,
            Err(e) => warn!(
                "Failed to read rules, using last known {} rules: {:#}",
                snapshot.len(),
                e
            ),
        }
        debug!("Rule store holds {} rules", snapshot.len());
    }
}
