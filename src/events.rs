//! Rule event emission.
//!
//! The engines only need to publish status transitions, full rule snapshots
//! and connection-scoped failures; whatever sits behind [`StatusNotifier`]
//! decides how those reach a UI.

use crate::database::models::{Rule, RuleStatus};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub trait StatusNotifier: Send + Sync {
    fn rule_status_changed(&self, id: &str, status: RuleStatus, error: Option<&str>);

    fn rule_list_changed(&self, rules: &[Rule]);

    /// A single relayed connection failed; the rule itself keeps its status.
    fn connection_failed(&self, _id: &str, _error: &str) {}
}

/// Default observer for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn rule_status_changed(&self, _id: &str, _status: RuleStatus, _error: Option<&str>) {}

    fn rule_list_changed(&self, _rules: &[Rule]) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleEvent {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        id: String,
        status: RuleStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ListChanged { rules: Vec<Rule> },
    #[serde(rename_all = "camelCase")]
    ConnectionFailed { id: String, error: String },
}

/// Fans rule events out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: RuleEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No subscriber for rule event: {:?}", e.0);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusNotifier for EventBus {
    fn rule_status_changed(&self, id: &str, status: RuleStatus, error: Option<&str>) {
        self.emit(RuleEvent::StatusChanged {
            id: id.to_string(),
            status,
            error: error.map(str::to_string),
        });
    }

    fn rule_list_changed(&self, rules: &[Rule]) {
        self.emit(RuleEvent::ListChanged {
            rules: rules.to_vec(),
        });
    }

    fn connection_failed(&self, id: &str, error: &str) {
        self.emit(RuleEvent::ConnectionFailed {
            id: id.to_string(),
            error: error.to_string(),
        });
    }
}

/// Tray-style digest of a rule list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub active_count: usize,
    pub error_count: usize,
}

impl StatusSummary {
    pub fn from_rules(rules: &[Rule]) -> Self {
        rules.iter().fold(Self::default(), |mut summary, rule| {
            match rule.status {
                RuleStatus::Running => summary.active_count += 1,
                RuleStatus::Error => summary.error_count += 1,
                RuleStatus::Stopped => {}
            }
            summary
        })
    }
}

impl std::fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.active_count, self.error_count) {
            (0, 0) => write!(f, "No active rules"),
            (active, 0) => write!(f, "{} active", active),
            (0, failed) => write!(f, "{} failed", failed),
            (active, failed) => write!(f, "{} active, {} failed", active, failed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ForwardSpec, RuleSpec};

    #[test]
    fn noop_notifier_accepts_everything() {
        let notifier = NoopNotifier;
        notifier.rule_status_changed("fwd-1", RuleStatus::Running, None);
        notifier.rule_list_changed(&[]);
        notifier.connection_failed("fwd-1", "refused");
    }

    #[tokio::test]
    async fn event_bus_delivers_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.rule_status_changed("a", RuleStatus::Error, Some("Address in use"));
        bus.connection_failed("a", "timed out");

        assert_eq!(
            rx.recv().await.unwrap(),
            RuleEvent::StatusChanged {
                id: "a".into(),
                status: RuleStatus::Error,
                error: Some("Address in use".into()),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            RuleEvent::ConnectionFailed {
                id: "a".into(),
                error: "timed out".into(),
            }
        );
    }

    #[test]
    fn event_serialization() {
        let event = RuleEvent::StatusChanged {
            id: "h:80->8080".into(),
            status: RuleStatus::Running,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"statusChanged","id":"h:80->8080","status":"running"}"#
        );
    }

    #[test]
    fn summary_counts_running_and_failed() {
        let mut rules: Vec<Rule> = (1..=4)
            .map(|port| {
                let spec = ForwardSpec::new("h", 80, port);
                Rule::new(spec.derive_id(), RuleSpec::Forward(spec))
            })
            .collect();
        rules[0].status = RuleStatus::Running;
        rules[1].status = RuleStatus::Running;
        rules[2].status = RuleStatus::Error;

        let summary = StatusSummary::from_rules(&rules);
        assert_eq!(
            summary,
            StatusSummary {
                active_count: 2,
                error_count: 1
            }
        );
        assert_eq!(summary.to_string(), "2 active, 1 failed");
        assert_eq!(StatusSummary::default().to_string(), "No active rules");
    }
}
