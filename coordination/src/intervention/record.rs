//! Intervention records: one per open condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::signals::{ConditionKey, Scope, SignalKind};
use crate::contracts::Escalatable;
use crate::ids::{AgentId, RecordId};
use crate::state::{EntityKind, Persist};

/// How bad a condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Logged only.
    Warning,
    /// The offending agent is throttled.
    Degraded,
    /// The offending agent is suspended.
    Critical,
    /// The whole system is halted.
    Emergency,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Action taken for a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InterventionAction {
    /// Logged, nothing else.
    LogOnly,
    /// Outgoing traffic of the agent demoted one tier.
    Throttle { agent: AgentId },
    /// Agent moved to `Suspended`.
    Suspend { agent: AgentId },
    /// System halt switch raised.
    SystemHalt,
}

impl InterventionAction {
    /// Actions a condition of `severity` on `scope` calls for.
    ///
    /// Cumulative: an escalated record keeps the actions of lower tiers.
    /// System-scope conditions have no agent to throttle or suspend.
    pub fn required(severity: Severity, scope: &Scope) -> Vec<InterventionAction> {
        let mut actions = vec![Self::LogOnly];
        if let Some(agent) = scope.agent() {
            if severity >= Severity::Degraded {
                actions.push(Self::Throttle {
                    agent: agent.clone(),
                });
            }
            if severity >= Severity::Critical {
                actions.push(Self::Suspend {
                    agent: agent.clone(),
                });
            }
        }
        if severity >= Severity::Emergency {
            actions.push(Self::SystemHalt);
        }
        actions
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LogOnly => "log_only",
            Self::Throttle { .. } => "throttle",
            Self::Suspend { .. } => "suspend",
            Self::SystemHalt => "system_halt",
        }
    }
}

impl std::fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Throttle { agent } | Self::Suspend { agent } => {
                write!(f, "{}({})", self.name(), agent)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Condition active; actions in effect.
    Open,
    /// Condition cleared; actions undone.
    Closed,
    /// Cancelled by an operator; actions undone.
    Cancelled,
}

impl std::fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One severity change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeverityChange {
    /// `None` when the record was opened.
    pub from: Option<Severity>,
    pub to: Severity,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Tracked condition and the actions taken for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub id: RecordId,
    pub signal: SignalKind,
    pub scope: Scope,
    pub severity: Severity,
    /// Human-readable condition.
    pub condition: String,
    /// Latest observed value.
    pub observed_value: f64,
    /// Actions currently in effect.
    pub actions: Vec<InterventionAction>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: ResolutionStatus,
    /// Severity history, oldest first.
    pub history: Vec<SeverityChange>,
    /// Pending operator cancellation, applied at the next step.
    pub cancel_requested: Option<String>,
}

impl InterventionRecord {
    /// Open a record for a classified sample.
    pub fn open(
        id: RecordId,
        signal: SignalKind,
        scope: Scope,
        severity: Severity,
        observed_value: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let condition = format!("{} on {} at {}", signal, scope, observed_value);
        Self {
            id,
            signal,
            scope,
            severity,
            history: vec![SeverityChange {
                from: None,
                to: severity,
                at: now,
                reason: condition.clone(),
            }],
            condition,
            observed_value,
            actions: Vec::new(),
            opened_at: now,
            updated_at: now,
            closed_at: None,
            status: ResolutionStatus::Open,
            cancel_requested: None,
        }
    }

    /// Condition this record tracks.
    pub fn key(&self) -> ConditionKey {
        (self.signal, self.scope.clone())
    }

    /// Whether the record is still open.
    pub fn is_open(&self) -> bool {
        self.status == ResolutionStatus::Open
    }

    /// Record a new observation of the same condition.
    pub fn observe(&mut self, value: f64, now: DateTime<Utc>) {
        self.observed_value = value;
        self.condition = format!("{} on {} at {}", self.signal, self.scope, value);
        self.updated_at = now;
    }

    /// Actions required now but not yet in effect.
    pub fn missing_actions(&self) -> Vec<InterventionAction> {
        InterventionAction::required(self.severity, &self.scope)
            .into_iter()
            .filter(|a| !self.actions.contains(a))
            .collect()
    }

    /// Close the record.
    pub fn close(&mut self, status: ResolutionStatus, now: DateTime<Utc>) {
        self.status = status;
        self.closed_at = Some(now);
        self.updated_at = now;
        self.actions.clear();
    }
}

impl Escalatable for InterventionRecord {
    fn severity(&self) -> Severity {
        self.severity
    }

    fn escalate_to(&mut self, to: Severity, reason: &str, now: DateTime<Utc>) -> bool {
        if !self.is_open() || to <= self.severity {
            return false;
        }
        self.history.push(SeverityChange {
            from: Some(self.severity),
            to,
            at: now,
            reason: reason.to_string(),
        });
        self.severity = to;
        self.updated_at = now;
        true
    }
}

impl Persist for InterventionRecord {
    const KIND: EntityKind = EntityKind::Intervention;

    fn storage_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(severity: Severity) -> InterventionRecord {
        InterventionRecord::open(
            "intv-1".to_string(),
            SignalKind::AgentBacklog,
            Scope::Agent(AgentId::from("w1")),
            severity,
            30.0,
            Utc::now(),
        )
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Warning < Severity::Degraded);
        assert!(Severity::Critical < Severity::Emergency);
    }

    #[test]
    fn test_escalate_only_upward() {
        let mut r = record(Severity::Degraded);
        assert!(!r.escalate_to(Severity::Warning, "lower", Utc::now()));
        assert!(!r.escalate_to(Severity::Degraded, "same", Utc::now()));
        assert!(r.escalate_to(Severity::Critical, "worse", Utc::now()));
        assert_eq!(r.severity(), Severity::Critical);
        assert_eq!(r.history.len(), 2);
        assert_eq!(r.history[1].from, Some(Severity::Degraded));
    }

    #[test]
    fn test_closed_record_does_not_escalate() {
        let mut r = record(Severity::Warning);
        r.close(ResolutionStatus::Closed, Utc::now());
        assert!(!r.escalate_to(Severity::Emergency, "late", Utc::now()));
        assert_eq!(r.severity, Severity::Warning);
    }

    #[test]
    fn test_required_actions_are_cumulative() {
        let agent = Scope::Agent(AgentId::from("w1"));
        assert_eq!(
            InterventionAction::required(Severity::Warning, &agent),
            vec![InterventionAction::LogOnly]
        );
        let critical = InterventionAction::required(Severity::Critical, &agent);
        assert_eq!(critical.len(), 3);
        assert!(critical.contains(&InterventionAction::Suspend {
            agent: AgentId::from("w1")
        }));
        assert_eq!(
            InterventionAction::required(Severity::Emergency, &Scope::System),
            vec![InterventionAction::LogOnly, InterventionAction::SystemHalt]
        );
    }

    #[test]
    fn test_missing_actions() {
        let mut r = record(Severity::Degraded);
        assert_eq!(r.missing_actions().len(), 2);
        r.actions = r.missing_actions();
        assert!(r.missing_actions().is_empty());
        r.escalate_to(Severity::Critical, "worse", Utc::now());
        assert_eq!(
            r.missing_actions(),
            vec![InterventionAction::Suspend {
                agent: AgentId::from("w1")
            }]
        );
    }

    #[test]
    fn test_action_display() {
        let a = InterventionAction::Throttle {
            agent: AgentId::from("w1"),
        };
        assert_eq!(a.to_string(), "throttle(w1)");
        assert_eq!(InterventionAction::SystemHalt.to_string(), "system_halt");
    }
}
