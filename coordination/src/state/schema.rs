//! Storage layout for persisted coordination state.
//!
//! Each entity kind maps to its own column family (or directory for the
//! file store) so backends can keep them logically separate.

use serde::{Deserialize, Serialize};

/// Column family for agent records
pub const CF_AGENTS: &str = "agents";

/// Column family for archived messages
pub const CF_MESSAGES: &str = "messages";

/// Column family for debate sessions
pub const CF_DEBATES: &str = "debates";

/// Column family for intervention records
pub const CF_INTERVENTIONS: &str = "interventions";

/// Column family for coordination events
pub const CF_EVENTS: &str = "events";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_AGENTS, CF_MESSAGES, CF_DEBATES, CF_INTERVENTIONS, CF_EVENTS];

/// Kind of persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Agent record.
    Agent,
    /// Terminal message (delivered or dead-lettered).
    Message,
    /// Debate session.
    Debate,
    /// Intervention record.
    Intervention,
    /// Coordination event.
    Event,
}

impl EntityKind {
    /// Column family backing this kind.
    pub fn column_family(self) -> &'static str {
        match self {
            Self::Agent => CF_AGENTS,
            Self::Message => CF_MESSAGES,
            Self::Debate => CF_DEBATES,
            Self::Intervention => CF_INTERVENTIONS,
            Self::Event => CF_EVENTS,
        }
    }

    /// Prefix of keys stored for this kind.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::Agent => "agent:",
            Self::Message => "msg:",
            Self::Debate => "debate:",
            Self::Intervention => "intv:",
            Self::Event => "",
        }
    }

    /// Storage key for an entity id.
    pub fn key(self, id: &str) -> String {
        match self {
            Self::Agent => keys::agent(id),
            Self::Message => keys::message(id),
            Self::Debate => keys::debate(id),
            Self::Intervention => keys::intervention(id),
            Self::Event => id.to_string(),
        }
    }

    /// Entity id recovered from a storage key.
    pub fn id_from_key(self, key: &str) -> Option<String> {
        key.strip_prefix(self.key_prefix()).map(str::to_string)
    }

    /// Every kind, in column family order.
    pub fn all() -> [EntityKind; 5] {
        [
            Self::Agent,
            Self::Message,
            Self::Debate,
            Self::Intervention,
            Self::Event,
        ]
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column_family())
    }
}

/// Key prefixes for compound keys
pub mod keys {
    /// Create an agent key
    pub fn agent(agent_id: &str) -> String {
        format!("agent:{}", agent_id)
    }

    /// Create a message key
    pub fn message(message_id: &str) -> String {
        format!("msg:{}", message_id)
    }

    /// Create a debate key
    pub fn debate(session_id: &str) -> String {
        format!("debate:{}", session_id)
    }

    /// Create an intervention key
    pub fn intervention(record_id: &str) -> String {
        format!("intv:{}", record_id)
    }

    /// Create an event key (timestamp-ordered)
    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        format!("{:020}:{}", timestamp_nanos, event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_a_column_family() {
        for kind in EntityKind::all() {
            assert!(ALL_CFS.contains(&kind.column_family()));
        }
        assert_eq!(ALL_CFS.len(), EntityKind::all().len());
    }

    #[test]
    fn test_key_round_trip() {
        let key = EntityKind::Debate.key("debate-1");
        assert_eq!(key, "debate:debate-1");
        assert_eq!(
            EntityKind::Debate.id_from_key(&key).as_deref(),
            Some("debate-1")
        );
        assert!(EntityKind::Agent.id_from_key(&key).is_none());
    }

    #[test]
    fn test_event_keys_sort_by_time() {
        let earlier = keys::event(5, "b");
        let later = keys::event(40, "a");
        assert!(earlier < later);
    }
}
