//! Agent presence aggregation from the account room's membership stream.
//!
//! The realtime feed delivers a wholesale presence state on every sync; the
//! tracker extracts the first metadata entry per connected member and keeps
//! only entries backed by a dashboard user (agent sessions). Non-agent
//! connections (other widget instances) carry no `user_id` and are dropped.

use serde_json::Value;

/// One currently-connected agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEntry {
    pub user_id: i64,
    /// Raw metadata from the presence payload (name, profile photo, etc.).
    pub metadata: Value,
}

/// Recomputes the available-agent list wholesale on every presence sync.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    agents: Vec<AgentEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the agent list from a raw presence state payload
    /// (`{key: {"metas": [info, ...]}, ...}`). Unparseable members are skipped.
    pub fn sync(&mut self, state: &Value) -> &[AgentEntry] {
        let members = match state.as_object() {
            Some(map) => map,
            None => {
                self.agents.clear();
                return &self.agents;
            }
        };
        self.agents = members
            .values()
            .filter_map(|member| member.get("metas").and_then(|m| m.get(0)))
            .filter_map(|info| {
                let user_id = info.get("user_id").and_then(Value::as_i64)?;
                Some(AgentEntry {
                    user_id,
                    metadata: info.clone(),
                })
            })
            .collect();
        log::debug!("presence sync: {} agent(s) available", self.agents.len());
        &self.agents
    }

    pub fn agents(&self) -> &[AgentEntry] {
        &self.agents
    }

    /// Derived availability; not stored separately.
    pub fn has_available_agents(&self) -> bool {
        !self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sync_keeps_only_agent_sessions() {
        let mut tracker = PresenceTracker::new();
        let state = json!({
            "phx-a": {"metas": [{"user_id": 7, "name": "Alex"}]},
            "phx-b": {"metas": [{"customer_id": "cust-1"}]},
            "phx-c": {"metas": [{"user_id": 9}, {"user_id": 9, "stale": true}]},
        });
        let agents = tracker.sync(&state);
        let mut ids: Vec<i64> = agents.iter().map(|a| a.user_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![7, 9]);
        assert!(tracker.has_available_agents());
    }

    #[test]
    fn sync_replaces_wholesale() {
        let mut tracker = PresenceTracker::new();
        tracker.sync(&json!({"a": {"metas": [{"user_id": 1}]}}));
        tracker.sync(&json!({}));
        assert!(!tracker.has_available_agents());
        assert!(tracker.agents().is_empty());
    }

    #[test]
    fn malformed_state_clears_the_list() {
        let mut tracker = PresenceTracker::new();
        tracker.sync(&json!({"a": {"metas": [{"user_id": 1}]}}));
        tracker.sync(&json!("nope"));
        assert!(tracker.agents().is_empty());
    }
}
