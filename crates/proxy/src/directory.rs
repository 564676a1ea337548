//! Agent directory.
//!
//! An immutable map from agent id to its location, built once from the
//! configured registry. Reads are lock-free: the directory lives behind
//! an `Arc` and is rebuilt only by restarting the proxy.

use std::collections::{HashMap, HashSet};

use courier_common::{AgentId, GroupId, ProxyId};
use courier_config::CourierConfig;

/// One directory entry.
#[derive(Debug, Clone)]
pub struct AgentEntry {
    pub id: AgentId,
    pub group: GroupId,
    /// `host:port` of the agent process; `None` when the agent is remote.
    pub endpoint: Option<String>,
    pub hosting_proxy: ProxyId,
    pub capabilities: Vec<String>,
    /// Where the agent card is fetched from; defaults to the endpoint.
    pub card_url: Option<String>,
}

impl AgentEntry {
    /// URL of the agent's card document, when one can be derived.
    pub fn card_source(&self) -> Option<String> {
        if let Some(url) = &self.card_url {
            return Some(url.clone());
        }
        self.endpoint
            .as_ref()
            .map(|endpoint| format!("http://{endpoint}/.well-known/agent.json"))
    }
}

/// Immutable agent-id → entry map with the local hosted set.
#[derive(Debug)]
pub struct AgentDirectory {
    proxy_id: ProxyId,
    entries: HashMap<AgentId, AgentEntry>,
    hosted: HashSet<AgentId>,
}

impl AgentDirectory {
    pub fn from_config(cfg: &CourierConfig) -> Self {
        let proxy_id = cfg.proxy_id();
        let mut entries = HashMap::new();
        let mut hosted = HashSet::new();

        for agent in &cfg.agents {
            let id = agent.agent_id();
            if agent.proxy_id() == proxy_id {
                hosted.insert(id.clone());
            }
            entries.insert(
                id.clone(),
                AgentEntry {
                    id,
                    group: agent.group_id(),
                    endpoint: agent.endpoint.clone(),
                    hosting_proxy: agent.proxy_id(),
                    capabilities: agent.capabilities.clone(),
                    card_url: agent.card_url.clone(),
                },
            );
        }

        Self {
            proxy_id,
            entries,
            hosted,
        }
    }

    pub fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    pub fn get(&self, agent: &AgentId) -> Option<&AgentEntry> {
        self.entries.get(agent)
    }

    /// True iff this proxy hosts the agent.
    pub fn is_local(&self, agent: &AgentId) -> bool {
        self.hosted.contains(agent)
            && self
                .entries
                .get(agent)
                .map(|e| e.hosting_proxy == self.proxy_id)
                .unwrap_or(false)
    }

    pub fn group_of(&self, agent: &AgentId) -> Option<&GroupId> {
        self.entries.get(agent).map(|e| &e.group)
    }

    /// Groups with at least one locally-hosted agent, deduplicated.
    pub fn hosted_groups(&self) -> Vec<GroupId> {
        let mut groups = Vec::new();
        for agent in &self.hosted {
            if let Some(entry) = self.entries.get(agent) {
                if !groups.contains(&entry.group) {
                    groups.push(entry.group.clone());
                }
            }
        }
        groups
    }

    /// Entries for every locally-hosted agent.
    pub fn hosted_entries(&self) -> Vec<&AgentEntry> {
        self.hosted
            .iter()
            .filter_map(|id| self.entries.get(id))
            .collect()
    }

    /// Every group in the registry, hosted here or not.
    pub fn all_groups(&self) -> Vec<GroupId> {
        let mut groups = Vec::new();
        for entry in self.entries.values() {
            if !groups.contains(&entry.group) {
                groups.push(entry.group.clone());
            }
        }
        groups
    }
}
