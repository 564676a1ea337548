//! Topic naming and topology defaults.
//!
//! Every agent group owns a topic triple: `a2a.{group}.requests`,
//! `a2a.{group}.responses` and `a2a.{group}.deadletter`. Subscription
//! names follow `{proxy_id}.{group}.{role}` with role `req` or `resp`.

use std::fmt;
use std::time::Duration;

use courier_common::{GroupId, ProxyId};

/// Which member of a group's topic triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Requests,
    Responses,
    Deadletter,
}

impl TopicKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Requests => "requests",
            TopicKind::Responses => "responses",
            TopicKind::Deadletter => "deadletter",
        }
    }
}

/// Fully-qualified topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    group: GroupId,
    kind: TopicKind,
}

impl Topic {
    pub fn new(group: GroupId, kind: TopicKind) -> Self {
        Self { group, kind }
    }

    pub fn requests(group: &GroupId) -> Self {
        Self::new(group.clone(), TopicKind::Requests)
    }

    pub fn responses(group: &GroupId) -> Self {
        Self::new(group.clone(), TopicKind::Responses)
    }

    pub fn deadletter(group: &GroupId) -> Self {
        Self::new(group.clone(), TopicKind::Deadletter)
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    /// The deadletter topic of the same group.
    pub fn deadletter_peer(&self) -> Topic {
        Self::deadletter(&self.group)
    }

    /// Canonical dotted name, e.g. `a2a.blog-agents.requests`.
    pub fn name(&self) -> String {
        format!("a2a.{}.{}", self.group, self.kind.as_str())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Subscription role within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRole {
    Requests,
    Responses,
}

impl SubscriptionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionRole::Requests => "req",
            SubscriptionRole::Responses => "resp",
        }
    }
}

/// Durable subscription name: `{proxy_id}.{group}.{role}`.
pub fn subscription_name(proxy: &ProxyId, group: &GroupId, role: SubscriptionRole) -> String {
    format!("{}.{}.{}", proxy, group, role.as_str())
}

/// Topic properties applied at creation time. Existing topics with
/// divergent properties are left untouched (a warning is surfaced).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Maximum topic size in megabytes.
    pub max_size_mb: u64,
    /// Per-message TTL.
    pub message_ttl: Duration,
    /// Duplicate-detection window on `MessageId`.
    pub duplicate_window: Duration,
    /// Whether the topic is partitioned.
    pub partitioning: bool,
    /// Whether session ordering is supported.
    pub ordering: bool,
}

impl Default for TopicSpec {
    fn default() -> Self {
        Self {
            max_size_mb: 1024,
            message_ttl: Duration::from_secs(60 * 60),
            duplicate_window: Duration::from_secs(10 * 60),
            partitioning: true,
            ordering: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        let group = GroupId::new("blog-agents");
        assert_eq!(Topic::requests(&group).name(), "a2a.blog-agents.requests");
        assert_eq!(Topic::responses(&group).name(), "a2a.blog-agents.responses");
        assert_eq!(
            Topic::deadletter(&group).name(),
            "a2a.blog-agents.deadletter"
        );
    }

    #[test]
    fn test_deadletter_peer() {
        let group = GroupId::new("g");
        assert_eq!(
            Topic::requests(&group).deadletter_peer(),
            Topic::deadletter(&group)
        );
    }

    #[test]
    fn test_subscription_names() {
        let proxy = ProxyId::new("p1");
        let group = GroupId::new("blog-agents");
        assert_eq!(
            subscription_name(&proxy, &group, SubscriptionRole::Requests),
            "p1.blog-agents.req"
        );
        assert_eq!(
            subscription_name(&proxy, &group, SubscriptionRole::Responses),
            "p1.blog-agents.resp"
        );
    }
}
