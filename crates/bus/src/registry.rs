//! Destination registry (§3 "Destination Registry", §4.E): destination →
//! ordered subscriptions, plus the pending-request → reply-to map used to
//! route RPC responses back to the subscriber that sent them.

use std::collections::HashMap;

/// Opaque per-connection identifier assigned by the reactor (§4.B) when a
/// socket is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub connection: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    pub connection: ConnectionId,
    pub reply_to: String,
}

#[derive(Default)]
pub struct DestinationRegistry {
    subscriptions: Vec<Subscription>,
    pending: HashMap<String, ReplyRoute>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription. `Err` if `id` is already in use on this
    /// connection (§4.E "Rejects duplicate id with an ERROR frame").
    pub fn subscribe(
        &mut self,
        connection: ConnectionId,
        id: String,
        destination: String,
    ) -> Result<(), String> {
        if self
            .subscriptions
            .iter()
            .any(|s| s.connection == connection && s.id == id)
        {
            return Err(id);
        }
        self.subscriptions.push(Subscription {
            id,
            destination,
            connection,
        });
        Ok(())
    }

    /// Missing id is logged and ignored by the caller, not treated as an
    /// error here (§4.E).
    pub fn unsubscribe(&mut self, connection: ConnectionId, id: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|s| !(s.connection == connection && s.id == id));
        self.subscriptions.len() != before
    }

    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.subscriptions.retain(|s| s.connection != connection);
        self.pending.retain(|_, route| route.connection != connection);
    }

    /// Hierarchical match: a message to `a.b.c` is delivered to subscribers
    /// of `a`, `a.b`, and `a.b.c` (§3).
    pub fn matches(&self, destination: &str) -> Vec<&Subscription> {
        let ancestors = ancestor_prefixes(destination);
        self.subscriptions
            .iter()
            .filter(|s| ancestors.iter().any(|a| a == &s.destination))
            .collect()
    }

    /// First subscription on `connection` whose destination is an ancestor
    /// of (or equal to) `reply_to`, used to pick the `subscription` header
    /// on the outgoing `MESSAGE` frame.
    pub fn reply_subscription(&self, connection: ConnectionId, reply_to: &str) -> Option<&str> {
        let ancestors = ancestor_prefixes(reply_to);
        self.subscriptions
            .iter()
            .find(|s| s.connection == connection && ancestors.iter().any(|a| a == &s.destination))
            .map(|s| s.id.as_str())
    }

    pub fn record_pending(&mut self, request_id: String, route: ReplyRoute) {
        self.pending.insert(request_id, route);
    }

    pub fn take_pending(&mut self, request_id: &str) -> Option<ReplyRoute> {
        self.pending.remove(request_id)
    }
}

/// `a.b.c` -> `["a", "a.b", "a.b.c"]`.
fn ancestor_prefixes(destination: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut acc = String::new();
    for segment in destination.split('.') {
        if !acc.is_empty() {
            acc.push('.');
        }
        acc.push_str(segment);
        prefixes.push(acc.clone());
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchical_match_delivers_to_all_ancestors() {
        let mut reg = DestinationRegistry::new();
        reg.subscribe(ConnectionId(1), "s1".into(), "a".into()).unwrap();
        reg.subscribe(ConnectionId(2), "s2".into(), "a.b".into()).unwrap();
        reg.subscribe(ConnectionId(3), "s3".into(), "a.b.c".into()).unwrap();
        reg.subscribe(ConnectionId(4), "s4".into(), "x".into()).unwrap();

        let matched = reg.matches("a.b.c");
        let ids: Vec<_> = matched.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"s1"));
        assert!(ids.contains(&"s2"));
        assert!(ids.contains(&"s3"));
        assert!(!ids.contains(&"s4"));
    }

    #[test]
    fn duplicate_subscription_id_on_same_connection_errors() {
        let mut reg = DestinationRegistry::new();
        reg.subscribe(ConnectionId(1), "s1".into(), "a".into()).unwrap();
        assert!(reg.subscribe(ConnectionId(1), "s1".into(), "b".into()).is_err());
    }

    #[test]
    fn unsubscribe_missing_id_reports_false_not_error() {
        let mut reg = DestinationRegistry::new();
        assert!(!reg.unsubscribe(ConnectionId(1), "nope"));
    }

    #[test]
    fn connection_teardown_drops_its_subscriptions_and_pending() {
        let mut reg = DestinationRegistry::new();
        reg.subscribe(ConnectionId(1), "s1".into(), "a".into()).unwrap();
        reg.record_pending(
            "req-1".into(),
            ReplyRoute {
                connection: ConnectionId(1),
                reply_to: "a".into(),
            },
        );
        reg.remove_connection(ConnectionId(1));
        assert!(reg.matches("a").is_empty());
        assert!(reg.take_pending("req-1").is_none());
    }
}
