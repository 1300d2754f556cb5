//! Client Registry: tracks connected, authenticated clients and fans
//! events out to them by subscription pattern.
//!
//! Grounded on `gateway::broadcast::broadcast`'s scope-guarded iteration
//! over connected clients; here the guard is a subscription pattern
//! (`"job:*"`, `"*"`, or an exact event name) instead of an RBAC scope.

use std::collections::HashMap;
use std::sync::RwLock;

use relay_protocol::ServerFrame;
use tokio::sync::mpsc;

pub struct ConnectedClient {
    pub session_token: String,
    pub client_id: Option<String>,
    pub client_type: Option<String>,
    pub subscriptions: Vec<String>,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ConnectedClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        session_token: String,
        client_id: Option<String>,
        client_type: Option<String>,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let client = ConnectedClient { session_token: session_token.clone(), client_id, client_type, subscriptions: Vec::new(), sender };
        self.clients.write().unwrap().insert(session_token, client);
    }

    pub fn remove(&self, session_token: &str) {
        self.clients.write().unwrap().remove(session_token);
    }

    pub fn size(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Union `patterns` into the session's existing subscription set.
    /// Subscribing never removes a previously matched pattern, so a
    /// client that subscribes incrementally never loses earlier events.
    pub fn add_subscriptions(&self, session_token: &str, patterns: Vec<String>) {
        if let Some(client) = self.clients.write().unwrap().get_mut(session_token) {
            for pattern in patterns {
                if !client.subscriptions.contains(&pattern) {
                    client.subscriptions.push(pattern);
                }
            }
        }
    }

    /// Deliver `frame` to one specific session, if still connected.
    pub fn send_to(&self, session_token: &str, frame: ServerFrame) -> bool {
        match self.clients.read().unwrap().get(session_token) {
            Some(client) => client.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Fan an event out to every client subscribed to `event_name`, by
    /// exact match, prefix wildcard (`"job:*"` matches `"job:completed"`),
    /// or the global wildcard `"*"`.
    pub fn broadcast_event(&self, event_name: &str, frame: ServerFrame) {
        let clients = self.clients.read().unwrap();
        for client in clients.values() {
            if client.subscriptions.iter().any(|pattern| pattern_matches(pattern, event_name)) {
                let _ = client.sender.send(frame.clone());
            }
        }
    }

    /// Broadcast to every connected client regardless of subscription,
    /// used for frames that are not part of the subscribable event set.
    pub fn broadcast_all(&self, frame: ServerFrame) {
        let clients = self.clients.read().unwrap();
        for client in clients.values() {
            let _ = client.sender.send(frame.clone());
        }
    }
}

fn pattern_matches(pattern: &str, event_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        return event_name.starts_with(prefix) && event_name[prefix.len()..].starts_with(':');
    }
    pattern == event_name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted(job_id: &str) -> ServerFrame {
        ServerFrame::JobSubmitted(relay_protocol::JobSubmitted {
            job_id: job_id.into(),
            request_id: None,
            status: "pending".into(),
        })
    }

    #[test]
    fn exact_prefix_and_global_patterns_match_as_specified() {
        assert!(pattern_matches("job:completed", "job:completed"));
        assert!(pattern_matches("job:*", "job:completed"));
        assert!(!pattern_matches("job:*", "task:completed"));
        assert!(pattern_matches("*", "anything:here"));
        assert!(!pattern_matches("job:completed", "job:failed"));
    }

    #[test]
    fn broadcast_event_only_reaches_matching_subscribers() {
        let registry = ClientRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.add("tok-a".into(), None, None, tx_a);
        registry.add("tok-b".into(), None, None, tx_b);
        registry.add_subscriptions("tok-a", vec!["job:*".into()]);
        registry.add_subscriptions("tok-b", vec!["chat:*".into()]);

        registry.broadcast_event("job:completed", submitted("j1"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn subscribing_again_unions_rather_than_replaces() {
        let registry = ClientRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.add("tok".into(), None, None, tx);
        registry.add_subscriptions("tok", vec!["job:*".into()]);
        registry.add_subscriptions("tok", vec!["chat:*".into()]);

        registry.broadcast_event("job:completed", submitted("j1"));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn removed_client_is_not_sized_or_reachable() {
        let registry = ClientRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add("tok".into(), None, None, tx);
        assert_eq!(registry.size(), 1);
        registry.remove("tok");
        assert_eq!(registry.size(), 0);
        assert!(!registry.send_to("tok", submitted("j1")));
    }
}
