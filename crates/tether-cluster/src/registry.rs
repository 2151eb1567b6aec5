//! Replicated name registry
//!
//! A [`StateRegistry`] maps a name to the set of servers that currently claim
//! it within one topic. Local claims are queued on the node's claim outbox so
//! the node can broadcast them; remote claims only touch local state.
//!
//! Listeners observe two transitions per name: [`RegistryEvent::Added`] when
//! the first server claims it, and [`RegistryEvent::Removed`] when the last
//! one lets go. Each mutation and its notification are applied under one
//! ordering lock, so listeners see transitions in the order they happened.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Transition of a name within a registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(String),
    Removed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimChange {
    Add,
    Remove,
}

/// A local claim change waiting to be broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterClaim {
    pub topic: String,
    pub name: String,
    pub change: ClaimChange,
}

type Listener = Arc<dyn Fn(&RegistryEvent) + Send + Sync>;

pub struct StateRegistry {
    topic: String,
    server_name: String,
    data: RwLock<HashMap<String, HashSet<String>>>,
    /// Held across a mutation and its notification. Reentrant so a listener
    /// may mutate the registry it observes.
    order: ReentrantMutex<()>,
    listeners: RwLock<Vec<Listener>>,
    outbox: mpsc::UnboundedSender<ClusterClaim>,
}

impl StateRegistry {
    pub fn new(
        topic: impl Into<String>,
        server_name: impl Into<String>,
        outbox: mpsc::UnboundedSender<ClusterClaim>,
    ) -> Self {
        Self {
            topic: topic.into(),
            server_name: server_name.into(),
            data: RwLock::new(HashMap::new()),
            order: ReentrantMutex::new(()),
            listeners: RwLock::new(Vec::new()),
            outbox,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Claim `name` for the local server and announce it to the cluster.
    pub fn add(&self, name: &str) {
        let server = self.server_name.clone();
        if self.insert(name, &server) {
            self.queue(name, ClaimChange::Add);
        }
    }

    /// Record a claim made by another server. Never broadcasts.
    pub fn add_remote(&self, name: &str, server_name: &str) {
        self.insert(name, server_name);
    }

    /// Release the local claim on `name` and announce it to the cluster.
    pub fn remove(&self, name: &str) {
        let server = self.server_name.clone();
        if self.delete(name, &server) {
            self.queue(name, ClaimChange::Remove);
        }
    }

    /// Record another server releasing `name`. Never broadcasts.
    pub fn remove_remote(&self, name: &str, server_name: &str) {
        self.delete(name, server_name);
    }

    /// Drop every claim held by `server_name`, returning the names that no
    /// longer have any owner.
    ///
    /// Listeners see `Removed` for those names, but nothing is broadcast:
    /// every node purges a departed server on its own.
    pub fn remove_all(&self, server_name: &str) -> Vec<String> {
        let _order = self.order.lock();
        let drained = {
            let mut data = self.data.write();
            let mut drained = Vec::new();
            data.retain(|name, servers| {
                servers.remove(server_name);
                if servers.is_empty() {
                    drained.push(name.clone());
                    false
                } else {
                    true
                }
            });
            drained
        };

        if !drained.is_empty() {
            debug!(
                "Purged {} from registry '{}' ({} names released)",
                server_name,
                self.topic,
                drained.len()
            );
        }
        for name in &drained {
            self.notify(&RegistryEvent::Removed(name.clone()));
        }
        drained
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.read().contains_key(name)
    }

    /// Servers claiming `name`, sorted. Empty if unclaimed.
    pub fn get_all_servers(&self, name: &str) -> Vec<String> {
        let mut servers: Vec<String> = self
            .data
            .read()
            .get(name)
            .map(|servers| servers.iter().cloned().collect())
            .unwrap_or_default();
        servers.sort();
        servers
    }

    /// All claimed names, sorted
    pub fn get_all(&self) -> Vec<String> {
        let mut names: Vec<String> = self.data.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the whole registry
    pub fn get_all_map(&self) -> HashMap<String, HashSet<String>> {
        self.data.read().clone()
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Returns true if `server_name` was not already an owner.
    fn insert(&self, name: &str, server_name: &str) -> bool {
        let _order = self.order.lock();
        let (inserted, created) = {
            let mut data = self.data.write();
            let created = !data.contains_key(name);
            let inserted = data
                .entry(name.to_string())
                .or_default()
                .insert(server_name.to_string());
            (inserted, created)
        };

        if created {
            self.notify(&RegistryEvent::Added(name.to_string()));
        }
        inserted
    }

    /// Returns true if `server_name` was an owner.
    fn delete(&self, name: &str, server_name: &str) -> bool {
        let _order = self.order.lock();
        let (removed, drained) = {
            let mut data = self.data.write();
            match data.get_mut(name) {
                Some(servers) => {
                    let removed = servers.remove(server_name);
                    let drained = servers.is_empty();
                    if drained {
                        data.remove(name);
                    }
                    (removed, drained)
                }
                None => (false, false),
            }
        };

        if drained {
            self.notify(&RegistryEvent::Removed(name.to_string()));
        }
        removed
    }

    fn queue(&self, name: &str, change: ClaimChange) {
        let claim = ClusterClaim {
            topic: self.topic.clone(),
            name: name.to_string(),
            change,
        };
        if self.outbox.send(claim).is_err() {
            debug!(
                "Claim outbox for '{}' is closed, '{}' stays local",
                self.topic, name
            );
        }
    }

    fn notify(&self, event: &RegistryEvent) {
        let listeners: Vec<Listener> = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("topic", &self.topic)
            .field("server_name", &self.server_name)
            .field("names", &self.data.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn registry() -> (StateRegistry, mpsc::UnboundedReceiver<ClusterClaim>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StateRegistry::new("presence", "node-A", tx), rx)
    }

    fn record(registry: &StateRegistry) -> Arc<Mutex<Vec<RegistryEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        registry.on_change(move |event| sink.lock().push(event.clone()));
        events
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClusterClaim>) -> Vec<ClusterClaim> {
        let mut claims = Vec::new();
        while let Ok(claim) = rx.try_recv() {
            claims.push(claim);
        }
        claims
    }

    #[test]
    fn test_add_is_idempotent() {
        let (registry, mut rx) = registry();
        let events = record(&registry);

        registry.add("alice");
        registry.add("alice");

        assert_eq!(registry.get_all_servers("alice"), vec!["node-A"]);
        assert_eq!(*events.lock(), vec![RegistryEvent::Added("alice".into())]);
        assert_eq!(
            drain(&mut rx),
            vec![ClusterClaim {
                topic: "presence".into(),
                name: "alice".into(),
                change: ClaimChange::Add,
            }]
        );
    }

    #[test]
    fn test_entry_removed_with_last_owner() {
        let (registry, _rx) = registry();
        let events = record(&registry);

        registry.add("alice");
        registry.add_remote("alice", "node-B");
        registry.remove("alice");
        assert!(registry.has("alice"));
        assert_eq!(registry.get_all_servers("alice"), vec!["node-B"]);

        registry.remove_remote("alice", "node-B");
        assert!(!registry.has("alice"));
        assert!(registry.get_all_servers("alice").is_empty());
        assert!(registry.get_all_map().is_empty());
        assert_eq!(
            *events.lock(),
            vec![
                RegistryEvent::Added("alice".into()),
                RegistryEvent::Removed("alice".into()),
            ]
        );
    }

    #[test]
    fn test_remote_changes_never_queue_claims() {
        let (registry, mut rx) = registry();

        registry.add_remote("bob", "node-B");
        registry.remove_remote("bob", "node-B");
        registry.remove_remote("nobody", "node-C");

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_remove_of_unowned_name_is_quiet() {
        let (registry, mut rx) = registry();
        let events = record(&registry);

        registry.add_remote("bob", "node-B");
        registry.remove("bob");

        assert_eq!(registry.get_all_servers("bob"), vec!["node-B"]);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_remove_all() {
        let (registry, mut rx) = registry();
        registry.add_remote("alice", "node-B");
        registry.add_remote("bob", "node-B");
        registry.add_remote("bob", "node-C");
        let events = record(&registry);

        let mut drained = registry.remove_all("node-B");
        drained.sort();

        assert_eq!(drained, vec!["alice"]);
        assert_eq!(registry.get_all(), vec!["bob"]);
        assert_eq!(registry.get_all_servers("bob"), vec!["node-C"]);
        assert_eq!(*events.lock(), vec![RegistryEvent::Removed("alice".into())]);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_listener_may_read_registry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StateRegistry::new("presence", "node-A", tx));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak = Arc::downgrade(&registry);
        let sink = Arc::clone(&seen);
        registry.on_change(move |_| {
            if let Some(registry) = weak.upgrade() {
                sink.lock().push(registry.get_all());
            }
        });

        registry.add("alice");
        assert_eq!(*seen.lock(), vec![vec!["alice".to_string()]]);
    }

    #[test]
    fn test_closed_outbox_keeps_local_state() {
        let (registry, rx) = registry();
        drop(rx);

        registry.add("alice");
        assert_eq!(registry.get_all_servers("alice"), vec!["node-A"]);
    }

    #[test]
    fn test_concurrent_writers_notify_in_order() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StateRegistry::new("presence", "node-A", tx));
        let events = record(&registry);

        std::thread::scope(|scope| {
            let local = Arc::clone(&registry);
            scope.spawn(move || {
                for _ in 0..500 {
                    local.add("alice");
                    local.remove("alice");
                }
            });
            let remote = Arc::clone(&registry);
            scope.spawn(move || {
                for _ in 0..500 {
                    remote.add_remote("alice", "node-B");
                    remote.remove_remote("alice", "node-B");
                }
            });
        });

        let events = events.lock();
        assert!(!events.is_empty());
        for (i, event) in events.iter().enumerate() {
            let expected = if i % 2 == 0 {
                RegistryEvent::Added("alice".into())
            } else {
                RegistryEvent::Removed("alice".into())
            };
            assert_eq!(event, &expected, "event {} out of order", i);
        }
        assert!(!registry.has("alice"));
    }

    #[test]
    fn test_listener_may_mutate_registry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(StateRegistry::new("presence", "node-A", tx));

        let weak = Arc::downgrade(&registry);
        registry.on_change(move |event| {
            if let (RegistryEvent::Added(name), Some(registry)) = (event, weak.upgrade()) {
                if name == "alice" {
                    registry.add_remote("alice-shadow", "node-B");
                }
            }
        });

        registry.add("alice");
        assert_eq!(registry.get_all(), vec!["alice", "alice-shadow"]);
    }
}
