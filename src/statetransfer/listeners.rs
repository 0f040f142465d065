//! Cluster-scoped listener registrations.
//!
//! A joining node must install every cluster listener before it receives any
//! state, otherwise notifications for entries arriving through state transfer
//! would be missed.

use crate::types::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// A listener registration replicated to every member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterListener {
    /// Registration id.
    pub id: Uuid,

    /// Node that registered the listener and receives its notifications.
    pub origin: NodeId,

    /// Listener name, resolved against the origin's local callbacks.
    pub name: String,

    /// Whether the listener wants existing entries replayed on registration.
    pub include_current_state: bool,
}

impl ClusterListener {
    /// Create a registration with a fresh id.
    pub fn new(origin: NodeId, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            name: name.into(),
            include_current_state: false,
        }
    }

    /// Request replay of existing entries.
    pub fn with_current_state(mut self) -> Self {
        self.include_current_state = true;
        self
    }
}

/// Local set of installed cluster listeners.
#[derive(Debug, Default)]
pub struct ClusterListenerRegistry {
    listeners: RwLock<HashMap<Uuid, ClusterListener>>,
}

impl ClusterListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns false if it was already installed.
    pub fn register(&self, listener: ClusterListener) -> bool {
        let id = listener.id;
        let inserted = self.listeners.write().insert(id, listener).is_none();
        if inserted {
            debug!(listener_id = %id, "Registered cluster listener");
        }
        inserted
    }

    /// Install a batch of listeners received from another member.
    pub fn install_all(&self, listeners: Vec<ClusterListener>) -> usize {
        listeners
            .into_iter()
            .filter(|l| self.register(l.clone()))
            .count()
    }

    /// Remove a listener.
    pub fn unregister(&self, id: &Uuid) -> Option<ClusterListener> {
        self.listeners.write().remove(id)
    }

    /// Remove every listener registered by a departed node.
    pub fn remove_for_origin(&self, origin: NodeId) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|_, l| l.origin != origin);
        before - listeners.len()
    }

    /// Copy of every registration, ordered by id.
    pub fn snapshot(&self) -> Vec<ClusterListener> {
        let mut all: Vec<_> = self.listeners.read().values().cloned().collect();
        all.sort_by_key(|l| l.id);
        all
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listener is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_all_skips_known() {
        let registry = ClusterListenerRegistry::new();
        let a = ClusterListener::new(1, "audit");
        let b = ClusterListener::new(2, "index").with_current_state();
        assert!(registry.register(a.clone()));

        let installed = registry.install_all(vec![a, b.clone()]);
        assert_eq!(installed, 1);
        assert_eq!(registry.len(), 2);
        assert!(registry.snapshot().contains(&b));
    }

    #[test]
    fn test_remove_for_origin() {
        let registry = ClusterListenerRegistry::new();
        registry.register(ClusterListener::new(1, "a"));
        registry.register(ClusterListener::new(1, "b"));
        registry.register(ClusterListener::new(2, "c"));

        assert_eq!(registry.remove_for_origin(1), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(&registry.snapshot()[0].id).is_some());
        assert!(registry.is_empty());
    }
}
