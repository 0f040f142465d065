//! Named transforms applied on the node that owns the data.
//!
//! Closures cannot cross the wire, so every node registers the same
//! transforms under the same names and requests refer to them by name.

use crate::types::CacheEntry;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A transform maps an entry to a value, or drops it by returning None.
pub type TransformFn = Arc<dyn Fn(&CacheEntry) -> Option<Bytes> + Send + Sync>;

/// Transforms known to this node.
#[derive(Default)]
pub struct TransformRegistry {
    transforms: RwLock<HashMap<String, TransformFn>>,
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort();
        f.debug_struct("TransformRegistry").field("names", &names).finish()
    }
}

impl TransformRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transform, replacing any previous one with the same name.
    pub fn register<F>(&self, name: impl Into<String>, transform: F)
    where
        F: Fn(&CacheEntry) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.transforms.write().insert(name.into(), Arc::new(transform));
    }

    /// Look up a transform.
    pub fn get(&self, name: &str) -> Option<TransformFn> {
        self.transforms.read().get(name).cloned()
    }

    /// Whether a transform is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.transforms.read().contains_key(name)
    }

    /// Registered names.
    pub fn names(&self) -> Vec<String> {
        self.transforms.read().keys().cloned().collect()
    }
}
