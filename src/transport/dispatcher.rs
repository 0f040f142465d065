//! Kind-to-handler dispatch table.

use crate::error::{NetworkError, Result};
use crate::transport::message::{CommandKind, Envelope, Reply};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Handles one or more command kinds.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync {
    /// Process an incoming command and build its reply.
    async fn handle(&self, envelope: Envelope) -> Result<Reply>;
}

/// Routes incoming envelopes to the handler registered for their kind.
pub struct MessageDispatcher {
    cache_name: String,
    handlers: RwLock<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
}

impl std::fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.read().keys().map(|k| format!("{:?}", k)).collect();
        kinds.sort();
        f.debug_struct("MessageDispatcher")
            .field("cache_name", &self.cache_name)
            .field("kinds", &kinds)
            .finish()
    }
}

impl MessageDispatcher {
    /// Create an empty dispatcher for one cache.
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a set of kinds, replacing earlier registrations.
    pub fn register(&self, kinds: &[CommandKind], handler: Arc<dyn CommandHandler>) {
        let mut handlers = self.handlers.write();
        for kind in kinds {
            handlers.insert(*kind, handler.clone());
        }
    }

    /// Whether a handler exists for the kind.
    pub fn handles(&self, kind: CommandKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Dispatch an envelope. Handler failures become error replies.
    pub async fn dispatch(&self, envelope: Envelope) -> Reply {
        if envelope.cache_name != self.cache_name {
            return Reply::Error(format!("unknown cache {}", envelope.cache_name));
        }

        let kind = envelope.kind();
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            debug!(?kind, origin = envelope.origin, "No handler registered");
            return Reply::from_error(&NetworkError::HandlerMissing(kind).into());
        };

        trace!(?kind, origin = envelope.origin, topology_id = envelope.topology_id, "Dispatching");
        match handler.handle(envelope).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(?kind, error = %e, "Handler failed");
                Reply::from_error(&e)
            }
        }
    }
}
