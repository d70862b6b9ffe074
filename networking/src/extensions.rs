//! Extension registration and dispatch.
//!
//! Extensions are external collaborators: higher-level subsystems that hook
//! additional message kinds into the fabric. The registry maps each kind to
//! an ordered list of handlers; handler errors are contained per handler
//! and never stall the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{Message, MessageKind, NodeId};

use crate::error::{NetworkError, NetworkResult};
use crate::node::NodeHandle;

/// Contract between the fabric and one extension.
///
/// `initialize` runs at orchestrator start, or at registration time when
/// registered later. `handle_message` receives a read-only record whose
/// payload has already been decrypted; extensions send by calling back
/// through the [`NodeHandle`], never by touching transports.
#[async_trait]
pub trait Extension: Send + Sync {
    fn id(&self) -> &str;

    fn version(&self) -> &str;

    fn supported_kinds(&self) -> Vec<MessageKind>;

    async fn initialize(&self, node: NodeHandle) -> anyhow::Result<()>;

    async fn handle_message(&self, message: &Message, from: &NodeId) -> anyhow::Result<()>;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// Kind-indexed handler lists plus an id index for registration bookkeeping.
#[derive(Default)]
pub struct ExtensionRegistry {
    by_id: HashMap<String, Arc<dyn Extension>>,
    by_kind: HashMap<MessageKind, Vec<Arc<dyn Extension>>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension. Re-registering an existing id is a caller error.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> NetworkResult<()> {
        let id = extension.id().to_owned();
        if self.by_id.contains_key(&id) {
            return Err(NetworkError::Extension {
                id,
                reason: "already registered".to_owned(),
            });
        }

        for kind in extension.supported_kinds() {
            self.by_kind.entry(kind).or_default().push(extension.clone());
        }
        self.by_id.insert(id, extension);
        Ok(())
    }

    pub fn unregister(&mut self, id: &str) -> Option<Arc<dyn Extension>> {
        let removed = self.by_id.remove(id)?;
        for handlers in self.by_kind.values_mut() {
            handlers.retain(|handler| handler.id() != id);
        }
        Some(removed)
    }

    /// Handlers for a kind, in registration order.
    pub fn handlers_for(&self, kind: MessageKind) -> Vec<Arc<dyn Extension>> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<dyn Extension>> {
        self.by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
