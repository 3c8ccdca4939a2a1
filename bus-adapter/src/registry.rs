use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::message::InboundMessage;

/// Business logic bound to one message type. Failures are the handler's to
/// report, usually by publishing an error notification.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Message type to handler. Filled during startup, read-only once the adapter runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AdapterError> {
        let message_type = message_type.into();
        if self.handlers.contains_key(&message_type) {
            return Err(AdapterError::DuplicateHandler(message_type));
        }
        self.handlers.insert(message_type, handler);
        Ok(())
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(message_type).cloned()
    }

    pub fn message_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
