use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// One call's worth of context handed to a handler.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Executes one method of one target type. Errors surface unchanged to the
/// worker, which records them on the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<Value>;
}

/// Materializes the handler for a descriptor's target type. Implementations
/// may pull instances out of a DI container; the default is a typed registry.
pub trait JobActivator: Send + Sync {
    fn activate(&self, target_type: &str) -> Option<Arc<dyn JobHandler>>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, target_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(target_type.into(), handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl JobActivator for HandlerRegistry {
    fn activate(&self, target_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(target_type).cloned()
    }
}
