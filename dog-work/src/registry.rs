use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;

use crate::{Envelope, JobResult, QueueError, QueueResult};

/// Business logic for one job name.
///
/// `C` is the per-attempt context populated by middleware before the
/// handler runs.
#[async_trait]
pub trait Handler<C>: Send + Sync {
    async fn handle(&self, envelope: &Envelope, ctx: &mut C) -> JobResult;
}

/// Maps job names to handlers
pub struct HandlerRegistry<C> {
    handlers: HashMap<String, Arc<dyn Handler<C>>>,
}

impl<C: Send + 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler; each name may be registered once
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> QueueResult<()>
    where
        H: Handler<C> + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(QueueError::DuplicateHandler(name));
        }

        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Handler<C>>> {
        self.handlers.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Fail on the first expected name with no handler
    pub fn validate<S: AsRef<str>>(&self, expected: &[S]) -> QueueResult<()> {
        match expected.iter().find(|name| !self.is_registered(name.as_ref())) {
            Some(missing) => Err(QueueError::UnregisteredJob(missing.as_ref().to_string())),
            None => Ok(()),
        }
    }
}

impl<C: Send + 'static> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
