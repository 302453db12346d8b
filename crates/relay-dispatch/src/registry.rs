use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::Executor;

/// Maps a provider key to its registered executor.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.identifier().to_string(), executor);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(provider).cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.executors.contains_key(provider)
    }
}
