//! Fakes used by this crate's own integration tests. Not part of the
//! public contract; gated behind `cfg(test)` / the `test-support` feature
//! so embedders can reuse the same fixtures in their own test suites.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::credential::CredentialRecord;
use crate::errors::ExecutorError;
use crate::executor::{DispatchRequest, DispatchResponse, ExecuteOptions, Executor, StreamChunk};

/// One scripted outcome for a single `execute` call.
#[derive(Clone)]
pub enum ScriptedOutcome {
    Success,
    StatusError(u16),
}

/// An executor whose responses are scripted per model, consumed in order.
/// Every call is recorded so tests can assert call count and ordering.
pub struct FakeExecutor {
    name: String,
    scripts: Mutex<HashMap<String, Vec<ScriptedOutcome>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, model: impl Into<String>, outcomes: Vec<ScriptedOutcome>) -> Self {
        self.scripts.lock().unwrap().insert(model.into(), outcomes);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _credential: &CredentialRecord,
        request: &DispatchRequest,
        _options: &ExecuteOptions,
    ) -> Result<DispatchResponse, ExecutorError> {
        self.calls.lock().unwrap().push(request.model.clone());

        let outcome = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.get_mut(&request.model).and_then(|queue| {
                if queue.is_empty() {
                    None
                } else {
                    Some(queue.remove(0))
                }
            })
        };

        match outcome {
            None | Some(ScriptedOutcome::Success) => Ok(DispatchResponse {
                payload: Value::Null,
                actual_model: request.model.clone(),
            }),
            Some(ScriptedOutcome::StatusError(status)) => Err(ExecutorError::from_status(status, "scripted failure")),
        }
    }

    async fn execute_stream(
        &self,
        _credential: &CredentialRecord,
        _request: &DispatchRequest,
        _options: &ExecuteOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>, ExecutorError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn count_tokens(&self, _credential: &CredentialRecord, _request: &DispatchRequest) -> Result<u64, ExecutorError> {
        Ok(0)
    }

    async fn refresh(&self, _credential: &CredentialRecord) -> Result<Option<CredentialRecord>, ExecutorError> {
        Ok(None)
    }
}

pub fn fresh_credential(id: &str, provider: &str) -> CredentialRecord {
    CredentialRecord::new(id.to_string(), provider, Value::Null, std::time::SystemTime::now())
}
