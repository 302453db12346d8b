use async_trait::async_trait;

use crate::credential::CredentialRecord;

/// Outcome of one execution attempt, reported to hooks after state has
/// already been updated and outside any lock.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub auth_id: String,
    pub provider: String,
    pub model: Option<String>,
    pub success: bool,
    pub retry_after: Option<std::time::Duration>,
    pub error: Option<String>,
}

/// Optional observer notified of registration and execution-outcome
/// events. Calls happen after the conductor releases its lock, so hook
/// implementations may themselves call back into the conductor safely.
#[async_trait]
pub trait ConductorHooks: Send + Sync {
    async fn on_auth_registered(&self, _credential: &CredentialRecord) {}
    async fn on_auth_updated(&self, _credential: &CredentialRecord) {}
    async fn on_result(&self, _result: &ExecutionResult) {}
}

/// Default no-op hook set.
pub struct NoopHooks;

#[async_trait]
impl ConductorHooks for NoopHooks {}
