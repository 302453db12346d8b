use async_trait::async_trait;

/// External collaborator the conductor consults and pushes events to;
/// never calls back into the conductor (avoids the credential/registry
/// cyclic-reference problem by making the registry a push-based observer).
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn client_supports_model(&self, credential_id: &str, model: &str) -> bool;
    async fn suspend(&self, credential_id: &str, model: &str, reason: &str);
    async fn resume(&self, credential_id: &str, model: &str);
    async fn set_quota_exceeded(&self, credential_id: &str, model: &str, exceeded: bool);
}

/// Default registry: every credential supports every model, and
/// suspend/resume/quota calls are no-ops. Used when no external model
/// registry is wired in.
pub struct NoopModelRegistry;

#[async_trait]
impl ModelRegistry for NoopModelRegistry {
    async fn client_supports_model(&self, _credential_id: &str, _model: &str) -> bool {
        true
    }

    async fn suspend(&self, _credential_id: &str, _model: &str, _reason: &str) {}

    async fn resume(&self, _credential_id: &str, _model: &str) {}

    async fn set_quota_exceeded(&self, _credential_id: &str, _model: &str, _exceeded: bool) {}
}
