use async_trait::async_trait;

use crate::credential::CredentialRecord;

/// Optional persistence collaborator. A conductor with no store configured
/// treats loading and saving as a no-op (see the registration/update
/// behaviors in the conductor).
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn list(&self) -> Result<Vec<CredentialRecord>, StoreError>;
    async fn save(&self, credential: &CredentialRecord) -> Result<CredentialRecord, StoreError>;
}

#[derive(Debug, thiserror::Error)]
#[error("credential store error: {0}")]
pub struct StoreError(pub String);
