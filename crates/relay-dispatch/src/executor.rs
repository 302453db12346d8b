use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::credential::CredentialRecord;
use crate::errors::{DispatchError, ErrorCode, ExecutorError};

/// A unary or streaming call handed to an executor, already routed to a
/// concrete upstream model name (the conductor applies prefix-stripping and
/// OAuth model mapping before calling the executor).
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub model: String,
    pub payload: Value,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub payload: Value,
    /// The model that actually produced this response; may differ from the
    /// model the caller originally requested once fallback has occurred.
    pub actual_model: String,
}

/// One chunk of a streamed response: either a payload fragment or the
/// stream's terminal error.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Payload(Bytes),
    Error(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub timeout: Option<std::time::Duration>,
    /// Cooperative cancellation signal. Every suspension point the
    /// conductor controls directly (the cooldown-wait sleep between retry
    /// attempts) races against this; executors that accept it should also
    /// race their own upstream I/O against it.
    pub cancellation: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// A bare HTTP request/response pair, used only by [`Executor::http_request`]
/// so a caller can reach an upstream directly through a credentialed
/// executor without the dispatch core ever holding a concrete HTTP client.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct HttpResponseSpec {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Optional capability: an executor that can inject its credential into an
/// arbitrary caller-built HTTP request instead of fully owning the request
/// (e.g. a caller reusing its own HTTP client for routes this crate doesn't
/// model as a [`DispatchRequest`]). Discovered via [`Executor::as_request_preparer`]
/// rather than a downcast, since the executor itself is the only implementor
/// that knows whether it supports this.
pub trait RequestPreparer: Send + Sync {
    fn prepare_request(&self, credential: &CredentialRecord, request: HttpRequestSpec) -> Result<HttpRequestSpec, ExecutorError>;
}

/// External per-provider plug-in. Implementors own all wire-protocol
/// translation and upstream I/O; the dispatch core only ever sees the
/// generic request/response/error shapes above.
#[async_trait]
pub trait Executor: Send + Sync {
    fn identifier(&self) -> &str;

    async fn execute(
        &self,
        credential: &CredentialRecord,
        request: &DispatchRequest,
        options: &ExecuteOptions,
    ) -> Result<DispatchResponse, ExecutorError>;

    async fn execute_stream(
        &self,
        credential: &CredentialRecord,
        request: &DispatchRequest,
        options: &ExecuteOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, ExecutorError>;

    async fn count_tokens(
        &self,
        credential: &CredentialRecord,
        request: &DispatchRequest,
    ) -> Result<u64, ExecutorError>;

    async fn refresh(&self, credential: &CredentialRecord) -> Result<Option<CredentialRecord>, ExecutorError>;

    /// Positive lead time before expiry at which this provider's tokens
    /// should be refreshed; `None` means "refresh only after expiry" (see
    /// the refresh decision rule).
    fn refresh_lead_time(&self) -> Option<std::time::Duration> {
        None
    }

    /// Send a caller-built HTTP request through this executor's credential.
    /// Most executors only ever go through [`Executor::execute`]; this is
    /// an optional capability for callers that need raw upstream access.
    async fn http_request(
        &self,
        _credential: &CredentialRecord,
        _request: HttpRequestSpec,
        _options: &ExecuteOptions,
    ) -> Result<HttpResponseSpec, ExecutorError> {
        Err(ExecutorError::new(DispatchError::new(
            ErrorCode::ExecutorNotFound,
            format!("{} does not support direct HTTP requests", self.identifier()),
        )))
    }

    /// Exposes [`RequestPreparer`] when this executor supports it. Returns
    /// `None` by default, matching `http_request`'s default refusal.
    fn as_request_preparer(&self) -> Option<&dyn RequestPreparer> {
        None
    }
}
