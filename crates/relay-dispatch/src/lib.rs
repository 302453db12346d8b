//! Credential pool and dispatch core for a multi-provider AI proxy.
//!
//! Holds a fleet of upstream credentials, selects one for each incoming
//! request, drives the request through a provider-specific [`Executor`],
//! interprets the outcome, and schedules that credential's future
//! availability. Also orchestrates background token refresh, OAuth
//! model-alias resolution with round-robin across upstream names, and
//! cascading fallback across models when every credential for a model is
//! in cooldown.
//!
//! This crate intentionally does **not** depend on axum, a concrete HTTP
//! client, or any wire protocol: executors own all upstream I/O and
//! request/response translation, and the conductor only ever sees the
//! generic [`DispatchRequest`]/[`DispatchResponse`] shapes.

pub mod config;
pub mod conductor;
pub mod cooldown_queue;
pub mod credential;
pub mod errors;
pub mod executor;
pub mod hooks;
pub mod model_mapping;
pub mod model_registry;
pub mod registry;
pub mod selector;
pub mod store;
pub mod transient;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use conductor::{Conductor, ExecuteError, IncomingRequest};
pub use config::{DispatchConfig, FallbackConfig};
pub use credential::{Availability, CredentialRecord, LastError, ModelState, Quota, Status, UnavailableReason};
pub use errors::{DispatchError, ErrorCode, ExecutorError, ModelCooldownError, SelectError};
pub use executor::{DispatchRequest, DispatchResponse, ExecuteOptions, Executor, HttpRequestSpec, HttpResponseSpec, RequestPreparer, StreamChunk};
pub use hooks::{ConductorHooks, ExecutionResult, NoopHooks};
pub use model_mapping::ModelMappingTable;
pub use model_registry::{ModelRegistry, NoopModelRegistry};
pub use registry::ExecutorRegistry;
pub use selector::{CursorMode, FillFirstSelector, PrioritySelector, RoundRobinSelector, Selector};
pub use store::{CredentialStore, StoreError};
pub use transient::TransientStateCache;

pub use relay_common::{Attributes, CredentialId};
