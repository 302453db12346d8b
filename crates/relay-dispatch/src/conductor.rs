use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use relay_common::CredentialId;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::config::DispatchConfig;
use crate::cooldown_queue::CooldownQueue;
use crate::credential::{CredentialRecord, cooldown_for_status};
use crate::errors::{DispatchError, ErrorCode, ExecutorError, ModelCooldownError};
use crate::executor::{DispatchRequest, DispatchResponse, ExecuteOptions, Executor, HttpRequestSpec, HttpResponseSpec, StreamChunk};
use crate::hooks::{ConductorHooks, ExecutionResult, NoopHooks};
use crate::model_mapping::{ModelMappingTable, ORIGINAL_MODEL_METADATA_KEY, channel_for};
use crate::model_registry::{ModelRegistry, NoopModelRegistry};
use crate::registry::ExecutorRegistry;
use crate::selector::Selector;
use crate::store::CredentialStore;
use crate::transient::TransientStateCache;

const MAX_FALLBACK_DEPTH: u32 = 20;
const REFRESH_PENDING_BACKOFF: Duration = Duration::from_secs(60);
const REFRESH_TICK_INTERVAL: Duration = Duration::from_secs(5);
const STARTUP_VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Cooldown(#[from] ModelCooldownError),
    #[error(transparent)]
    Upstream(#[from] ExecutorError),
}

impl From<crate::errors::SelectError> for ExecuteError {
    fn from(value: crate::errors::SelectError) -> Self {
        match value {
            crate::errors::SelectError::Cooldown(e) => ExecuteError::Cooldown(e),
            crate::errors::SelectError::Dispatch(e) => ExecuteError::Dispatch(e),
        }
    }
}

/// A request routed through the dispatch core: the caller's provider hint
/// list (used by the priority selector), the model the caller asked for,
/// and the payload/metadata passed through to the executor unchanged.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub providers: Vec<String>,
    pub model: String,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
}

/// The central orchestrator: owns the credential map, registers executors,
/// drives execution attempts with retry/fallback, and records outcomes.
/// Every other component in this crate is a collaborator it coordinates.
pub struct Conductor {
    credentials: RwLock<HashMap<CredentialId, CredentialRecord>>,
    transient: TransientStateCache,
    executors: RwLock<ExecutorRegistry>,
    selector: RwLock<Arc<dyn Selector>>,
    model_mapping: ModelMappingTable,
    model_registry: RwLock<Arc<dyn ModelRegistry>>,
    store: RwLock<Option<Arc<dyn CredentialStore>>>,
    hooks: RwLock<Arc<dyn ConductorHooks>>,
    config: DispatchConfig,
    cooldown_queue: Arc<CooldownQueue<CredentialId>>,
    model_cooldown_queue: Arc<CooldownQueue<(CredentialId, String)>>,
    refresh_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_index: AtomicU64,
}

impl Conductor {
    pub fn new(selector: Arc<dyn Selector>) -> Arc<Self> {
        let cooldown_queue = CooldownQueue::new();
        let model_cooldown_queue = CooldownQueue::new();

        cooldown_queue.clone().spawn_recover_task(|id| {
            tracing::debug!(credential_id = %id, "credential cooldown lapsed");
        });
        model_cooldown_queue.clone().spawn_recover_task(|(id, model)| {
            tracing::debug!(credential_id = %id, model = %model, "model cooldown lapsed");
        });

        Arc::new(Self {
            credentials: RwLock::new(HashMap::new()),
            transient: TransientStateCache::new(),
            executors: RwLock::new(ExecutorRegistry::new()),
            selector: RwLock::new(selector),
            model_mapping: ModelMappingTable::new(),
            model_registry: RwLock::new(Arc::new(NoopModelRegistry)),
            store: RwLock::new(None),
            hooks: RwLock::new(Arc::new(NoopHooks)),
            config: DispatchConfig::new(),
            cooldown_queue,
            model_cooldown_queue,
            refresh_handle: std::sync::Mutex::new(None),
            next_index: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn model_mapping(&self) -> &ModelMappingTable {
        &self.model_mapping
    }

    pub async fn set_selector(&self, selector: Arc<dyn Selector>) {
        *self.selector.write().await = selector;
    }

    pub async fn set_store(&self, store: Arc<dyn CredentialStore>) {
        *self.store.write().await = Some(store);
    }

    pub async fn set_model_registry(&self, registry: Arc<dyn ModelRegistry>) {
        *self.model_registry.write().await = registry;
    }

    pub async fn set_hooks(&self, hooks: Arc<dyn ConductorHooks>) {
        *self.hooks.write().await = hooks;
    }

    pub async fn register_executor(&self, executor: Arc<dyn Executor>) {
        self.executors.write().await.register(executor);
    }

    // ---- Registration & storage --------------------------------------

    pub async fn register(&self, mut credential: CredentialRecord) -> CredentialRecord {
        if credential.index == 0 {
            credential.index = self.next_index.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut guard = self.credentials.write().await;
            guard.insert(credential.id.clone(), credential.clone());
        }
        if !credential.is_runtime_only()
            && let Some(store) = self.store.read().await.clone()
        {
            let _ = store.save(&credential.identity_snapshot()).await;
        }
        tracing::info!(credential_id = %credential.id, provider = %credential.provider, "credential registered");
        self.hooks.read().await.on_auth_registered(&credential).await;
        credential
    }

    pub async fn update(&self, mut credential: CredentialRecord) -> CredentialRecord {
        if credential.index == 0
            && let Some(existing) = self.credentials.read().await.get(&credential.id)
        {
            credential.index = existing.index;
        }
        {
            let mut guard = self.credentials.write().await;
            guard.insert(credential.id.clone(), credential.clone());
        }
        if !credential.is_runtime_only()
            && let Some(store) = self.store.read().await.clone()
        {
            let _ = store.save(&credential.identity_snapshot()).await;
        }
        tracing::info!(credential_id = %credential.id, provider = %credential.provider, "credential updated");
        self.hooks.read().await.on_auth_updated(&credential).await;
        credential
    }

    /// Rebuilds the in-memory map from the store, discarding whatever was
    /// there before.
    pub async fn load(&self) -> Result<(), crate::store::StoreError> {
        self.transient.load().await;

        let Some(store) = self.store.read().await.clone() else {
            return Ok(());
        };
        let loaded = store.list().await?;
        let mut guard = self.credentials.write().await;
        guard.clear();
        for mut credential in loaded {
            if let Some(snapshot) = self.transient.get(&credential.id).await {
                credential.apply_transient(snapshot);
            }
            guard.insert(credential.id.clone(), credential);
        }
        Ok(())
    }

    pub async fn list(&self) -> Vec<CredentialRecord> {
        self.credentials.read().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<CredentialRecord> {
        self.credentials.read().await.get(id).cloned()
    }

    pub async fn list_by_provider(&self, provider: &str) -> Vec<CredentialRecord> {
        self.credentials
            .read()
            .await
            .values()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }

    // ---- Execute — with fallback-model cascade -------------------------

    pub async fn execute(&self, request: IncomingRequest, options: ExecuteOptions) -> Result<DispatchResponse, ExecuteError> {
        let mut visited = HashSet::new();
        self.execute_with_fallback(request, options, &mut visited, 0).await
    }

    fn execute_with_fallback<'a>(
        &'a self,
        request: IncomingRequest,
        options: ExecuteOptions,
        visited: &'a mut HashSet<String>,
        depth: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DispatchResponse, ExecuteError>> + Send + 'a>> {
        Box::pin(async move {
            if depth >= MAX_FALLBACK_DEPTH {
                return Err(ModelCooldownError {
                    model: request.model.clone(),
                    provider: None,
                    reset_in: Duration::ZERO,
                }
                .into());
            }

            visited.insert(request.model.clone());

            match self.execute_internal(&request, &options).await {
                Ok(response) => Ok(response),
                Err(ExecuteError::Cooldown(cooldown)) => {
                    let Some(fallback_model) = self.fallback_model_for(&request.model, visited).await else {
                        tracing::warn!(model = %request.model, reset_in = ?cooldown.reset_in, "no fallback model configured, surfacing cooldown");
                        return Err(cooldown.into());
                    };
                    tracing::info!(from_model = %request.model, to_model = %fallback_model, "falling back to configured model");
                    let next_request = IncomingRequest {
                        model: fallback_model,
                        ..request
                    };
                    self.execute_with_fallback(next_request, options, visited, depth + 1).await
                }
                Err(other) => Err(other),
            }
        })
    }

    async fn fallback_model_for(&self, model: &str, visited: &HashSet<String>) -> Option<String> {
        let candidate = self.config.fallback().fallback_for(model)?;
        if visited.contains(&candidate) {
            None
        } else {
            Some(candidate)
        }
    }

    // ---- executeInternal — with per-attempt retry -----------------------

    async fn execute_internal(&self, request: &IncomingRequest, options: &ExecuteOptions) -> Result<DispatchResponse, ExecuteError> {
        let providers = normalize_providers(&request.providers);
        let retry_budget = self.config.retry_budget();
        let max_retry_interval = self.config.max_retry_interval();

        let mut tried = HashSet::new();
        let mut last_error = None;

        for attempt in 0..retry_budget {
            if options.is_cancelled() {
                return Err(DispatchError::new(ErrorCode::InvalidRequest, "request cancelled").into());
            }
            match self.execute_with_provider(request, options, &providers, &mut tried).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if attempt + 1 >= retry_budget {
                        return Err(err);
                    }
                    if let ExecuteError::Cooldown(_) = &err {
                        return Err(err);
                    }
                    let wait = self.closest_cooldown_wait(&providers, &request.model).await;
                    match wait {
                        Some(wait) if wait <= max_retry_interval => match &options.cancellation {
                            Some(token) => tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = token.cancelled() => {
                                    return Err(DispatchError::new(ErrorCode::InvalidRequest, "request cancelled").into());
                                }
                            },
                            None => tokio::time::sleep(wait).await,
                        },
                        _ => return Err(err),
                    }
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DispatchError::auth_unavailable().into()))
    }

    async fn closest_cooldown_wait(&self, providers: &[String], model: &str) -> Option<Duration> {
        let now = SystemTime::now();
        let guard = self.credentials.read().await;
        guard
            .values()
            .filter(|c| providers.is_empty() || providers.contains(&c.provider))
            .filter_map(|c| c.availability(Some(model), now).reset_in(now))
            .min()
    }

    // ---- executeWithProvider — the hot loop ------------------------------

    async fn execute_with_provider(
        &self,
        request: &IncomingRequest,
        options: &ExecuteOptions,
        providers: &[String],
        tried: &mut HashSet<CredentialId>,
    ) -> Result<DispatchResponse, ExecuteError> {
        let mut last_upstream_failure: Option<DispatchError> = None;

        loop {
            let (credential, executor) = match self.pick_next(providers, &request.model, tried).await {
                Ok(pair) => pair,
                Err(err) => return Err(last_upstream_failure.map(ExecuteError::from).unwrap_or(err)),
            };
            tried.insert(credential.id.clone());

            let mut effective_model = request.model.clone();
            if let Some(prefix) = credential.attributes.prefix() {
                let stripped = format!("{prefix}/");
                if let Some(rest) = effective_model.strip_prefix(&stripped) {
                    effective_model = rest.to_string();
                }
            }

            let auth_kind = credential.attributes.auth_kind();
            let channel = channel_for(&credential.provider, auth_kind);
            let mut metadata = request.metadata.clone();
            let mapped_upstream = channel
                .as_deref()
                .and_then(|channel| self.model_mapping.resolve(channel, &effective_model));

            let (dispatch_model, applied_alias) = match &mapped_upstream {
                Some(upstream) => {
                    metadata.insert(ORIGINAL_MODEL_METADATA_KEY.to_string(), effective_model.clone());
                    (upstream.clone(), Some(effective_model.clone()))
                }
                None => (effective_model.clone(), None),
            };

            let dispatch_request = DispatchRequest {
                model: dispatch_model.clone(),
                payload: request.payload.clone(),
                metadata,
            };

            let outcome = run_with_timeout(options, executor.execute(&credential, &dispatch_request, options)).await;

            match outcome {
                Ok(response) => {
                    self.mark_result(&credential.id, Some(&dispatch_model), true, None).await;
                    return Ok(response);
                }
                Err(err) => {
                    self.mark_result(&credential.id, Some(&dispatch_model), false, Some(&err)).await;

                    let Some(alias) = applied_alias else {
                        continue;
                    };
                    let channel = channel.expect("alias implies a channel");
                    let remaining = self.model_mapping.remaining_after(&channel, &alias, &dispatch_model);
                    let mut last_status = err.status_code_opt();
                    let mut tried_upstreams = vec![dispatch_model.clone()];

                    for upstream in remaining {
                        tracing::info!(alias = %alias, from_upstream = %dispatch_model, to_upstream = %upstream, "trying next mapped upstream after failure");
                        let retry_request = DispatchRequest {
                            model: upstream.clone(),
                            payload: request.payload.clone(),
                            metadata: dispatch_request.metadata.clone(),
                        };
                        tried_upstreams.push(upstream.clone());
                        match run_with_timeout(options, executor.execute(&credential, &retry_request, options)).await {
                            Ok(response) => {
                                self.mark_result(&credential.id, Some(&upstream), true, None).await;
                                return Ok(response);
                            }
                            Err(retry_err) => {
                                last_status = retry_err.status_code_opt().or(last_status);
                                self.mark_result(&credential.id, Some(&upstream), false, Some(&retry_err)).await;
                            }
                        }
                    }

                    let mut synthesized = DispatchError::all_upstream_models_failed(&alias, &tried_upstreams);
                    if let Some(status) = last_status {
                        synthesized = synthesized.with_status(status);
                    }
                    last_upstream_failure = Some(synthesized);
                    continue;
                }
            }
        }
    }

    async fn pick_next(
        &self,
        providers: &[String],
        model: &str,
        tried: &HashSet<CredentialId>,
    ) -> Result<(CredentialRecord, Arc<dyn Executor>), ExecuteError> {
        let now = SystemTime::now();
        let executors = self.executors.read().await;
        let model_registry = self.model_registry.read().await.clone();

        let mut candidates = Vec::new();
        {
            let guard = self.credentials.read().await;
            for credential in guard.values() {
                if credential.disabled || tried.contains(&credential.id) {
                    continue;
                }
                if !executors.contains(&credential.provider) {
                    continue;
                }
                if !providers.is_empty() && !providers.contains(&credential.provider) {
                    continue;
                }
                if !model_registry.client_supports_model(&credential.id, model).await {
                    continue;
                }
                candidates.push(credential.clone());
            }
        }

        let selector = self.selector.read().await.clone();
        // Empty provider filter here enacts true cross-provider rotation
        // (see the design notes' resolution of the rotation open question).
        let picked = match selector.select(&[], Some(model), &candidates, now) {
            Ok(picked) => picked,
            Err(err) => {
                tracing::warn!(model = %model, error = %err, "selector exhausted candidates");
                return Err(err.into());
            }
        };
        let executor = executors
            .get(&picked.provider)
            .ok_or_else(|| DispatchError::provider_not_found(&picked.provider))?;
        Ok((picked, executor))
    }

    // ---- MarkResult — the state machine -----------------------------------

    async fn mark_result(&self, credential_id: &str, model: Option<&str>, success: bool, error: Option<&ExecutorError>) {
        let now = SystemTime::now();
        let mut guard = self.credentials.write().await;
        let Some(record) = guard.get_mut(credential_id) else {
            return;
        };

        if success {
            if let Some(model) = model {
                record.model_states.remove(model);
            }
            record.recompute_aggregate();
            tracing::debug!(credential_id = %credential_id, model = ?model, "cooldown cleared");

            if let Some(model) = model {
                let registry = self.model_registry.read().await.clone();
                registry.resume(credential_id, model).await;
                registry.set_quota_exceeded(credential_id, model, false).await;
            }
        } else {
            let status_code = error.and_then(|e| e.status_code).unwrap_or(0);
            let retry_after = error.and_then(|e| e.retry_after);
            let message = error.map(|e| e.to_string()).unwrap_or_default();

            if let Some(model) = model {
                let backoff_level = record
                    .model_states
                    .get(model)
                    .map(|s| s.quota.backoff_level)
                    .unwrap_or(0);
                let (cooldown, reason, new_level) =
                    cooldown_for_status(status_code, retry_after, backoff_level, self.config.quota_cooldown_disabled());
                let next_retry_after = now + cooldown;

                let state = record.model_state_mut(model, now);
                state.unavailable = true;
                state.status = crate::credential::Status::Error;
                state.next_retry_after = Some(next_retry_after);
                state.status_message = Some(reason.as_tag().to_string());
                state.updated_at = now;
                state.last_error = crate::credential::LastError {
                    code: Some(reason.as_tag().to_string()),
                    message: Some(message),
                    retryable: status_code != 401 && status_code != 403,
                    http_status: Some(status_code),
                };
                if let Some(level) = new_level {
                    state.quota.backoff_level = level;
                    state.quota.exceeded = true;
                } else {
                    state.quota.exceeded = false;
                }

                record.recompute_aggregate();
                record.status = crate::credential::Status::Error;

                tracing::warn!(
                    credential_id = %credential_id,
                    model = %model,
                    reason = reason.as_tag(),
                    next_retry_after = ?next_retry_after,
                    "cooldown applied"
                );

                self.model_cooldown_queue
                    .push(tokio::time::Instant::now() + cooldown, (credential_id.to_string(), model.to_string()))
                    .await;

                let registry = self.model_registry.read().await.clone();
                registry.suspend(credential_id, model, reason.as_tag()).await;
                if status_code == 429 {
                    registry.set_quota_exceeded(credential_id, model, true).await;
                }
            } else {
                let (cooldown, reason, new_level) =
                    cooldown_for_status(status_code, retry_after, record.quota.backoff_level, self.config.quota_cooldown_disabled());
                record.unavailable = true;
                record.next_retry_after = Some(now + cooldown);
                record.status = crate::credential::Status::Error;
                record.last_error = crate::credential::LastError {
                    code: Some(reason.as_tag().to_string()),
                    message: Some(message),
                    retryable: status_code != 401 && status_code != 403,
                    http_status: Some(status_code),
                };
                if let Some(level) = new_level {
                    record.quota.backoff_level = level;
                    record.quota.exceeded = true;
                }
                tracing::warn!(
                    credential_id = %credential_id,
                    reason = reason.as_tag(),
                    next_retry_after = ?record.next_retry_after,
                    "cooldown applied at credential level"
                );
                self.cooldown_queue
                    .push(tokio::time::Instant::now() + cooldown, credential_id.to_string())
                    .await;
            }
        }

        let snapshot = record.clone();
        drop(guard);

        self.transient.set(credential_id.to_string(), snapshot.transient_snapshot()).await;

        if !snapshot.is_runtime_only()
            && let Some(store) = self.store.read().await.clone()
        {
            let _ = store.save(&snapshot.identity_snapshot()).await;
        }

        let result = ExecutionResult {
            auth_id: credential_id.to_string(),
            provider: snapshot.provider.clone(),
            model: model.map(str::to_string),
            success,
            retry_after: error.and_then(|e| e.retry_after),
            error: error.map(|e| e.to_string()),
        };
        self.hooks.read().await.on_result(&result).await;
    }

    // ---- Streaming execution -----------------------------------------------

    pub async fn execute_stream(
        self: &Arc<Self>,
        request: IncomingRequest,
        options: ExecuteOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>, ExecuteError> {
        let providers = normalize_providers(&request.providers);
        let mut tried = HashSet::new();
        let (credential, executor) = self.pick_next(&providers, &request.model, &mut tried).await?;

        let dispatch_request = DispatchRequest {
            model: request.model.clone(),
            payload: request.payload.clone(),
            metadata: request.metadata.clone(),
        };

        let upstream = run_with_timeout(&options, executor.execute_stream(&credential, &dispatch_request, &options)).await?;

        let (tx, rx) = mpsc::channel(32);
        let credential_id = credential.id.clone();
        let model = request.model.clone();
        let conductor = self.clone();

        // Once the first chunk has flowed we never switch sources — only
        // one failure is ever recorded, and it never triggers a fallback.
        tokio::spawn(async move {
            let mut upstream = upstream;
            let mut saw_error = false;
            while let Some(chunk) = upstream.recv().await {
                if let StreamChunk::Error(_) = &chunk {
                    saw_error = true;
                }
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            if saw_error {
                let err = ExecutorError::from_status(0, "stream terminated with an error chunk");
                conductor.mark_result(&credential_id, Some(&model), false, Some(&err)).await;
            } else {
                conductor.mark_result(&credential_id, Some(&model), true, None).await;
            }
        });

        Ok(rx)
    }

    // ---- Direct HTTP passthrough --------------------------------------------

    /// Routes a caller-built HTTP request through a specific credential's
    /// executor, running it through the executor's [`RequestPreparer`](crate::executor::RequestPreparer)
    /// first when it has one. Outside the normal model-routed `execute` path:
    /// the caller names the provider and credential explicitly.
    pub async fn http_request(
        &self,
        provider: &str,
        credential_id: &str,
        mut request: HttpRequestSpec,
        options: ExecuteOptions,
    ) -> Result<HttpResponseSpec, ExecuteError> {
        let executor = self
            .executors
            .read()
            .await
            .get(provider)
            .ok_or_else(|| DispatchError::provider_not_found(provider))?;

        let credential = self
            .credentials
            .read()
            .await
            .get(credential_id)
            .cloned()
            .ok_or_else(|| DispatchError::auth_not_found(format!("no credential '{credential_id}'")))?;

        if credential.disabled {
            return Err(DispatchError::new(ErrorCode::AuthRequired, format!("credential '{credential_id}' is disabled")).into());
        }

        if let Some(preparer) = executor.as_request_preparer() {
            request = preparer.prepare_request(&credential, request)?;
        }

        Ok(executor.http_request(&credential, request, &options).await?)
    }

    // ---- Refresh loop ------------------------------------------------------

    pub fn start_auto_refresh(self: &Arc<Self>) {
        let conductor = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_TICK_INTERVAL);
            loop {
                ticker.tick().await;
                conductor.refresh_tick().await;
            }
        });
        *self.refresh_handle.lock().unwrap() = Some(handle);
    }

    pub fn stop_auto_refresh(&self) {
        if let Some(handle) = self.refresh_handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn refresh_tick(self: &Arc<Self>) {
        let now = SystemTime::now();
        let snapshot = self.list().await;
        let executors = self.executors.read().await;

        for credential in snapshot {
            if credential.attributes.auth_kind() == Some("api_key") {
                continue;
            }
            let Some(executor) = executors.get(&credential.provider) else {
                continue;
            };
            if !self.should_refresh(&credential, executor.as_ref(), now) {
                continue;
            }

            {
                let mut guard = self.credentials.write().await;
                if let Some(record) = guard.get_mut(&credential.id) {
                    record.next_refresh_after = Some(now + REFRESH_PENDING_BACKOFF);
                }
            }

            let conductor = self.clone();
            let executor = executor.clone();
            let credential = credential.clone();
            tokio::spawn(async move {
                conductor.do_refresh(executor, credential).await;
            });
        }
    }

    async fn do_refresh(&self, executor: Arc<dyn Executor>, credential: CredentialRecord) {
        let now = SystemTime::now();
        match executor.refresh(&credential).await {
            Ok(updated) => {
                let mut guard = self.credentials.write().await;
                if let Some(record) = guard.get_mut(&credential.id) {
                    if let Some(updated) = updated {
                        let saved_next_refresh = record.next_refresh_after;
                        *record = updated;
                        if record.next_refresh_after.is_none() {
                            record.next_refresh_after = saved_next_refresh;
                        }
                    }
                    record.last_refreshed_at = Some(now);
                    record.last_error = crate::credential::LastError::default();
                }
                let snapshot = guard.get(&credential.id).cloned();
                drop(guard);
                if let Some(snapshot) = snapshot {
                    self.transient.set(snapshot.id.clone(), snapshot.transient_snapshot()).await;
                    if !snapshot.is_runtime_only()
                        && let Some(store) = self.store.read().await.clone()
                    {
                        let _ = store.save(&snapshot.identity_snapshot()).await;
                    }
                }
                tracing::debug!(credential_id = %credential.id, provider = %credential.provider, "credential refreshed");
            }
            Err(err) => {
                let mut guard = self.credentials.write().await;
                if let Some(record) = guard.get_mut(&credential.id) {
                    record.next_refresh_after = Some(now + REFRESH_PENDING_BACKOFF);
                    record.last_error = crate::credential::LastError {
                        code: None,
                        message: Some(err.to_string()),
                        retryable: true,
                        http_status: err.status_code,
                    };
                }
                tracing::warn!(credential_id = %credential.id, provider = %credential.provider, error = %err, "credential refresh failed");
            }
        }
    }

    fn should_refresh(&self, credential: &CredentialRecord, executor: &dyn Executor, now: SystemTime) -> bool {
        if credential.disabled {
            return false;
        }
        if credential.next_refresh_after.is_some_and(|t| t > now) {
            return false;
        }
        if let Some(interval) = credential.attributes.refresh_interval() {
            let last = credential.last_refreshed_at.unwrap_or(SystemTime::UNIX_EPOCH);
            return now.duration_since(last).unwrap_or(Duration::MAX) >= interval;
        }
        match executor.refresh_lead_time() {
            Some(lead) if !lead.is_zero() => {
                let last = credential.last_refreshed_at.unwrap_or(SystemTime::UNIX_EPOCH);
                now.duration_since(last).unwrap_or(Duration::MAX) >= lead
            }
            _ => false,
        }
    }

    // ---- Startup validation --------------------------------------------------

    /// Runs one `CountTokens` probe per active credential concurrently,
    /// recording the outcome through `MarkResult`. `probe_model_for` picks
    /// the model to probe with for a given provider; a credential whose
    /// provider has no configured probe model is skipped entirely.
    pub async fn validate_on_startup(self: &Arc<Self>, probe_model_for: impl Fn(&str) -> Option<String>) {
        let credentials = self.list().await;
        let executors = self.executors.read().await;
        let mut tasks = Vec::new();

        for credential in credentials {
            if credential.disabled || credential.status == crate::credential::Status::Disabled {
                continue;
            }
            let Some(executor) = executors.get(&credential.provider) else {
                continue;
            };
            let Some(probe_model) = probe_model_for(&credential.provider) else {
                continue;
            };
            let conductor = self.clone();
            tasks.push(tokio::spawn(async move {
                let request = DispatchRequest {
                    model: probe_model.clone(),
                    payload: serde_json::Value::Null,
                    metadata: HashMap::new(),
                };
                let outcome = tokio::time::timeout(
                    STARTUP_VALIDATION_TIMEOUT,
                    executor.count_tokens(&credential, &request),
                )
                .await;
                match outcome {
                    Ok(Ok(_)) => conductor.mark_result(&credential.id, Some(&probe_model), true, None).await,
                    Ok(Err(err)) => {
                        conductor
                            .mark_result(&credential.id, Some(&probe_model), false, Some(&err))
                            .await
                    }
                    Err(_) => {
                        let timeout_err = ExecutorError::from_status(0, "startup validation timed out");
                        conductor
                            .mark_result(&credential.id, Some(&probe_model), false, Some(&timeout_err))
                            .await
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Enforces [`ExecuteOptions::timeout`] around a single executor call.
/// A timed-out call surfaces as an ordinary [`ExecutorError`] so it flows
/// through the same retry/fallback/cooldown path as any other upstream
/// failure, rather than needing a parallel error case.
async fn run_with_timeout<T>(
    options: &ExecuteOptions,
    future: impl std::future::Future<Output = Result<T, ExecutorError>>,
) -> Result<T, ExecutorError> {
    match options.timeout {
        Some(duration) => match tokio::time::timeout(duration, future).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::from_status(408, "executor call timed out")),
        },
        None => future.await,
    }
}

fn normalize_providers(providers: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::new();
    for provider in providers {
        let lower = provider.to_lowercase();
        if seen.insert(lower.clone()) {
            normalized.push(lower);
        }
    }
    normalized
}

impl ExecutorError {
    fn status_code_opt(&self) -> Option<u16> {
        self.status_code
    }
}
