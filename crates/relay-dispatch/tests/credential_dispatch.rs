use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use relay_dispatch::test_support::{FakeExecutor, ScriptedOutcome, fresh_credential};
use relay_dispatch::{
    Conductor, CredentialRecord, CursorMode, DispatchRequest, DispatchResponse, ExecuteError,
    ExecuteOptions, Executor, ExecutorError, FallbackConfig, IncomingRequest, RoundRobinSelector,
    StreamChunk,
};

fn request(model: &str) -> IncomingRequest {
    IncomingRequest {
        providers: Vec::new(),
        model: model.to_string(),
        payload: Value::Null,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn round_robin_spreads_requests_across_two_providers() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));

    conductor.register(fresh_credential("a1", "anthropic")).await;
    conductor.register(fresh_credential("b1", "openai")).await;

    let anthropic = Arc::new(FakeExecutor::new("anthropic"));
    let openai = Arc::new(FakeExecutor::new("openai"));
    conductor.register_executor(anthropic.clone()).await;
    conductor.register_executor(openai.clone()).await;

    for _ in 0..20 {
        conductor.execute(request("m1"), ExecuteOptions::default()).await.unwrap();
    }

    let a_calls = anthropic.calls().len() as i64;
    let o_calls = openai.calls().len() as i64;
    assert_eq!(a_calls + o_calls, 20);
    assert!((a_calls - 10).abs() <= 2, "expected roughly even split, got {a_calls}/{o_calls}");
}

#[tokio::test]
async fn cooled_down_model_falls_back_to_configured_successor() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));
    conductor
        .config()
        .set_fallback_config(FallbackConfig {
            direct: HashMap::from([("opus".to_string(), "sonnet".to_string())]),
            chain: Vec::new(),
        });

    let now = SystemTime::now();
    let mut credential = fresh_credential("c1", "anthropic");
    credential.model_state_mut("opus", now).unavailable = true;
    credential.model_state_mut("opus", now).next_retry_after = Some(now + Duration::from_secs(3600));
    conductor.register(credential).await;

    let executor = Arc::new(FakeExecutor::new("anthropic"));
    conductor.register_executor(executor.clone()).await;

    let response = conductor
        .execute(request("opus"), ExecuteOptions::default())
        .await
        .expect("falls back to sonnet");
    assert_eq!(response.actual_model, "sonnet");
    assert_eq!(executor.calls(), vec!["sonnet".to_string()]);
}

#[tokio::test]
async fn non_cooldown_upstream_error_does_not_trigger_model_fallback() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));
    conductor
        .config()
        .set_fallback_config(FallbackConfig {
            direct: HashMap::from([("gpt".to_string(), "gpt-fallback".to_string())]),
            chain: Vec::new(),
        });

    conductor.register(fresh_credential("c1", "anthropic")).await;
    let executor = Arc::new(FakeExecutor::new("anthropic").script("gpt", vec![ScriptedOutcome::StatusError(500)]));
    conductor.register_executor(executor.clone()).await;

    let err = conductor
        .execute(request("gpt"), ExecuteOptions::default())
        .await
        .unwrap_err();
    // A plain upstream failure never turns into a cross-model cooldown
    // cascade; only a `ModelCooldownError` from the selector does that.
    assert!(!matches!(err, ExecuteError::Cooldown(_)));
    assert_eq!(executor.calls(), vec!["gpt".to_string()]);

    let stored = conductor.get_by_id("c1").await.unwrap();
    assert!(stored.model_states.contains_key("gpt"));
}

#[tokio::test]
async fn oauth_alias_round_robins_across_mapped_upstream_names() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));

    let mut credential = fresh_credential("c1", "glm");
    credential.attributes.set("auth_kind", "oauth");
    conductor.register(credential).await;

    conductor.model_mapping().replace(HashMap::from([(
        "glm:oauth".to_string(),
        vec![("up1".to_string(), "gp".to_string()), ("up2".to_string(), "gp".to_string())],
    )]));

    let executor = Arc::new(FakeExecutor::new("glm"));
    conductor.register_executor(executor.clone()).await;

    conductor.execute(request("gp"), ExecuteOptions::default()).await.unwrap();
    conductor.execute(request("gp"), ExecuteOptions::default()).await.unwrap();

    assert_eq!(executor.calls(), vec!["up1".to_string(), "up2".to_string()]);
}

#[tokio::test]
async fn high_priority_credential_yields_to_low_priority_once_cooled_down() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));

    let mut high = fresh_credential("high", "anthropic");
    high.attributes.set("priority", "10");
    conductor.register(high).await;
    conductor.register(fresh_credential("low", "anthropic")).await;

    let executor = Arc::new(FakeExecutor::new("anthropic").script("m1", vec![ScriptedOutcome::StatusError(500)]));
    conductor.register_executor(executor.clone()).await;

    // The high-priority credential takes the first attempt, fails, and the
    // hot loop falls through to the low-priority one within the same call.
    let response = conductor
        .execute(request("m1"), ExecuteOptions::default())
        .await
        .expect("falls through to the low-priority credential");
    assert_eq!(response.actual_model, "m1");
    assert_eq!(executor.calls(), vec!["m1".to_string(), "m1".to_string()]);

    let high_record = conductor.get_by_id("high").await.unwrap();
    assert!(high_record.model_states.get("m1").is_some_and(|s| s.unavailable));
}

#[tokio::test]
async fn three_model_fallback_chain_cascades_through_cooldowns_to_success() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));
    conductor.config().set_fallback_config(FallbackConfig {
        direct: HashMap::new(),
        chain: vec!["opus".to_string(), "sonnet".to_string(), "glm-4.7".to_string()],
    });

    let now = SystemTime::now();
    let mut credential = fresh_credential("c1", "anthropic");
    credential.model_state_mut("opus", now).unavailable = true;
    credential.model_state_mut("opus", now).next_retry_after = Some(now + Duration::from_secs(3600));
    credential.model_state_mut("sonnet", now).unavailable = true;
    credential.model_state_mut("sonnet", now).next_retry_after = Some(now + Duration::from_secs(3600));
    conductor.register(credential).await;

    let executor = Arc::new(FakeExecutor::new("anthropic"));
    conductor.register_executor(executor.clone()).await;

    let response = conductor
        .execute(request("opus"), ExecuteOptions::default())
        .await
        .expect("cascades through both cooldowns to the chain's last model");
    assert_eq!(response.actual_model, "glm-4.7");
    assert_eq!(executor.calls(), vec!["glm-4.7".to_string()]);
}

#[tokio::test]
async fn failed_upstream_retries_remaining_mapped_names_within_one_call() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));

    let mut credential = fresh_credential("c1", "glm");
    credential.attributes.set("auth_kind", "oauth");
    conductor.register(credential).await;

    conductor.model_mapping().replace(HashMap::from([(
        "glm:oauth".to_string(),
        vec![
            ("up1".to_string(), "gp".to_string()),
            ("up2".to_string(), "gp".to_string()),
            ("up3".to_string(), "gp".to_string()),
        ],
    )]));

    let executor = Arc::new(FakeExecutor::new("glm").script("up1", vec![ScriptedOutcome::StatusError(500)]));
    conductor.register_executor(executor.clone()).await;

    // A single `execute()` call should walk `remaining_after` itself; no
    // second call or outer retry is needed for the alias to recover.
    let response = conductor
        .execute(request("gp"), ExecuteOptions::default())
        .await
        .expect("retries the next mapped upstream after the first fails");
    assert_eq!(response.actual_model, "up2");
    assert_eq!(executor.calls(), vec!["up1".to_string(), "up2".to_string()]);
}

#[tokio::test]
async fn all_mapped_upstreams_failing_synthesizes_all_upstream_models_failed() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));

    let mut credential = fresh_credential("c1", "glm");
    credential.attributes.set("auth_kind", "oauth");
    conductor.register(credential).await;

    conductor.model_mapping().replace(HashMap::from([(
        "glm:oauth".to_string(),
        vec![("up1".to_string(), "gp".to_string()), ("up2".to_string(), "gp".to_string())],
    )]));

    let executor = Arc::new(
        FakeExecutor::new("glm")
            .script("up1", vec![ScriptedOutcome::StatusError(500)])
            .script("up2", vec![ScriptedOutcome::StatusError(503)]),
    );
    conductor.register_executor(executor.clone()).await;

    let err = conductor
        .execute(request("gp"), ExecuteOptions::default())
        .await
        .unwrap_err();

    match err {
        ExecuteError::Dispatch(dispatch_err) => {
            assert_eq!(dispatch_err.code, relay_dispatch::ErrorCode::AllUpstreamModelsFailed);
            assert_eq!(dispatch_err.http_status, Some(503));
        }
        other => panic!("expected a synthesized all-upstream-models-failed error, got {other:?}"),
    }
    assert_eq!(executor.calls(), vec!["up1".to_string(), "up2".to_string()]);
}

struct MidStreamFailureExecutor;

#[async_trait]
impl Executor for MidStreamFailureExecutor {
    fn identifier(&self) -> &str {
        "streamy"
    }

    async fn execute(
        &self,
        _credential: &CredentialRecord,
        request: &DispatchRequest,
        _options: &ExecuteOptions,
    ) -> Result<DispatchResponse, ExecutorError> {
        Ok(DispatchResponse {
            payload: Value::Null,
            actual_model: request.model.clone(),
        })
    }

    async fn execute_stream(
        &self,
        _credential: &CredentialRecord,
        _request: &DispatchRequest,
        _options: &ExecuteOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>, ExecutorError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx.send(StreamChunk::Payload(bytes::Bytes::from_static(b"partial"))).await;
            let _ = tx.send(StreamChunk::Error("upstream disconnected".to_string())).await;
        });
        Ok(rx)
    }

    async fn count_tokens(&self, _credential: &CredentialRecord, _request: &DispatchRequest) -> Result<u64, ExecutorError> {
        Ok(0)
    }

    async fn refresh(&self, _credential: &CredentialRecord) -> Result<Option<CredentialRecord>, ExecutorError> {
        Ok(None)
    }
}

#[tokio::test]
async fn mid_stream_error_chunk_records_exactly_one_failure() {
    let conductor = Conductor::new(Arc::new(RoundRobinSelector::new(CursorMode::ProviderBased)));
    conductor.register(fresh_credential("c1", "streamy")).await;
    conductor.register_executor(Arc::new(MidStreamFailureExecutor)).await;

    let mut rx = conductor
        .execute_stream(request("m1"), ExecuteOptions::default())
        .await
        .unwrap();

    let mut chunks = Vec::new();
    while let Some(chunk) = rx.recv().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), 2);

    let record = conductor.get_by_id("c1").await.unwrap();
    let state = record.model_states.get("m1").expect("one failure recorded for this model");
    assert!(state.unavailable);
}
