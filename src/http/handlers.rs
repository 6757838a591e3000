//! Route handlers — each one extracts state, calls the auth gate, then
//! delegates to the domain layer (`Router`, `ModelRegistry`, catalogue
//! store) and frames the response.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::adapters::{CompletionRequest, Message};
use crate::error::GatewayError;
use crate::registry::ModelConfig;
use crate::router::{CacheOpts, FallbackOpts, RouteOutcome, RouterDecision};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequestBody {
    model: String,
    messages: Vec<Message>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    tools: Option<Vec<Value>>,
    #[serde(default)]
    tool_choice: Option<Value>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    cache: CacheOpts,
    #[serde(default)]
    fallback: FallbackOpts,
    #[serde(default)]
    metadata: Option<RequestMetadata>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RequestMetadata {
    conversation_id: Option<String>,
    tags: Option<Vec<String>>,
}

fn client_ip(connect_info: &SocketAddr, headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| connect_info.ip().to_string())
}

fn decision_headers(headers: &mut HeaderMap, decision: &RouterDecision, auth_cache_hit: bool, auth_latency_ms: u64, request_id: &str) {
    headers.insert("x-provider", HeaderValue::from_str(&decision.provider).unwrap_or(HeaderValue::from_static("")));
    headers.insert("x-model", HeaderValue::from_str(&decision.provider_model).unwrap_or(HeaderValue::from_static("")));
    headers.insert("x-cache", HeaderValue::from_static(if decision.from_cache { "HIT" } else { "MISS" }));
    headers.insert("x-auth-cache", HeaderValue::from_static(if auth_cache_hit { "HIT" } else { "MISS" }));
    headers.insert("x-auth-cache-latency-ms", HeaderValue::from(auth_latency_ms));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequestBody>,
) -> Result<Response, GatewayError> {
    let ip = client_ip(&addr, &headers);
    let auth = state.auth.authenticate(&headers, &ip)?;
    let (ctx, rate_limit, auth_cache_hit, auth_latency_ms) = (auth.context, auth.rate_limit, auth.cache_hit, auth.latency_ms);

    let request_id = body.request_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut metadata = HashMap::new();
    if let Some(m) = body.metadata {
        if let Some(cid) = m.conversation_id {
            metadata.insert("conversation_id".to_string(), json!(cid));
        }
        if let Some(tags) = m.tags {
            metadata.insert("tags".to_string(), json!(tags));
        }
    }

    let req = CompletionRequest {
        model: body.model,
        messages: body.messages,
        temperature: body.temperature,
        max_tokens: body.max_tokens,
        tools: body.tools,
        tool_choice: body.tool_choice,
        request_id: request_id.clone(),
        metadata,
    };

    let streaming = body.stream.unwrap_or(false);
    let outcome = state
        .router
        .route(req, body.cache, body.fallback, &ctx.user_id, &ctx.org_id, streaming)
        .await?;

    let mut response = match outcome {
        RouteOutcome::Completed { decision, result } => {
            let wire = json!({
                "id": request_id,
                "object": "chat.completion",
                "model": decision.provider_model,
                "choices": [{
                    "message": {"role": "assistant", "content": result.content},
                    "finish_reason": result.finish_reason,
                    "index": 0,
                }],
                "usage": {
                    "prompt_tokens": result.usage.prompt_tokens,
                    "completion_tokens": result.usage.completion_tokens,
                    "total_tokens": result.usage.total_tokens(),
                },
            });
            let mut response = (StatusCode::OK, Json(wire)).into_response();
            decision_headers(response.headers_mut(), &decision, auth_cache_hit, auth_latency_ms, &request_id);
            response
        }
        RouteOutcome::Stream { decision, adapter, request, permit } => {
            let chunk_stream = adapter.stream(&request).await.map_err(GatewayError::AllProvidersFailed)?;
            let wire_id = request_id.clone();
            // The permit rides along in the unfold state so the provider's
            // concurrency slot stays held for the stream's whole lifetime.
            let body_stream = futures::stream::unfold((chunk_stream, permit), move |(mut rx, permit)| {
                let wire_id = wire_id.clone();
                async move {
                    match rx.recv().await {
                        Some(Ok(chunk)) => {
                            let wire = json!({
                                "id": wire_id,
                                "object": "chat.completion.chunk",
                                "choices": [{
                                    "delta": {"content": chunk.delta},
                                    "finish_reason": chunk.finish_reason,
                                }],
                            });
                            let mut line = serde_json::to_string(&wire).unwrap_or_default();
                            line.push('\n');
                            Some((Ok::<_, std::io::Error>(axum::body::Bytes::from(line)), (rx, permit)))
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "stream terminated with a provider error");
                            None
                        }
                        None => None,
                    }
                }
            });
            let mut response = Response::new(axum::body::Body::from_stream(body_stream));
            response.headers_mut().insert("content-type", HeaderValue::from_static("application/json"));
            decision_headers(response.headers_mut(), &decision, auth_cache_hit, auth_latency_ms, &request_id);
            response
        }
    };

    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(rate_limit.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(rate_limit.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(rate_limit.reset_unix_ts.max(0) as u64));

    Ok(response)
}

#[derive(Serialize)]
pub struct HealthBody {
    status: &'static str,
    registry_models: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody { status: "ok", registry_models: state.registry.list(None, None).len() })
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

fn require_admin(headers: &HeaderMap, addr: &SocketAddr, state: &AppState) -> Result<(), GatewayError> {
    let ip = client_ip(addr, headers);
    let auth = state.auth.authenticate(headers, &ip)?;
    if !auth.context.permissions.can_manage_keys {
        return Err(GatewayError::InsufficientPermission);
    }
    Ok(())
}

pub async fn list_models(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<ModelConfig>>, GatewayError> {
    require_admin(&headers, &addr, &state)?;
    let models = state.catalogue.list_all_models().map_err(GatewayError::Internal)?;
    Ok(Json(models))
}

pub async fn create_model(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(model): Json<ModelConfig>,
) -> Result<StatusCode, GatewayError> {
    require_admin(&headers, &addr, &state)?;
    state.catalogue.upsert_model(&model).map_err(GatewayError::Internal)?;
    state.registry.refresh();
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct UpdateModelBody {
    is_active: bool,
}

pub async fn update_model(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateModelBody>,
) -> Result<StatusCode, GatewayError> {
    require_admin(&headers, &addr, &state)?;
    let found = state.catalogue.set_active(&id, body.is_active).map_err(GatewayError::Internal)?;
    if !found {
        return Err(GatewayError::ModelNotFound(id));
    }
    state.registry.refresh();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deactivate_model(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    require_admin(&headers, &addr, &state)?;
    let found = state.catalogue.set_active(&id, false).map_err(GatewayError::Internal)?;
    if !found {
        return Err(GatewayError::ModelNotFound(id));
    }
    state.registry.refresh();
    Ok(StatusCode::NO_CONTENT)
}
