//! OpenAI adapter — chat completions, unary and streaming.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::*;

pub struct OpenAIAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAIAdapter {
    pub fn new(api_key: String, base_url: Option<String>, timeouts: &AdapterTimeouts) -> Self {
        Self {
            client: build_http_client(timeouts),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
        }
    }

    fn body(&self, req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": &m.role, "content": &m.content}))
            .collect();
        serde_json::json!({
            "model": &req.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(4096),
            "temperature": req.temperature.unwrap_or(0.7),
            "stream": stream,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(req, false))
            .send()
            .await
            .map_err(|e| ProviderError::transport("openai", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error("openai", &req.model, status, &body));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport("openai", &req.model, e.to_string()))?;

        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
        let usage = body["usage"]["prompt_tokens"]
            .as_u64()
            .map(|p| Usage {
                prompt_tokens: p,
                completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            })
            .unwrap_or_else(|| {
                let prompt_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
                Usage::estimate(prompt_chars, content.len())
            });

        Ok(CompletionResult {
            provider: "openai".to_string(),
            model: req.model.clone(),
            content,
            usage,
            finish_reason: body["choices"][0]["finish_reason"].as_str().map(str::to_string),
            raw: body,
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.body(req, true))
            .send()
            .await
            .map_err(|e| ProviderError::transport("openai", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status_error("openai", &req.model, status, &body));
        }

        let (tx, rx) = mpsc::channel(32);
        let provider = "openai".to_string();
        let model = req.model.clone();

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::transport(&provider, &model, e.to_string())))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else { continue };
                    if payload == "[DONE]" {
                        return;
                    }
                    let Ok(v) = serde_json::from_str::<serde_json::Value>(payload) else { continue };
                    let delta = v["choices"][0]["delta"]["content"].as_str().unwrap_or("").to_string();
                    let finish_reason = v["choices"][0]["finish_reason"].as_str().map(str::to_string);
                    let done = finish_reason.is_some();
                    let out = StreamChunk {
                        provider: provider.clone(),
                        model: model.clone(),
                        delta,
                        usage: None,
                        finish_reason,
                    };
                    if tx.send(Ok(out)).await.is_err() {
                        return;
                    }
                    if done {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn estimate_cost(&self, model: &str, usage: &Usage) -> f64 {
        let (input_rate, output_rate) = match model {
            m if m.contains("gpt-4o-mini") => (0.15 / 1000.0, 0.60 / 1000.0),
            m if m.contains("gpt-4o") => (2.5 / 1000.0, 10.0 / 1000.0),
            _ => (2.5 / 1000.0, 10.0 / 1000.0),
        };
        (usage.prompt_tokens as f64 / 1000.0) * input_rate + (usage.completion_tokens as f64 / 1000.0) * output_rate
    }
}

/// Map an HTTP status + body into a `ProviderError` per the spec's typical mapping:
/// 429/5xx transient ⇒ retryable; 4xx client errors ⇒ non-retryable but fall back.
pub(crate) fn map_status_error(provider: &str, model: &str, status: u16, body: &str) -> ProviderError {
    let message = if body.len() > 300 { &body[..300] } else { body };
    if status == 429 || status >= 500 {
        ProviderError::transient(provider, model, status, message.to_string())
    } else {
        ProviderError::client(provider, model, status, message.to_string())
    }
}
