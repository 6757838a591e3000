//! Anthropic Claude adapter — chat completions, unary and streaming.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::*;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: String, base_url: Option<String>, timeouts: &AdapterTimeouts) -> Self {
        Self {
            client: build_http_client(timeouts),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            api_key,
        }
    }

    fn body(&self, req: &CompletionRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| serde_json::json!({"role": &m.role, "content": &m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": &req.model,
            "max_tokens": req.max_tokens.unwrap_or(4096),
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = req.messages.iter().find(|m| m.role == "system") {
            body["system"] = serde_json::json!(system.content);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(req, false))
            .send()
            .await
            .map_err(|e| ProviderError::transport("anthropic", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("anthropic", &req.model, status, &body));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::transport("anthropic", &req.model, e.to_string()))?;

        let content = body["content"][0]["text"].as_str().unwrap_or("").to_string();
        let usage = Usage {
            prompt_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            completion_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        };

        Ok(CompletionResult {
            provider: "anthropic".to_string(),
            model: req.model.clone(),
            content,
            usage,
            finish_reason: body["stop_reason"].as_str().map(str::to_string),
            raw: body,
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.body(req, true))
            .send()
            .await
            .map_err(|e| ProviderError::transport("anthropic", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("anthropic", &req.model, status, &body));
        }

        let (tx, rx) = mpsc::channel(32);
        let provider = "anthropic".to_string();
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
                    let Ok(v) = serde_json::from_str::<Value>(payload) else { continue };
                    match v["type"].as_str() {
                        Some("content_block_delta") => {
                            let delta = v["delta"]["text"].as_str().unwrap_or("").to_string();
                            let out = StreamChunk {
                                provider: provider.clone(),
                                model: model.clone(),
                                delta,
                                usage: None,
                                finish_reason: None,
                            };
                            if tx.send(Ok(out)).await.is_err() {
                                return;
                            }
                        }
                        Some("message_delta") => {
                            let finish_reason = v["delta"]["stop_reason"].as_str().map(str::to_string);
                            let usage = v["usage"]["output_tokens"].as_u64().map(|out| Usage {
                                prompt_tokens: 0,
                                completion_tokens: out,
                            });
                            let out = StreamChunk {
                                provider: provider.clone(),
                                model: model.clone(),
                                delta: String::new(),
                                usage,
                                finish_reason,
                            };
                            if tx.send(Ok(out)).await.is_err() {
                                return;
                            }
                        }
                        Some("message_stop") => return,
                        _ => continue,
                    }
                }
            }
        });

        Ok(rx)
    }

    fn estimate_cost(&self, model: &str, usage: &Usage) -> f64 {
        let (input_rate, output_rate) = match model {
            m if m.contains("opus") => (15.0 / 1_000_000.0, 75.0 / 1_000_000.0),
            m if m.contains("haiku") => (0.25 / 1_000_000.0, 1.25 / 1_000_000.0),
            m if m.contains("sonnet") => (3.0 / 1_000_000.0, 15.0 / 1_000_000.0),
            _ => (3.0 / 1_000_000.0, 15.0 / 1_000_000.0),
        };
        usage.prompt_tokens as f64 * input_rate + usage.completion_tokens as f64 * output_rate
    }
}
