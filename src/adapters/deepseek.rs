//! DeepSeek adapter — OpenAI-compatible chat completions API.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::*;

pub struct DeepSeekAdapter { client: reqwest::Client, api_key: String }

impl DeepSeekAdapter {
    pub fn new(api_key: String, timeouts: &AdapterTimeouts) -> Self {
        Self { client: build_http_client(timeouts), api_key }
    }

    fn body(&self, req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req.messages.iter()
            .map(|m| serde_json::json!({"role": &m.role, "content": &m.content})).collect();
        serde_json::json!({"model": &req.model, "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(4096), "stream": stream})
    }
}

#[async_trait]
impl ProviderAdapter for DeepSeekAdapter {
    fn provider_id(&self) -> &str { "deepseek" }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let resp = self.client.post("https://api.deepseek.com/chat/completions")
            .bearer_auth(&self.api_key).json(&self.body(req, false)).send().await
            .map_err(|e| ProviderError::transport("deepseek", &req.model, e.to_string()))?;
        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("deepseek", &req.model, status, &body));
        }
        let body: serde_json::Value = resp.json().await
            .map_err(|e| ProviderError::transport("deepseek", &req.model, e.to_string()))?;
        let content = body["choices"][0]["message"]["content"].as_str().unwrap_or("").to_string();
        let usage = Usage {
            prompt_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        };
        Ok(CompletionResult { provider: "deepseek".to_string(), model: req.model.clone(), content, usage,
            finish_reason: body["choices"][0]["finish_reason"].as_str().map(str::to_string), raw: body })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let resp = self.client.post("https://api.deepseek.com/chat/completions")
            .bearer_auth(&self.api_key).json(&self.body(req, true)).send().await
            .map_err(|e| ProviderError::transport("deepseek", &req.model, e.to_string()))?;
        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("deepseek", &req.model, status, &body));
        }
        let (tx, rx) = mpsc::channel(32);
        let (provider, model) = ("deepseek".to_string(), req.model.clone());
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let Ok(bytes) = chunk else { return };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data: ") else { continue };
                    if payload == "[DONE]" { return }
                    let Ok(v) = serde_json::from_str::<serde_json::Value>(payload) else { continue };
                    let finish_reason = v["choices"][0]["finish_reason"].as_str().map(str::to_string);
                    let done = finish_reason.is_some();
                    let out = StreamChunk { provider: provider.clone(), model: model.clone(),
                        delta: v["choices"][0]["delta"]["content"].as_str().unwrap_or("").to_string(),
                        usage: None, finish_reason };
                    if tx.send(Ok(out)).await.is_err() || done { return }
                }
            }
        });
        Ok(rx)
    }

    fn estimate_cost(&self, _model: &str, usage: &Usage) -> f64 {
        let (ir, or) = (0.14 / 1e6, 0.28 / 1e6);
        usage.prompt_tokens as f64 * ir + usage.completion_tokens as f64 * or
    }
}
