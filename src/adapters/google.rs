//! Google Gemini adapter — generativelanguage REST API.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use super::*;

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleAdapter { client: reqwest::Client, api_key: String }

impl GoogleAdapter {
    pub fn new(api_key: String, timeouts: &AdapterTimeouts) -> Self {
        Self { client: build_http_client(timeouts), api_key }
    }

    fn body(&self, req: &CompletionRequest) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        for msg in &req.messages {
            if msg.role == "system" {
                continue;
            }
            let role = if msg.role == "assistant" { "model" } else { "user" };
            contents.push(serde_json::json!({"role": role, "parts": [{"text": &msg.content}]}));
        }

        let mut body = serde_json::json!({ "contents": contents });
        if let Some(sys) = req.messages.iter().find(|m| m.role == "system") {
            body["systemInstruction"] = serde_json::json!({"parts": [{"text": &sys.content}]});
        }

        let mut gen_config = serde_json::json!({});
        if let Some(t) = req.temperature {
            gen_config["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(m);
        }
        body["generationConfig"] = gen_config;
        body
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
    fn provider_id(&self) -> &str { "google" }

    async fn complete(&self, req: &CompletionRequest) -> Result<CompletionResult, ProviderError> {
        let url = format!("{}/models/{}:generateContent?key={}", BASE_URL, req.model, self.api_key);
        let resp = self.client.post(&url).json(&self.body(req)).send().await
            .map_err(|e| ProviderError::transport("google", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("google", &req.model, status, &body));
        }

        let body: Value = resp.json().await
            .map_err(|e| ProviderError::transport("google", &req.model, e.to_string()))?;
        let content = body["candidates"][0]["content"]["parts"][0]["text"].as_str().unwrap_or("").to_string();
        let usage = Usage {
            prompt_tokens: body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            completion_tokens: body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
        };
        let finish_reason = body["candidates"][0]["finishReason"].as_str().map(str::to_string);

        Ok(CompletionResult {
            provider: "google".to_string(),
            model: req.model.clone(),
            content,
            usage,
            finish_reason,
            raw: body,
        })
    }

    async fn stream(&self, req: &CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse&key={}", BASE_URL, req.model, self.api_key);
        let resp = self.client.post(&url).json(&self.body(req)).send().await
            .map_err(|e| ProviderError::transport("google", &req.model, e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp.text().await.unwrap_or_default();
            return Err(openai::map_status_error("google", &req.model, status, &body));
        }

        let (tx, rx) = mpsc::channel(32);
        let (provider, model) = ("google".to_string(), req.model.clone());

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
                    let Ok(v) = serde_json::from_str::<Value>(payload) else { continue };
                    let finish_reason = v["candidates"][0]["finishReason"].as_str().map(str::to_string);
                    let done = finish_reason.is_some();
                    let out = StreamChunk {
                        provider: provider.clone(),
                        model: model.clone(),
                        delta: v["candidates"][0]["content"]["parts"][0]["text"].as_str().unwrap_or("").to_string(),
                        usage: v["usageMetadata"]["candidatesTokenCount"].as_u64().map(|c| Usage {
                            prompt_tokens: v["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
                            completion_tokens: c,
                        }),
                        finish_reason,
                    };
                    if tx.send(Ok(out)).await.is_err() || done {
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn estimate_cost(&self, model: &str, usage: &Usage) -> f64 {
        let (input_rate, output_rate) = match model {
            m if m.contains("2.5-pro") || m.contains("3-pro") => (1.25 / 1_000_000.0, 10.0 / 1_000_000.0),
            m if m.contains("flash-lite") => (0.0, 0.0),
            m if m.contains("flash") => (0.15 / 1_000_000.0, 0.60 / 1_000_000.0),
            _ => (0.0, 0.0),
        };
        usage.prompt_tokens as f64 * input_rate + usage.completion_tokens as f64 * output_rate
    }
}
