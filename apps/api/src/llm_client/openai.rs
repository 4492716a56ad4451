//! OpenAI-compatible chat-completions backend.
//!
//! Covers hosted OpenAI models as well as self-hosted inference servers that
//! speak the same wire format (TGI, vLLM, Ollama), which is how instruction-tuned
//! and conversational open models are usually served.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    status_for_http, status_for_transport, BackendReply, CompletionBackend, CompletionRequest,
    CompletionStatus,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(
        model: String,
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Reads `choices[0]` into a reply; `finish_reason == "content_filter"` is a refusal.
fn reply_from_body(body: &Value) -> BackendReply {
    if body.pointer("/choices/0/finish_reason").and_then(Value::as_str) == Some("content_filter") {
        return BackendReply::failed(CompletionStatus::Refused, "content filtered");
    }
    if let Some(refusal) = body
        .pointer("/choices/0/message/refusal")
        .and_then(Value::as_str)
    {
        return BackendReply::failed(CompletionStatus::Refused, refusal);
    }
    match body
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        Some(text) => BackendReply::ok(text),
        None => BackendReply::failed(CompletionStatus::Refused, "response missing content"),
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> BackendReply {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });

        let mut call = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            call = call.header("Authorization", format!("Bearer {key}"));
        }

        let response = match call.send().await {
            Ok(r) => r,
            Err(e) => return BackendReply::failed(status_for_transport(&e), e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Chat completions API returned {} for {}: {}", status, self.model, text);
            return BackendReply::failed(status_for_http(status.as_u16()), text);
        }

        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => return BackendReply::failed(status_for_transport(&e), e.to_string()),
        };
        debug!("Chat completion succeeded: model={}", self.model);
        reply_from_body(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_from_body_reads_first_choice() {
        let body = json!({"choices": [{"message": {"content": "hello"}, "finish_reason": "stop"}]});
        let reply = reply_from_body(&body);
        assert_eq!(reply.status, CompletionStatus::Ok);
        assert_eq!(reply.text, "hello");
    }

    #[test]
    fn test_content_filter_is_refusal() {
        let body = json!({"choices": [{"message": {"content": ""}, "finish_reason": "content_filter"}]});
        assert_eq!(reply_from_body(&body).status, CompletionStatus::Refused);
    }

    #[test]
    fn test_missing_content_is_refusal() {
        let body = json!({"choices": []});
        assert_eq!(reply_from_body(&body).status, CompletionStatus::Refused);
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let backend = OpenAiBackend::new(
            "mistral".to_string(),
            "http://localhost:8000/v1/".to_string(),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8000/v1/chat/completions");
    }
}
