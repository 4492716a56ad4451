//! Anthropic Messages API backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    status_for_http, status_for_transport, BackendReply, CompletionBackend, CompletionRequest,
    CompletionStatus,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicResponse {
    /// Extracts the text content from the first text block.
    fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// One Anthropic model exposed as a completion backend.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    model: String,
    url: String,
}

impl AnthropicBackend {
    pub fn new(model: String, api_key: String, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
            model,
            url: ANTHROPIC_API_URL.to_string(),
        })
    }
}

#[async_trait]
impl CompletionBackend for AnthropicBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> BackendReply {
        let body = AnthropicRequest {
            model: &self.model,
            max_tokens: request.params.max_tokens,
            temperature: request.params.temperature,
            system: &request.system,
            messages: vec![AnthropicMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = match self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return BackendReply::failed(status_for_transport(&e), e.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            warn!("Anthropic API returned {} for {}: {}", status, self.model, message);
            return BackendReply::failed(status_for_http(status.as_u16()), message);
        }

        let parsed: AnthropicResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => return BackendReply::failed(status_for_transport(&e), e.to_string()),
        };

        debug!(
            "Anthropic call succeeded: model={}, input_tokens={}, output_tokens={}",
            self.model, parsed.usage.input_tokens, parsed.usage.output_tokens
        );

        if parsed.stop_reason.as_deref() == Some("refusal") {
            return BackendReply::failed(CompletionStatus::Refused, "model refused the request");
        }

        match parsed.text() {
            Some(text) => BackendReply::ok(text),
            None => BackendReply::failed(CompletionStatus::Refused, "no text block in response"),
        }
    }
}
