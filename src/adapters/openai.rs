use super::{ChatRequest, LlmTransport};
use crate::config::LlmSettings;
use crate::errors::TransportError;
use crate::redaction::scrub_remote_text;

/// Blocking client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiTransport {
    settings: LlmSettings,
    agent: ureq::Agent,
}

impl OpenAiTransport {
    pub fn new(settings: LlmSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self { settings, agent }
    }

    fn endpoint(&self) -> Result<String, TransportError> {
        let base = self
            .settings
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TransportError::NotConfigured("Missing LLAMA_API_BASE".to_string()))?;
        Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
    }

    fn api_key(&self) -> Result<&str, TransportError> {
        self.settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| TransportError::NotConfigured("Missing LLAMA_API_KEY".to_string()))
    }
}

impl LlmTransport for OpenAiTransport {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn complete(&self, request: &ChatRequest) -> Result<String, TransportError> {
        let url = self.endpoint()?;
        let key = self.api_key()?;

        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": request.messages,
            "temperature": request.temperature,
        });

        let response = self
            .agent
            .post(&url)
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", key))
            .send_json(body)
            .map_err(map_ureq_error)?;

        let payload: serde_json::Value = response
            .into_json()
            .map_err(|error| TransportError::Response(error.to_string()))?;
        extract_content(&payload)
    }
}

fn map_ureq_error(error: ureq::Error) -> TransportError {
    match error {
        ureq::Error::Status(status, response) => TransportError::Status {
            status,
            body: scrub_remote_text(&response.into_string().unwrap_or_default()),
        },
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            let lower = message.to_ascii_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") {
                TransportError::Timeout(message)
            } else {
                TransportError::Network(message)
            }
        }
    }
}

fn extract_content(payload: &serde_json::Value) -> Result<String, TransportError> {
    payload
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| TransportError::Response("response has no choices[0].message.content".to_string()))
}
