//! Local model endpoint (Ollama-compatible HTTP API).
//!
//! Both the alert sentence generator and the advisory reasoning engine talk to
//! the same kind of endpoint with a blocking client; neither is ever called on
//! a path that the frame loop waits on for longer than the configured timeout.

use reqwest::blocking::Client;
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

use crate::advisory::ReasoningEngine;
use crate::alert_text::TextGenerator;
use crate::error::{Result, WatchError};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: Url,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = parse_endpoint(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| WatchError::LlmRequest {
                context: "client build failed".to_string(),
                source,
            })?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Single non-streaming completion; returns the trimmed response text.
    pub fn generate(&self, model: &str, prompt: &str, options: Value) -> Result<String> {
        let payload = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": options,
        });
        let value = self.post_json("api/generate", &payload)?;
        extract_response_text(&value)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| WatchError::LlmResponse("missing response field".to_string()))
    }

    /// Fails when the endpoint does not serve `model`.
    pub fn show_model(&self, model: &str) -> Result<()> {
        let payload = serde_json::json!({ "model": model, "name": model });
        self.post_json("api/show", &payload).map(|_| ())
    }

    fn post_json(&self, path: &str, payload: &Value) -> Result<Value> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| WatchError::InvalidEndpoint(format!("{}: {}", path, err)))?;
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .map_err(|source| WatchError::LlmRequest {
                context: format!("POST {}", path),
                source,
            })?;
        if !response.status().is_success() {
            return Err(WatchError::LlmResponse(format!(
                "non-success status: {}",
                response.status()
            )));
        }
        response.json::<Value>().map_err(|source| WatchError::LlmRequest {
            context: "invalid json response".to_string(),
            source,
        })
    }
}

/// Alert sentence generator backed by a general instruction model.
pub struct OllamaTextGenerator {
    client: OllamaClient,
    model: String,
}

impl OllamaTextGenerator {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

impl TextGenerator for OllamaTextGenerator {
    fn generate_text(&self, prompt: &str) -> Result<String> {
        self.client
            .generate(&self.model, prompt, serde_json::json!({ "temperature": 0.1 }))
    }
}

/// Advisory reasoning engine backed by the fine-tuned function-calling model.
pub struct OllamaReasoner {
    client: OllamaClient,
    model: String,
    loaded: bool,
}

impl OllamaReasoner {
    pub fn new(client: OllamaClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            loaded: false,
        }
    }
}

impl ReasoningEngine for OllamaReasoner {
    fn load(&mut self) -> Result<()> {
        self.client.show_model(&self.model)?;
        self.loaded = true;
        Ok(())
    }

    fn complete(&mut self, prompt: &str) -> Result<String> {
        if !self.loaded {
            return Err(WatchError::EngineNotLoaded);
        }
        self.client.generate(
            &self.model,
            prompt,
            serde_json::json!({ "temperature": 0.0, "num_predict": 40 }),
        )
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|err| WatchError::InvalidEndpoint(err.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(WatchError::InvalidEndpoint(format!(
                "unsupported scheme: {}",
                other
            )))
        }
    }
    // `join` drops the last path segment unless the base ends with '/'.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn extract_response_text(value: &Value) -> Option<String> {
    if let Some(content) = value.get("response").and_then(Value::as_str) {
        return Some(content.to_string());
    }
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_base_path() {
        let url = parse_endpoint("http://localhost:11434").unwrap();
        assert_eq!(
            url.join("api/generate").unwrap().as_str(),
            "http://localhost:11434/api/generate"
        );

        let url = parse_endpoint("http://127.0.0.1:8080/ollama").unwrap();
        assert_eq!(
            url.join("api/show").unwrap().as_str(),
            "http://127.0.0.1:8080/ollama/api/show"
        );
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!(matches!(
            parse_endpoint("ftp://localhost"),
            Err(WatchError::InvalidEndpoint(_))
        ));
        assert!(parse_endpoint("not a url").is_err());
    }

    #[test]
    fn extracts_generate_and_chat_shapes() {
        let generate = serde_json::json!({ "response": "Mr. Richard, a chair was removed." });
        assert_eq!(
            extract_response_text(&generate).as_deref(),
            Some("Mr. Richard, a chair was removed.")
        );
        let chat = serde_json::json!({ "message": { "content": "ignore_event()" } });
        assert_eq!(
            extract_response_text(&chat).as_deref(),
            Some("ignore_event()")
        );
        assert!(extract_response_text(&serde_json::json!({})).is_none());
    }

    #[test]
    fn reasoner_refuses_before_load() {
        let client = OllamaClient::new("http://localhost:11434", Duration::from_millis(50))
            .expect("client");
        let mut reasoner = OllamaReasoner::new(client, "stagewatch-gemma");
        assert!(matches!(
            reasoner.complete("scene"),
            Err(WatchError::EngineNotLoaded)
        ));
    }
}
