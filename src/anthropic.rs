use std::time::Duration;

use anyhow::Context as _;

use crate::openai::parse_error_message;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Minimal client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: messages_endpoint(base_url),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one user message and returns the concatenated `text` blocks.
    pub async fn respond(&self, system: &str, input: &str) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": input }],
        });
        if !system.is_empty()
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("system".to_owned(), serde_json::json!(system));
        }

        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .context("read Anthropic response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            anyhow::bail!("Anthropic API error ({status}): {message}");
        }

        let value: serde_json::Value =
            serde_json::from_str(&raw).context("parse Anthropic response")?;
        extract_text(&value)
    }
}

pub fn messages_endpoint(base_url: &str) -> String {
    format!("{}/messages", base_url.trim_end_matches('/'))
}

fn extract_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let content = value
        .get("content")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `content` array in response"))?;

    let text = content
        .iter()
        .filter(|block| block.get("type").and_then(|v| v.as_str()) == Some("text"))
        .filter_map(|block| block.get("text").and_then(|v| v.as_str()))
        .collect::<String>();

    if text.trim().is_empty() {
        let stop = value
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        anyhow::bail!("Anthropic output text is empty (stop_reason: {stop})");
    }
    Ok(text)
}
