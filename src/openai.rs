use std::time::Duration;

use anyhow::Context as _;

/// Minimal client for the OpenAI Responses API.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl OpenAiClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_output_tokens: u32,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: responses_endpoint(base_url),
            api_key: api_key.into(),
            model: model.into(),
            temperature,
            max_output_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one request and returns the concatenated `output_text` parts.
    pub async fn respond(&self, instructions: &str, input: &str) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "input": input,
            "text": { "format": { "type": "text" } },
            "max_output_tokens": self.max_output_tokens,
            "store": false,
        });

        if !instructions.is_empty()
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("instructions".to_owned(), serde_json::json!(instructions));
        }

        // NOTE: GPT-5 family models reject sampling params like `temperature`.
        if !self.model.starts_with("gpt-5")
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert(
                "temperature".to_owned(),
                serde_json::json!(self.temperature),
            );
        }

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read OpenAI response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            anyhow::bail!("OpenAI API error ({status}): {message}");
        }

        let value: serde_json::Value = serde_json::from_str(&raw).context("parse OpenAI response")?;
        extract_output_text(&value)
    }
}

pub(crate) fn responses_endpoint(base_url: &str) -> String {
    format!("{}/responses", base_url.trim_end_matches('/'))
}

pub(crate) fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    Some(value.get("error")?.get("message")?.as_str()?.to_owned())
}

fn extract_output_text(value: &serde_json::Value) -> anyhow::Result<String> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("missing `output` array in response"))?;

    let text = output
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect::<String>();

    if text.trim().is_empty() {
        anyhow::bail!("OpenAI output text is empty");
    }
    Ok(text)
}
