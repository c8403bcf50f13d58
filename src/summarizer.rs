use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::anthropic::AnthropicClient;
use crate::cli::AiEngine;
use crate::config::AiConfig;
use crate::formats::SectionIndex;
use crate::metadata::Priority;
use crate::openai::OpenAiClient;

const TRUNCATION_MARKER: &str = "\n\n... [text truncated for length] ...\n";
const PING_PROMPT: &str = "Respond with only: OK";

#[derive(Debug, Clone, Serialize)]
pub struct SectionContext {
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub start_page: u32,
    pub end_page: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummarizeRequest {
    pub source_name: String,
    pub doc_title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_version: Option<String>,
    pub section: SectionContext,
    pub text_path: PathBuf,
    pub summary_path: PathBuf,
    pub index_path: PathBuf,
    pub text: String,
    pub truncated: bool,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn engine(&self) -> &'static str;

    fn describe(&self) -> String;

    async fn summarize(&self, request: &SummarizeRequest) -> anyhow::Result<String>;

    async fn check(&self) -> anyhow::Result<()>;
}

pub fn build_summarizer(config: &AiConfig) -> anyhow::Result<Box<dyn Summarizer>> {
    match config.engine {
        AiEngine::Command => {
            let Some(program) = config.command.clone() else {
                anyhow::bail!("missing --ai-command (required when --ai-engine=command)");
            };
            Ok(Box::new(CommandSummarizer {
                program,
                args: config.command_args.clone(),
            }))
        }
        AiEngine::Openai => {
            let Some(api_key) = config.keys.openai.clone() else {
                anyhow::bail!("OPENAI_API_KEY is not set");
            };
            let client = OpenAiClient::new(
                &config.openai_base_url,
                api_key,
                config.openai_model.clone(),
                config.temperature,
                config.max_output_tokens,
            )?;
            Ok(Box::new(OpenAiSummarizer { client }))
        }
        AiEngine::Anthropic => {
            let Some(api_key) = config.keys.anthropic.clone() else {
                anyhow::bail!("ANTHROPIC_API_KEY is not set");
            };
            let client = AnthropicClient::new(
                &config.anthropic_base_url,
                api_key,
                config.anthropic_model.clone(),
                config.temperature,
                config.max_output_tokens,
            )?;
            Ok(Box::new(AnthropicSummarizer { client }))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub engine: &'static str,
    pub provider: String,
    pub status: &'static str,
}

/// Runs [`Summarizer::check`] against the configured engine. Failures carry a
/// hint for the usual causes (bad key, unknown model).
pub async fn check_connection(config: &AiConfig) -> anyhow::Result<ConnectionCheck> {
    let summarizer = build_summarizer(config).context("configure AI engine")?;
    let provider = summarizer.describe();
    tracing::info!(engine = summarizer.engine(), %provider, "checking AI provider");

    if let Err(err) = summarizer.check().await {
        let context = match connection_hint(config, &format!("{err:#}")) {
            Some(hint) => format!("connection check failed for {provider} (hint: {hint})"),
            None => format!("connection check failed for {provider}"),
        };
        return Err(err.context(context));
    }

    Ok(ConnectionCheck {
        engine: summarizer.engine(),
        provider,
        status: "ok",
    })
}

fn connection_hint(config: &AiConfig, message: &str) -> Option<String> {
    let lower = message.to_ascii_lowercase();
    let (key_var, model) = match config.engine {
        AiEngine::Command => return None,
        AiEngine::Openai => ("OPENAI_API_KEY", config.openai_model.as_str()),
        AiEngine::Anthropic => ("ANTHROPIC_API_KEY", config.anthropic_model.as_str()),
    };
    if lower.contains("401") || lower.contains("authentication") || lower.contains("api key") {
        return Some(format!("API key invalid or not set; check {key_var}"));
    }
    if lower.contains("404") || lower.contains("not_found") || lower.contains("not found") {
        return Some(format!("model '{model}' not found"));
    }
    None
}

fn expect_ok_reply(reply: &str) -> anyhow::Result<()> {
    if !reply.to_ascii_uppercase().contains("OK") {
        anyhow::bail!("unexpected reply to connection check: {}", reply.trim());
    }
    Ok(())
}

pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..byte_idx]), true),
        None => (text.to_owned(), false),
    }
}

#[derive(Debug, Clone)]
pub struct CommandSummarizer {
    program: String,
    args: Vec<String>,
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    fn engine(&self) -> &'static str {
        "command"
    }

    fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn summarize(&self, request: &SummarizeRequest) -> anyhow::Result<String> {
        let input = serde_json::to_vec(request).context("serialize summarize request")?;
        let program = self.program.clone();
        let args = self.args.clone();
        let request = request.clone();

        tokio::task::spawn_blocking(move || run_command(&program, &args, &request, &input))
            .await
            .context("join summarizer command task")?
    }

    async fn check(&self) -> anyhow::Result<()> {
        let scratch = tempfile::TempDir::new().context("create scratch dir")?;
        let dir = scratch.path();
        let text = "This page exists only to check that the summarizer answers.".to_owned();
        let text_path = dir.join("check.connection.txt");
        std::fs::write(&text_path, &text).context("write check text")?;
        let request = SummarizeRequest {
            source_name: "check".to_owned(),
            doc_title: "Connection check".to_owned(),
            doc_version: None,
            section: SectionContext {
                name: "connection".to_owned(),
                title: "Connection".to_owned(),
                description: None,
                priority: Priority::Low,
                start_page: 1,
                end_page: 1,
            },
            text_path,
            summary_path: dir.join("check.connection.summary.md"),
            index_path: dir.join("check.connection.index.json"),
            text,
            truncated: false,
        };
        let raw = self.summarize(&request).await?;
        parse_payload(&raw).context("unusable provider payload")?;
        Ok(())
    }
}

fn run_command(
    program: &str,
    args: &[String],
    request: &SummarizeRequest,
    input: &[u8],
) -> anyhow::Result<String> {
    // stdout carries the payload; stderr is inherited so provider diagnostics
    // reach the operator without touching the payload stream.
    let mut child = Command::new(program)
        .args(args)
        .env("DOCDIGEST_SOURCE", &request.source_name)
        .env("DOCDIGEST_SECTION", &request.section.name)
        .env("DOCDIGEST_SECTION_TITLE", &request.section.title)
        .env(
            "DOCDIGEST_DOC_VERSION",
            request.doc_version.as_deref().unwrap_or("unknown"),
        )
        .env("DOCDIGEST_TEXT_PATH", &request.text_path)
        .env("DOCDIGEST_SUMMARY_PATH", &request.summary_path)
        .env("DOCDIGEST_INDEX_PATH", &request.index_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawn summarizer command: {program}"))?;

    // Written from its own thread so a command that streams output while
    // still reading cannot fill the stdout pipe and stall both sides.
    let mut stdin = child.stdin.take().context("open summarizer stdin")?;
    let input = input.to_vec();
    let writer = std::thread::spawn(move || match stdin.write_all(&input) {
        // The command may legitimately ignore its input.
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    });

    let output = child
        .wait_with_output()
        .context("wait summarizer command")?;
    writer
        .join()
        .map_err(|_| anyhow::anyhow!("summarizer stdin writer panicked"))?
        .context("write summarizer stdin")?;
    if !output.status.success() {
        anyhow::bail!("summarizer command failed: {program} ({})", output.status);
    }
    String::from_utf8(output.stdout).context("summarizer stdout is not valid UTF-8")
}

#[derive(Clone)]
pub struct OpenAiSummarizer {
    client: OpenAiClient,
}

const SYSTEM_PROMPT: &str = "You are a technical documentation expert preparing reference material for LLM consumption.\n\
\n\
Task: Summarize one section of a larger manual and index it.\n\
\n\
The summary MUST be Markdown with these top-level (`##`) headings, in order:\n\
Overview, Key Concepts, Glossary, Workflows, Features & Tools, Version-Specific Notes, Common Issues, Cross-References.\n\
Use ```mermaid blocks for workflows and hierarchies where they help.\n\
\n\
Output:\n\
- Output ONLY a single JSON object (no markdown fences, no commentary).\n\
- Schema: {\"summary_markdown\":\"...\",\"index\":{\"concepts\":[{\"name\":\"...\",\"description\":\"...\"}],\"terms\":[{\"term\":\"...\",\"definition\":\"...\"}],\"topics\":[{\"category\":\"...\",\"subtopics\":[\"...\"]}]}}\n";

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn engine(&self) -> &'static str {
        "openai"
    }

    fn describe(&self) -> String {
        format!("openai:{}", self.client.model())
    }

    async fn summarize(&self, request: &SummarizeRequest) -> anyhow::Result<String> {
        self.client
            .respond(SYSTEM_PROMPT, &section_prompt(request))
            .await
    }

    async fn check(&self) -> anyhow::Result<()> {
        expect_ok_reply(&self.client.respond("", PING_PROMPT).await?)
    }
}

#[derive(Clone)]
pub struct AnthropicSummarizer {
    client: AnthropicClient,
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    fn engine(&self) -> &'static str {
        "anthropic"
    }

    fn describe(&self) -> String {
        format!("anthropic:{}", self.client.model())
    }

    async fn summarize(&self, request: &SummarizeRequest) -> anyhow::Result<String> {
        self.client
            .respond(SYSTEM_PROMPT, &section_prompt(request))
            .await
    }

    async fn check(&self) -> anyhow::Result<()> {
        expect_ok_reply(&self.client.respond("", PING_PROMPT).await?)
    }
}

fn section_prompt(request: &SummarizeRequest) -> String {
    let section = &request.section;
    format!(
        "Section: {title} ({name})\n\
Pages: {start}-{end}\n\
Document: {doc_title} (version {version})\n\
Description: {description}\n\
\n\
BEGIN_SECTION_TEXT\n\
{text}\n\
END_SECTION_TEXT\n",
        title = section.title,
        name = section.name,
        start = section.start_page,
        end = section.end_page,
        doc_title = request.doc_title,
        version = request.doc_version.as_deref().unwrap_or("unknown"),
        description = section.description.as_deref().unwrap_or(""),
        text = request.text,
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiPayload {
    #[serde(default, alias = "summary")]
    pub summary_markdown: Option<String>,
    #[serde(default)]
    pub index: Option<serde_json::Value>,
    #[serde(default)]
    pub summary_file: Option<PathBuf>,
    #[serde(default)]
    pub index_file: Option<PathBuf>,
}

pub fn parse_payload(raw: &str) -> anyhow::Result<AiPayload> {
    let json = extract_json_object(raw).context("locate JSON object in provider output")?;
    let payload: AiPayload = serde_json::from_str(json).context("parse provider payload")?;

    let has_summary = payload
        .summary_markdown
        .as_deref()
        .is_some_and(|s| !s.trim().is_empty())
        || payload.summary_file.is_some();
    if !has_summary {
        anyhow::bail!("payload has neither `summary_markdown` nor `summary_file`");
    }

    match &payload.index {
        Some(index) => {
            if !index.is_object() {
                anyhow::bail!("payload `index` must be a JSON object");
            }
            serde_json::from_value::<SectionIndex>(index.clone())
                .context("payload `index` does not match {concepts, terms, topics}")?;
        }
        None if payload.index_file.is_none() => {
            anyhow::bail!("payload has neither `index` nor `index_file`");
        }
        None => {}
    }

    Ok(payload)
}

/// Narrows provider output to its JSON object: prefers a fenced ```json
/// block, else the span from the first `{` to the last `}`.
fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    if let Some(fenced) = fenced_json_block(text) {
        return Ok(fenced);
    }
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("missing `{{`"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow::anyhow!("missing `}}`"))?;
    if end <= start {
        anyhow::bail!("invalid json object span");
    }
    Ok(&text[start..=end])
}

fn fenced_json_block(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        let body_start = after_fence.find('\n')? + 1;
        let info = after_fence[..body_start].trim();
        let body = &after_fence[body_start..];
        let close = body.find("```")?;
        let candidate = body[..close].trim();
        if (info.is_empty() || info.eq_ignore_ascii_case("json")) && candidate.starts_with('{') {
            return Some(candidate);
        }
        rest = &body[close + 3..];
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r###"{"summary_markdown":"## Overview\nText","index":{"concepts":["a"],"terms":[],"topics":[]}}"###;

    #[test]
    fn parses_plain_payload() -> anyhow::Result<()> {
        let payload = parse_payload(PAYLOAD)?;
        assert_eq!(payload.summary_markdown.as_deref(), Some("## Overview\nText"));
        assert!(payload.index.is_some());
        assert!(payload.summary_file.is_none());
        Ok(())
    }

    #[test]
    fn tolerates_fences_and_surrounding_prose() -> anyhow::Result<()> {
        let fenced = format!("Here you go:\n```json\n{PAYLOAD}\n```\nAnything else?");
        assert!(parse_payload(&fenced)?.index.is_some());

        let prose = format!("Sure! {PAYLOAD} Hope that helps.");
        assert!(parse_payload(&prose)?.summary_markdown.is_some());
        Ok(())
    }

    #[test]
    fn json_fence_after_other_fences_is_found() -> anyhow::Result<()> {
        let reply = format!(
            "The workflow looks like this:\n```mermaid\ngraph TD; A{{start}} --> B\n```\nand the payload:\n```json\n{PAYLOAD}\n```\n"
        );
        let payload = parse_payload(&reply)?;
        assert_eq!(payload.summary_markdown.as_deref(), Some("## Overview\nText"));
        Ok(())
    }

    #[test]
    fn accepts_declared_files() -> anyhow::Result<()> {
        let payload =
            parse_payload(r#"{"summary_file":"/out/a.summary.md","index_file":"/out/a.index.json"}"#)?;
        assert_eq!(payload.summary_file, Some(PathBuf::from("/out/a.summary.md")));
        assert_eq!(payload.index_file, Some(PathBuf::from("/out/a.index.json")));
        Ok(())
    }

    #[test]
    fn rejects_incomplete_or_malformed_payloads() {
        assert!(parse_payload("no json here").is_err());
        assert!(parse_payload(r#"{"index":{"concepts":[]}}"#).is_err());
        assert!(parse_payload(r#"{"summary_markdown":"x"}"#).is_err());
        assert!(parse_payload(r#"{"summary_markdown":"x","index":[1,2]}"#).is_err());
        assert!(parse_payload(r#"{"summary_markdown":"x","index":{"concepts":"nope"}}"#).is_err());
        assert!(parse_payload(r#"{"summary_markdown":"x", "index": {"#).is_err());
    }

    #[test]
    fn truncation_is_char_safe() {
        let (text, truncated) = truncate_text("ééééé", 3);
        assert!(truncated);
        assert!(text.starts_with("ééé\n"));
        assert!(text.contains("truncated"));

        let (text, truncated) = truncate_text("short", 10);
        assert!(!truncated);
        assert_eq!(text, "short");
    }

    fn request(dir: &std::path::Path) -> SummarizeRequest {
        SummarizeRequest {
            source_name: "guide".to_owned(),
            doc_title: "Guide".to_owned(),
            doc_version: Some("2.0".to_owned()),
            section: SectionContext {
                name: "intro".to_owned(),
                title: "Introduction".to_owned(),
                description: None,
                priority: Priority::High,
                start_page: 1,
                end_page: 4,
            },
            text_path: dir.join("guide.intro.txt"),
            summary_path: dir.join("guide.intro.summary.md"),
            index_path: dir.join("guide.intro.index.json"),
            text: "Intro text".to_owned(),
            truncated: false,
        }
    }

    #[tokio::test]
    async fn command_stdout_is_payload_even_with_noisy_stderr() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let summarizer = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                format!(
                    "echo 'progress: thinking' >&2; cat >/dev/null; echo \"WARN noisy log for $DOCDIGEST_SECTION\" >&2; printf '%s' '{PAYLOAD}'"
                ),
            ],
        };

        let raw = summarizer.summarize(&request(temp.path())).await?;
        assert_eq!(raw, PAYLOAD);
        assert!(parse_payload(&raw).is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn command_receives_request_json_on_stdin() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let summarizer = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), "cat".to_owned()],
        };
        let raw = summarizer.summarize(&request(temp.path())).await?;
        let echoed: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(echoed["section"]["name"], "intro");
        assert_eq!(echoed["section"]["priority"], "high");
        assert_eq!(echoed["doc_version"], "2.0");
        assert_eq!(echoed["text"], "Intro text");
        Ok(())
    }

    #[tokio::test]
    async fn large_request_does_not_stall_an_echoing_command() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let summarizer = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), "cat".to_owned()],
        };
        let mut request = request(temp.path());
        // Control characters escape to six bytes each, well past any pipe buffer.
        request.text = "\u{1}".repeat(60_000);

        let raw = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            summarizer.summarize(&request),
        )
        .await
        .map_err(|_| anyhow::anyhow!("summarizer command stalled"))??;
        assert!(raw.len() > 300_000);
        let echoed: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(echoed["text"].as_str().map(|t| t.chars().count()), Some(60_000));
        Ok(())
    }

    #[tokio::test]
    async fn command_check_requires_a_usable_payload() -> anyhow::Result<()> {
        let ok = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec![
                "-c".to_owned(),
                format!("cat >/dev/null; printf '%s' '{PAYLOAD}'"),
            ],
        };
        ok.check().await?;

        let prose = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), "cat >/dev/null; echo hello".to_owned()],
        };
        let err = prose.check().await.unwrap_err();
        assert!(format!("{err:#}").contains("unusable provider payload"));
        Ok(())
    }

    #[test]
    fn connection_hints_name_the_key_or_model() -> anyhow::Result<()> {
        let mut config = crate::config::PipelineConfig::resolve(
            &crate::cli::ConfigArgs::default(),
            None,
            crate::config::FileConfig::default(),
            crate::config::ApiKeys::default(),
        )?
        .ai;

        config.engine = AiEngine::Anthropic;
        let hint = connection_hint(&config, "Anthropic API error (401 Unauthorized): invalid x-api-key");
        assert!(hint.is_some_and(|h| h.contains("ANTHROPIC_API_KEY")));
        let hint = connection_hint(&config, "Anthropic API error (404 Not Found): model: nope");
        assert!(hint.is_some_and(|h| h.contains(crate::config::DEFAULT_ANTHROPIC_MODEL)));

        config.engine = AiEngine::Openai;
        let hint = connection_hint(&config, "OpenAI API error (401 Unauthorized): Incorrect API key provided");
        assert!(hint.is_some_and(|h| h.contains("OPENAI_API_KEY")));
        assert!(connection_hint(&config, "connection refused").is_none());

        config.engine = AiEngine::Command;
        assert!(connection_hint(&config, "401").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn anthropic_engine_requires_api_key() -> anyhow::Result<()> {
        let mut config = crate::config::PipelineConfig::resolve(
            &crate::cli::ConfigArgs::default(),
            None,
            crate::config::FileConfig::default(),
            crate::config::ApiKeys::default(),
        )?
        .ai;
        config.engine = AiEngine::Anthropic;
        let err = check_connection(&config).await.unwrap_err();
        assert!(format!("{err:#}").contains("ANTHROPIC_API_KEY is not set"));
        Ok(())
    }

    #[tokio::test]
    async fn command_failure_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let summarizer = CommandSummarizer {
            program: "sh".to_owned(),
            args: vec!["-c".to_owned(), "cat >/dev/null; exit 7".to_owned()],
        };
        let err = summarizer.summarize(&request(temp.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("summarizer command failed"));
        Ok(())
    }
}
