use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use crate::cli::{AiArgs, AiEngine, ConfigArgs};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5-20250929";
pub const DEFAULT_MAX_INPUT_CHARS: usize = 50_000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 16_384;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub tools: ToolsConfig,
    pub ai: AiConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsConfig {
    pub qpdf: String,
    pub pdftotext: String,
    pub pdfinfo: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            qpdf: "qpdf".to_owned(),
            pdftotext: "pdftotext".to_owned(),
            pdfinfo: "pdfinfo".to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct AiConfig {
    pub engine: AiEngine,
    pub command: Option<String>,
    pub command_args: Vec<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub keys: ApiKeys,
    pub max_input_chars: usize,
}

/// Provider credentials, read from `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`.
#[derive(Clone, Default)]
pub struct ApiKeys {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|key| !key.trim().is_empty());
        Self {
            openai: read("OPENAI_API_KEY"),
            anthropic: read("ANTHROPIC_API_KEY"),
        }
    }
}

impl std::fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiConfig")
            .field("engine", &self.engine)
            .field("command", &self.command)
            .field("command_args", &self.command_args)
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field("anthropic_model", &self.anthropic_model)
            .field("anthropic_base_url", &self.anthropic_base_url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("openai_api_key", &self.keys.openai.as_ref().map(|_| "<redacted>"))
            .field("anthropic_api_key", &self.keys.anthropic.as_ref().map(|_| "<redacted>"))
            .field("max_input_chars", &self.max_input_chars)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub ai: AiSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    pub output_dir: Option<PathBuf>,
    pub logs_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsSection {
    pub qpdf: Option<String>,
    pub pdftotext: Option<String>,
    pub pdfinfo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiSection {
    pub engine: Option<AiEngine>,
    pub command: Option<String>,
    #[serde(default)]
    pub command_args: Vec<String>,
    pub openai_model: Option<String>,
    pub openai_base_url: Option<String>,
    pub anthropic_model: Option<String>,
    pub anthropic_base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    pub max_input_chars: Option<usize>,
}

impl FileConfig {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parse config: {}", path.display()))
    }
}

impl PipelineConfig {
    /// Reads `--config` and the provider API keys. Call once, from `main`.
    pub fn from_process(args: &ConfigArgs, ai: Option<&AiArgs>) -> anyhow::Result<Self> {
        let file = match args.config.as_deref() {
            Some(path) => FileConfig::read(Path::new(path))?,
            None => FileConfig::default(),
        };
        Self::resolve(args, ai, file, ApiKeys::from_env())
    }

    pub fn resolve(
        args: &ConfigArgs,
        ai: Option<&AiArgs>,
        file: FileConfig,
        keys: ApiKeys,
    ) -> anyhow::Result<Self> {
        let output_dir = args
            .out
            .as_deref()
            .map(PathBuf::from)
            .or(file.paths.output_dir)
            .unwrap_or_else(|| PathBuf::from("output"));
        let logs_dir = args
            .logs_dir
            .as_deref()
            .map(PathBuf::from)
            .or(file.paths.logs_dir)
            .unwrap_or_else(|| output_dir.join("logs"));
        let cache_dir = args
            .cache_dir
            .as_deref()
            .map(PathBuf::from)
            .or(file.paths.cache_dir)
            .unwrap_or_else(|| output_dir.join(".cache"));

        let defaults = ToolsConfig::default();
        let tools = ToolsConfig {
            qpdf: pick(args.qpdf_bin.clone(), file.tools.qpdf, defaults.qpdf),
            pdftotext: pick(
                args.pdftotext_bin.clone(),
                file.tools.pdftotext,
                defaults.pdftotext,
            ),
            pdfinfo: pick(args.pdfinfo_bin.clone(), file.tools.pdfinfo, defaults.pdfinfo),
        };

        let cli_ai = ai.cloned().unwrap_or_default();
        let file_ai = file.ai;
        let command_args = if cli_ai.ai_command_args.is_empty() {
            file_ai.command_args
        } else {
            cli_ai.ai_command_args
        };
        let ai = AiConfig {
            engine: cli_ai
                .ai_engine
                .or(file_ai.engine)
                .unwrap_or(AiEngine::Openai),
            command: cli_ai.ai_command.or(file_ai.command),
            command_args,
            openai_model: pick(
                cli_ai.openai_model,
                file_ai.openai_model,
                DEFAULT_OPENAI_MODEL.to_owned(),
            ),
            openai_base_url: pick(
                cli_ai.openai_base_url,
                file_ai.openai_base_url,
                DEFAULT_OPENAI_BASE_URL.to_owned(),
            ),
            anthropic_model: pick(
                cli_ai.anthropic_model,
                file_ai.anthropic_model,
                DEFAULT_ANTHROPIC_MODEL.to_owned(),
            ),
            anthropic_base_url: pick(
                cli_ai.anthropic_base_url,
                file_ai.anthropic_base_url,
                DEFAULT_ANTHROPIC_BASE_URL.to_owned(),
            ),
            temperature: pick(cli_ai.ai_temperature, file_ai.temperature, 0.0),
            max_output_tokens: pick(
                cli_ai.max_output_tokens,
                file_ai.max_output_tokens,
                DEFAULT_MAX_OUTPUT_TOKENS,
            ),
            keys,
            max_input_chars: cli_ai
                .max_input_chars
                .or(file_ai.max_input_chars)
                .unwrap_or(DEFAULT_MAX_INPUT_CHARS),
        };

        if ai.max_input_chars == 0 {
            anyhow::bail!("max_input_chars must be > 0");
        }
        if ai.max_output_tokens == 0 {
            anyhow::bail!("max_output_tokens must be > 0");
        }

        Ok(Self {
            output_dir,
            logs_dir,
            cache_dir,
            tools,
            ai,
        })
    }
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_from_output_dir() -> anyhow::Result<()> {
        let args = ConfigArgs {
            out: Some("build".to_owned()),
            ..ConfigArgs::default()
        };
        let config = PipelineConfig::resolve(&args, None, FileConfig::default(), ApiKeys::default())?;
        assert_eq!(config.output_dir, PathBuf::from("build"));
        assert_eq!(config.logs_dir, PathBuf::from("build/logs"));
        assert_eq!(config.cache_dir, PathBuf::from("build/.cache"));
        assert_eq!(config.tools, ToolsConfig::default());
        assert_eq!(config.ai.engine, AiEngine::Openai);
        assert_eq!(config.ai.max_input_chars, DEFAULT_MAX_INPUT_CHARS);
        assert_eq!(config.ai.max_output_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
        assert_eq!(config.ai.anthropic_model, DEFAULT_ANTHROPIC_MODEL);
        Ok(())
    }

    #[test]
    fn cli_overrides_file_overrides_defaults() -> anyhow::Result<()> {
        let file: FileConfig = toml::from_str(
            r#"
[paths]
output_dir = "from-file"
cache_dir = "file-cache"

[tools]
qpdf = "/opt/qpdf"
pdfinfo = "/opt/pdfinfo"

[ai]
engine = "command"
command = "summarize"
command_args = ["--fast"]
max_output_tokens = 2048
temperature = 0.3
"#,
        )?;
        let args = ConfigArgs {
            pdfinfo_bin: Some("/usr/local/bin/pdfinfo".to_owned()),
            ..ConfigArgs::default()
        };
        let ai = AiArgs {
            ai_command_args: vec!["--slow".to_owned()],
            max_output_tokens: Some(1024),
            ..AiArgs::default()
        };
        let config = PipelineConfig::resolve(&args, Some(&ai), file, ApiKeys::default())?;
        assert_eq!(config.output_dir, PathBuf::from("from-file"));
        assert_eq!(config.logs_dir, PathBuf::from("from-file/logs"));
        assert_eq!(config.cache_dir, PathBuf::from("file-cache"));
        assert_eq!(config.tools.qpdf, "/opt/qpdf");
        assert_eq!(config.tools.pdftotext, "pdftotext");
        assert_eq!(config.tools.pdfinfo, "/usr/local/bin/pdfinfo");
        assert_eq!(config.ai.engine, AiEngine::Command);
        assert_eq!(config.ai.command.as_deref(), Some("summarize"));
        assert_eq!(config.ai.command_args, vec!["--slow".to_owned()]);
        assert_eq!(config.ai.max_output_tokens, 1024);
        assert_eq!(config.ai.temperature, 0.3);
        Ok(())
    }

    #[test]
    fn zero_output_tokens_is_rejected() {
        let ai = AiArgs {
            max_output_tokens: Some(0),
            ..AiArgs::default()
        };
        let err = PipelineConfig::resolve(
            &ConfigArgs::default(),
            Some(&ai),
            FileConfig::default(),
            ApiKeys::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_output_tokens"));
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("[paths]\noutput = \"x\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn api_key_is_redacted_in_debug() -> anyhow::Result<()> {
        let config = PipelineConfig::resolve(
            &ConfigArgs::default(),
            None,
            FileConfig::default(),
            ApiKeys {
                openai: Some("sk-secret".to_owned()),
                anthropic: Some("sk-ant-secret".to_owned()),
            },
        )?;
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("<redacted>"));
        Ok(())
    }
}
