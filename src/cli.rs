use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Slice, extract, summarize and consolidate every declared section.
    Run(RunArgs),
    /// Check a declaration against the source PDF and print it as JSON.
    Validate(ValidateArgs),
    /// Rebuild the master index and quick reference from files on disk.
    Consolidate(ConsolidateArgs),
    /// Send a minimal request to the configured AI engine and report whether it answers.
    CheckAi(CheckAiArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiEngine {
    /// Run an external command: request JSON on stdin, payload JSON on stdout.
    Command,
    /// Call the OpenAI Responses API.
    Openai,
    /// Call the Anthropic Messages API.
    Anthropic,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Metadata file declaring the document and its sections (.toml or .json).
    #[arg(long)]
    pub metadata: String,

    /// Process only the section with this name.
    #[arg(long)]
    pub section: Option<String>,

    /// Reuse the cached AI response of every targeted section instead of calling the provider.
    #[arg(long, default_value_t = false)]
    pub skip_ai: bool,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub ai: AiArgs,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Metadata file declaring the document and its sections (.toml or .json).
    #[arg(long)]
    pub metadata: String,

    /// Validate only the section with this name.
    #[arg(long)]
    pub section: Option<String>,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct ConsolidateArgs {
    /// Metadata file declaring the document and its sections (.toml or .json).
    #[arg(long)]
    pub metadata: String,

    #[command(flatten)]
    pub config: ConfigArgs,
}

#[derive(Debug, Args)]
pub struct CheckAiArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub ai: AiArgs,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Optional TOML config file ([paths], [tools], [ai] tables).
    #[arg(long)]
    pub config: Option<String>,

    /// Output directory for per-section and consolidated artifacts.
    #[arg(long)]
    pub out: Option<String>,

    /// Directory for run ledgers (default: <out>/logs).
    #[arg(long)]
    pub logs_dir: Option<String>,

    /// Directory for cached AI responses (default: <out>/.cache).
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Page-range slicer binary.
    #[arg(long)]
    pub qpdf_bin: Option<String>,

    /// Text extractor binary.
    #[arg(long)]
    pub pdftotext_bin: Option<String>,

    /// Page-count inspector binary.
    #[arg(long)]
    pub pdfinfo_bin: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct AiArgs {
    /// AI summarization engine.
    #[arg(long, value_enum)]
    pub ai_engine: Option<AiEngine>,

    /// Program to run when --ai-engine=command.
    #[arg(long)]
    pub ai_command: Option<String>,

    /// OpenAI model name.
    #[arg(long)]
    pub openai_model: Option<String>,

    /// OpenAI API base URL.
    #[arg(long)]
    pub openai_base_url: Option<String>,

    /// Anthropic model name.
    #[arg(long)]
    pub anthropic_model: Option<String>,

    /// Anthropic API base URL.
    #[arg(long)]
    pub anthropic_base_url: Option<String>,

    /// Sampling temperature (ignored by GPT-5 models).
    #[arg(long)]
    pub ai_temperature: Option<f32>,

    /// Upper bound on tokens the provider may generate per section.
    #[arg(long)]
    pub max_output_tokens: Option<u32>,

    /// Truncate extracted text to this many characters before summarizing.
    #[arg(long)]
    pub max_input_chars: Option<usize>,

    /// Arguments passed to --ai-command (after `--`).
    #[arg(last = true, allow_hyphen_values = true)]
    pub ai_command_args: Vec<String>,
}
