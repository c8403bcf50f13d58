use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use docdigest::cli::{Cli, Command};
use docdigest::config::PipelineConfig;
use docdigest::pipeline::{Pipeline, RunRequest};
use docdigest::tools::CommandTools;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    docdigest::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        Command::Run(args) => {
            let config = PipelineConfig::from_process(&args.config, Some(&args.ai))
                .context("resolve config")?;
            let tools = CommandTools::new(config.tools.clone());
            let request = RunRequest {
                metadata: PathBuf::from(&args.metadata),
                section: args.section,
                skip_ai: args.skip_ai,
            };
            let summary = Pipeline::new(&config, &tools).run(&request).await?;
            print_json(&summary)?;
        }
        Command::Validate(args) => {
            let config =
                PipelineConfig::from_process(&args.config, None).context("resolve config")?;
            let tools = CommandTools::new(config.tools.clone());
            let report = Pipeline::new(&config, &tools)
                .validate(&PathBuf::from(&args.metadata), args.section.as_deref())?;
            print_json(&report)?;
        }
        Command::Consolidate(args) => {
            let config =
                PipelineConfig::from_process(&args.config, None).context("resolve config")?;
            let tools = CommandTools::new(config.tools.clone());
            let summary = Pipeline::new(&config, &tools).consolidate(&PathBuf::from(&args.metadata))?;
            print_json(&summary)?;
        }
        Command::CheckAi(args) => {
            let config = PipelineConfig::from_process(&args.config, Some(&args.ai))
                .context("resolve config")?;
            let report = docdigest::summarizer::check_connection(&config.ai).await?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}
