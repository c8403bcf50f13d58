use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::cache::AiResponseCache;
use crate::config::PipelineConfig;
use crate::consolidate::{self, ConsolidationReport};
use crate::error::{PipelineError, detail};
use crate::ledger::{MetadataIdentity, RunLedger, RunRecord, RunStatus};
use crate::metadata::{self, DocumentSpec, Metadata, SectionSpec};
use crate::processor::{Mode, SectionProcessor, SectionResult};
use crate::summarizer::build_summarizer;
use crate::tools::DocumentTools;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub metadata: PathBuf,
    pub section: Option<String>,
    pub skip_ai: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub title: String,
    pub skip_ai: bool,
    pub sections: Vec<SectionResult>,
    pub master_index: PathBuf,
    pub quick_reference: PathBuf,
    pub warnings: Vec<String>,
    pub ledger: PathBuf,
    pub run_record: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub total_pages: u32,
    #[serde(flatten)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidateSummary {
    pub source: String,
    #[serde(flatten)]
    pub report: ConsolidationReport,
    pub warnings: Vec<String>,
    pub ledger: PathBuf,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    tools: &'a dyn DocumentTools,
}

#[derive(Default)]
struct Progress {
    metadata: Option<MetadataIdentity>,
    selected: Vec<String>,
    results: Vec<SectionResult>,
}

struct Completed {
    document: DocumentSpec,
    report: ConsolidationReport,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig, tools: &'a dyn DocumentTools) -> Self {
        Self { config, tools }
    }

    pub async fn run(&self, request: &RunRequest) -> anyhow::Result<RunSummary> {
        let ledger = RunLedger::open(&self.config.logs_dir);
        tracing::info!(ledger = %ledger.path().display(), "run started");
        ledger.info(
            "RUN",
            &format!(
                "start: metadata={} section={} skip_ai={} output={}",
                request.metadata.display(),
                request.section.as_deref().unwrap_or("*"),
                request.skip_ai,
                self.config.output_dir.display()
            ),
        );
        ledger.debug("RUN", &format!("config: {:?}", self.config));

        let mut progress = Progress::default();
        let outcome = self.execute(request, &ledger, &mut progress).await;

        if let Err(err) = &outcome {
            ledger.error(category_of(err), &format!("{err:#}"));
            ledger.error("RUN", "run aborted");
        } else {
            ledger.info(
                "RUN",
                &format!("finished: {} section(s) processed", progress.results.len()),
            );
        }

        let mut warnings = ledger.warnings();
        if let Some(failure) = ledger.failure() {
            tracing::warn!(ledger = %ledger.path().display(), error = %failure, "run ledger is incomplete");
            warnings.push(format!("[RUN] run ledger is incomplete: {failure}"));
        }

        let record = RunRecord {
            started_at: ledger
                .started_at()
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            finished_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            status: if outcome.is_ok() {
                RunStatus::Success
            } else {
                RunStatus::Failed
            },
            skip_ai: request.skip_ai,
            metadata: progress.metadata,
            tool_versions: self.tools.versions(),
            selected_sections: progress.selected,
            sections: progress.results.clone(),
            warnings: warnings.clone(),
            error: outcome.as_ref().err().map(|err| format!("{err:#}")),
            ledger: ledger.path().display().to_string(),
        };
        let run_record = match ledger.write_run_record(&record) {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "run record not written");
                None
            }
        };

        let completed = match outcome {
            Ok(completed) => completed,
            Err(err) => {
                tracing::error!(ledger = %ledger.path().display(), "run failed; see the run ledger for details");
                return Err(err);
            }
        };
        if !warnings.is_empty() {
            tracing::warn!(count = warnings.len(), "run finished with warnings");
        }

        Ok(RunSummary {
            source: completed.document.source_name,
            title: completed.document.title,
            skip_ai: request.skip_ai,
            sections: progress.results,
            master_index: completed.report.master_index_path,
            quick_reference: completed.report.quick_reference_path,
            warnings,
            ledger: ledger.path().to_path_buf(),
            run_record,
        })
    }

    async fn execute(
        &self,
        request: &RunRequest,
        ledger: &RunLedger,
        progress: &mut Progress,
    ) -> anyhow::Result<Completed> {
        progress.metadata = MetadataIdentity::of(&request.metadata).ok();
        let (metadata, selected, _) = self.load_and_validate(
            &request.metadata,
            request.section.as_deref(),
            ledger,
        )?;
        progress.selected = selected.iter().map(|s| s.name.clone()).collect();
        let document = metadata.document;

        let cache = AiResponseCache::new(self.config.cache_dir.clone());
        let mode = if request.skip_ai {
            preflight_cache(&cache, &document, &selected, ledger)?;
            Mode::SkipCache
        } else {
            Mode::Fresh
        };
        let summarizer = match mode {
            Mode::SkipCache => None,
            Mode::Fresh => {
                let summarizer = build_summarizer(&self.config.ai).context("configure AI engine")?;
                ledger.info("AI", &format!("engine: {}", summarizer.describe()));
                Some(summarizer)
            }
        };

        std::fs::create_dir_all(&self.config.output_dir).map_err(|err| {
            PipelineError::io(
                format!("create output dir {}", self.config.output_dir.display()),
                err,
            )
        })?;
        // Dropped on every exit path, including `?` out of a section.
        let work_dir = tempfile::Builder::new()
            .prefix(".docdigest-work-")
            .tempdir_in(&self.config.output_dir)
            .map_err(|err| PipelineError::io("create work dir", err))?;
        ledger.debug("RUN", &format!("work dir: {}", work_dir.path().display()));

        let processor = SectionProcessor {
            config: self.config,
            tools: self.tools,
            summarizer: summarizer.as_deref(),
            cache: &cache,
            ledger,
            work_dir: work_dir.path(),
        };
        for (idx, section) in selected.iter().enumerate() {
            tracing::info!(
                "[{}/{}] {} (pages {})",
                idx + 1,
                selected.len(),
                section.name,
                section.page_range()
            );
            let result = processor.process(&document, section, mode).await?;
            progress.results.push(result);
        }

        let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let report = consolidate::consolidate(
            &document,
            &progress.results,
            &self.config.output_dir,
            &generated_at,
            ledger,
        )?;
        tracing::info!(
            master_index = %report.master_index_path.display(),
            quick_reference = %report.quick_reference_path.display(),
            "consolidated"
        );

        Ok(Completed { document, report })
    }

    /// Loads the declaration, narrows it to `section`, checks the source
    /// PDF, and validates every declared range against its real page count.
    fn load_and_validate(
        &self,
        path: &Path,
        section: Option<&str>,
        ledger: &RunLedger,
    ) -> anyhow::Result<(Metadata, Vec<SectionSpec>, u32)> {
        let metadata = metadata::load(path)?;
        ledger.info(
            "METADATA",
            &format!(
                "loaded {}: source={} sections={}",
                path.display(),
                metadata.document.source_name,
                metadata.sections.len()
            ),
        );
        let selected = metadata::filter_sections(&metadata.sections, section)?;
        if section.is_some() {
            ledger.info(
                "METADATA",
                &format!("section filter selected {}", selected[0].name),
            );
        }

        let source = &metadata.document.source_path;
        if let Err(err) = std::fs::File::open(source) {
            ledger.debug("METADATA", &format!("open {}: {err}", source.display()));
            return Err(PipelineError::SourceMissing {
                path: source.clone(),
            }
            .into());
        }
        if !source.is_file() {
            return Err(PipelineError::SourceMissing {
                path: source.clone(),
            }
            .into());
        }

        let total_pages = self
            .tools
            .page_count(source, ledger)
            .with_context(|| format!("read page count of {}", source.display()))?;
        ledger.info(
            "BOUNDARY",
            &format!("{}: {total_pages} pages", source.display()),
        );
        metadata::validate_against_document(&metadata.document, &metadata.sections, total_pages)?;
        for section in &selected {
            ledger.info(
                "BOUNDARY",
                &format!(
                    "section '{}': pages {} within 1-{total_pages}",
                    section.name,
                    section.page_range()
                ),
            );
        }

        Ok((metadata, selected, total_pages))
    }

    pub fn validate(
        &self,
        path: &Path,
        section: Option<&str>,
    ) -> anyhow::Result<ValidationReport> {
        let ledger = RunLedger::open(&self.config.logs_dir);
        ledger.info("RUN", &format!("validate: metadata={}", path.display()));
        let (mut metadata, selected, total_pages) =
            match self.load_and_validate(path, section, &ledger) {
                Ok(loaded) => loaded,
                Err(err) => {
                    ledger.error(category_of(&err), &format!("{err:#}"));
                    return Err(err);
                }
            };
        metadata.sections = selected;
        ledger.info("RUN", "validate: ok");
        Ok(ValidationReport {
            total_pages,
            metadata,
        })
    }

    /// Rebuilds the consolidated artifacts from the canonical per-section
    /// files on disk. No external tool or AI provider is invoked.
    pub fn consolidate(&self, path: &Path) -> anyhow::Result<ConsolidateSummary> {
        let ledger = RunLedger::open(&self.config.logs_dir);
        ledger.info("RUN", &format!("consolidate: metadata={}", path.display()));

        let outcome = (|| -> anyhow::Result<ConsolidationReport> {
            let metadata = metadata::load(path)?;
            let results = metadata
                .sections
                .iter()
                .map(|section| {
                    SectionResult::from_disk(&self.config.output_dir, &metadata.document, section)
                })
                .collect::<Vec<_>>();
            let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            Ok(consolidate::consolidate(
                &metadata.document,
                &results,
                &self.config.output_dir,
                &generated_at,
                &ledger,
            )?)
        })();

        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                ledger.error(category_of(&err), &format!("{err:#}"));
                return Err(err);
            }
        };
        let source = report
            .master_index_path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(".master-index.json"))
            .unwrap_or_default()
            .to_owned();
        Ok(ConsolidateSummary {
            source,
            report,
            warnings: ledger.warnings(),
            ledger: ledger.path().to_path_buf(),
        })
    }
}

/// Every targeted section must have a usable cache entry before anything is
/// touched; a miss here leaves the output directory exactly as it was.
fn preflight_cache(
    cache: &AiResponseCache,
    document: &DocumentSpec,
    sections: &[SectionSpec],
    ledger: &RunLedger,
) -> Result<(), PipelineError> {
    for section in sections {
        let path = cache.entry_path(&document.source_name, &section.name);
        match cache.get(&document.source_name, &section.name) {
            Ok(Some(_)) => {
                ledger.info(
                    "CACHE",
                    &format!("section '{}': cache entry {}", section.name, path.display()),
                );
            }
            Ok(None) => {
                return Err(PipelineError::CacheMiss {
                    section: section.name.clone(),
                    path,
                });
            }
            Err(err) => {
                return Err(PipelineError::Summarize {
                    section: section.name.clone(),
                    detail: format!("unusable cache entry: {}", detail(&err)),
                });
            }
        }
    }
    Ok(())
}

fn category_of(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::category)
        .unwrap_or("RUN")
}
