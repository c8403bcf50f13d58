use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::AiResponseCache;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, detail};
use crate::fsutil::{write_atomic, write_json_atomic};
use crate::ledger::RunLedger;
use crate::metadata::{DocumentSpec, SectionSpec};
use crate::summarizer::{SectionContext, SummarizeRequest, Summarizer, parse_payload, truncate_text};
use crate::tools::DocumentTools;

const MIN_SUMMARY_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Fresh,
    SkipCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPaths {
    pub sliced: PathBuf,
    pub text: PathBuf,
    pub summary: PathBuf,
    pub index: PathBuf,
}

impl SectionPaths {
    pub fn new(output_dir: &Path, source_name: &str, section_name: &str) -> Self {
        let path = |kind: &str| output_dir.join(format!("{source_name}.{section_name}.{kind}"));
        Self {
            sliced: path("pdf"),
            text: path("txt"),
            summary: path("summary.md"),
            index: path("index.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionResult {
    pub name: String,
    pub title: String,
    pub sliced_document_path: PathBuf,
    pub extracted_text_path: PathBuf,
    pub summary_path: PathBuf,
    pub index_path: PathBuf,
    pub char_count: usize,
    pub line_count: usize,
    pub cache_hit: bool,
}

impl SectionResult {
    pub fn from_disk(output_dir: &Path, document: &DocumentSpec, section: &SectionSpec) -> Self {
        let paths = SectionPaths::new(output_dir, &document.source_name, &section.name);
        let (char_count, line_count) = std::fs::read(&paths.text)
            .map(|bytes| text_counts(&String::from_utf8_lossy(&bytes)))
            .unwrap_or((0, 0));
        Self {
            name: section.name.clone(),
            title: section.title.clone(),
            sliced_document_path: paths.sliced,
            extracted_text_path: paths.text,
            summary_path: paths.summary,
            index_path: paths.index,
            char_count,
            line_count,
            cache_hit: false,
        }
    }
}

fn text_counts(text: &str) -> (usize, usize) {
    (text.chars().count(), text.lines().count())
}

pub struct SectionProcessor<'a> {
    pub config: &'a PipelineConfig,
    pub tools: &'a dyn DocumentTools,
    pub summarizer: Option<&'a dyn Summarizer>,
    pub cache: &'a AiResponseCache,
    pub ledger: &'a RunLedger,
    pub work_dir: &'a Path,
}

impl SectionProcessor<'_> {
    pub async fn process(
        &self,
        document: &DocumentSpec,
        section: &SectionSpec,
        mode: Mode,
    ) -> Result<SectionResult> {
        let paths = SectionPaths::new(&self.config.output_dir, &document.source_name, &section.name);

        self.slice(document, section, &paths)?;
        let text = self.extract(section, &paths)?;
        let (char_count, line_count) = text_counts(&text);
        self.ledger.info(
            "EXTRACT",
            &format!(
                "section '{}': {char_count} chars, {line_count} lines -> {}",
                section.name,
                paths.text.display()
            ),
        );

        let (raw, cache_hit) = match mode {
            Mode::SkipCache => (self.replay(document, section)?, true),
            Mode::Fresh => (self.summarize(document, section, &paths, &text).await?, false),
        };

        let payload = parse_payload(&raw).map_err(|err| PipelineError::Summarize {
            section: section.name.clone(),
            detail: format!("unusable provider payload: {}", detail(&err)),
        })?;

        let summary_path = match payload.summary_markdown.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(markdown) => {
                let mut markdown = markdown.trim_end().to_owned();
                markdown.push('\n');
                write_atomic(&paths.summary, markdown.as_bytes())
                    .map_err(|err| summarize_error(section, &err))?;
                paths.summary.clone()
            }
            None => self.declared_path(payload.summary_file.as_deref(), &paths.summary),
        };
        let index_path = match payload.index.as_ref() {
            Some(index) => {
                write_json_atomic(&paths.index, index).map_err(|err| summarize_error(section, &err))?;
                paths.index.clone()
            }
            None => self.declared_path(payload.index_file.as_deref(), &paths.index),
        };

        self.check_output(section, "summary", &summary_path);
        self.check_output(section, "index", &index_path);
        if let Ok(summary) = std::fs::read_to_string(&summary_path) {
            let chars = summary.trim().chars().count();
            if chars < MIN_SUMMARY_CHARS {
                self.ledger.warn(
                    "AI",
                    &format!(
                        "section '{}': summary is suspiciously short ({chars} chars): {}",
                        section.name,
                        summary_path.display()
                    ),
                );
            }
        }

        tracing::info!(
            section = %section.name,
            cache_hit,
            chars = char_count,
            "section done"
        );
        Ok(SectionResult {
            name: section.name.clone(),
            title: section.title.clone(),
            sliced_document_path: paths.sliced,
            extracted_text_path: paths.text,
            summary_path,
            index_path,
            char_count,
            line_count,
            cache_hit,
        })
    }

    fn slice(&self, document: &DocumentSpec, section: &SectionSpec, paths: &SectionPaths) -> Result<()> {
        let slice_error = |detail: String| PipelineError::Slice {
            section: section.name.clone(),
            detail,
        };
        tracing::info!(section = %section.name, pages = %section.page_range(), "slice");

        let staged = self.staged_path(&paths.sliced);
        self.tools
            .slice(
                &document.source_path,
                section.start_page,
                section.end_page,
                &staged,
                self.ledger,
            )
            .map_err(|err| slice_error(detail(&err)))?;
        if !staged.is_file() {
            return Err(slice_error(format!(
                "slicer exited successfully but wrote no file at {}",
                staged.display()
            )));
        }
        std::fs::rename(&staged, &paths.sliced).map_err(|err| {
            slice_error(format!("move slice to {}: {err}", paths.sliced.display()))
        })?;

        self.ledger.info(
            "SLICE",
            &format!(
                "section '{}': pages {} -> {}",
                section.name,
                section.page_range(),
                paths.sliced.display()
            ),
        );
        Ok(())
    }

    fn extract(&self, section: &SectionSpec, paths: &SectionPaths) -> Result<String> {
        let extract_error = |detail: String| PipelineError::Extract {
            section: section.name.clone(),
            detail,
        };
        tracing::info!(section = %section.name, "extract text");

        let staged = self.staged_path(&paths.text);
        self.tools
            .extract_text(&paths.sliced, &staged, self.ledger)
            .map_err(|err| extract_error(detail(&err)))?;
        let bytes = std::fs::read(&staged)
            .map_err(|err| extract_error(format!("read {}: {err}", staged.display())))?;

        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                self.ledger.warn(
                    "EXTRACT",
                    &format!(
                        "section '{}': extracted text is not valid UTF-8; decoded lossily",
                        section.name
                    ),
                );
                String::from_utf8_lossy(err.as_bytes()).into_owned()
            }
        };
        if text.trim().is_empty() {
            return Err(extract_error(
                "extractor produced no text (scanned pages or wrong page range?)".to_owned(),
            ));
        }

        write_atomic(&paths.text, text.as_bytes())
            .map_err(|err| extract_error(detail(&err)))?;
        // The staged copy is only an input; the work dir is dropped at run end either way.
        let _ = std::fs::remove_file(&staged);
        Ok(text)
    }

    fn replay(&self, document: &DocumentSpec, section: &SectionSpec) -> Result<String> {
        let entry = self
            .cache
            .get(&document.source_name, &section.name)
            .map_err(|err| PipelineError::Summarize {
                section: section.name.clone(),
                detail: format!("unusable cache entry: {}", detail(&err)),
            })?;
        let Some(entry) = entry else {
            return Err(PipelineError::CacheMiss {
                section: section.name.clone(),
                path: self.cache.entry_path(&document.source_name, &section.name),
            });
        };
        self.ledger.info(
            "CACHE",
            &format!(
                "section '{}': replaying {} response from {}",
                section.name, entry.engine, entry.created_at
            ),
        );
        Ok(entry.raw_response)
    }

    async fn summarize(
        &self,
        document: &DocumentSpec,
        section: &SectionSpec,
        paths: &SectionPaths,
        text: &str,
    ) -> Result<String> {
        let Some(summarizer) = self.summarizer else {
            return Err(PipelineError::Summarize {
                section: section.name.clone(),
                detail: "no AI engine configured".to_owned(),
            });
        };

        let (text, truncated) = truncate_text(text, self.config.ai.max_input_chars);
        if truncated {
            self.ledger.warn(
                "AI",
                &format!(
                    "section '{}': text truncated to {} chars for the provider",
                    section.name, self.config.ai.max_input_chars
                ),
            );
        }
        let request = SummarizeRequest {
            source_name: document.source_name.clone(),
            doc_title: document.title.clone(),
            doc_version: document.version.clone(),
            section: SectionContext {
                name: section.name.clone(),
                title: section.title.clone(),
                description: section.description.clone(),
                priority: section.priority,
                start_page: section.start_page,
                end_page: section.end_page,
            },
            text_path: paths.text.clone(),
            summary_path: paths.summary.clone(),
            index_path: paths.index.clone(),
            text,
            truncated,
        };

        tracing::info!(section = %section.name, engine = summarizer.engine(), "summarize");
        self.ledger.info(
            "AI",
            &format!("section '{}': invoking {}", section.name, summarizer.describe()),
        );
        let raw = summarizer
            .summarize(&request)
            .await
            .map_err(|err| summarize_error(section, &err))?;
        self.ledger.info(
            "AI",
            &format!("section '{}': received {} bytes", section.name, raw.len()),
        );

        let entry = self
            .cache
            .put(&document.source_name, &section.name, summarizer.engine(), &raw)
            .map_err(|err| summarize_error(section, &err))?;
        self.ledger.info(
            "CACHE",
            &format!("section '{}': stored {}", section.name, entry.display()),
        );
        Ok(raw)
    }

    fn staged_path(&self, canonical: &Path) -> PathBuf {
        match canonical.file_name() {
            Some(name) => self.work_dir.join(name),
            None => self.work_dir.join("staged"),
        }
    }

    /// Provider-declared paths are taken as-is; relative ones resolve against
    /// the output directory. An absent declaration falls back to `canonical`.
    fn declared_path(&self, declared: Option<&Path>, canonical: &Path) -> PathBuf {
        match declared {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.config.output_dir.join(path),
            None => canonical.to_path_buf(),
        }
    }

    fn check_output(&self, section: &SectionSpec, kind: &str, path: &Path) {
        if path.is_file() {
            return;
        }
        tracing::warn!(section = %section.name, path = %path.display(), "{kind} file missing");
        self.ledger.warn(
            "AI",
            &format!(
                "section '{}': {kind} file missing after AI step: {}",
                section.name,
                path.display()
            ),
        );
    }
}

fn summarize_error(section: &SectionSpec, err: &anyhow::Error) -> PipelineError {
    PipelineError::Summarize {
        section: section.name.clone(),
        detail: detail(err),
    }
}
