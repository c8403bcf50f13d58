use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid metadata '{path}': {detail}")]
    Metadata { path: PathBuf, detail: String },

    #[error("section '{section}': end_page {end_page} > totalPages {total_pages}")]
    Boundary {
        section: String,
        end_page: u32,
        total_pages: u32,
    },

    #[error("no section named '{name}' (declared: {declared})")]
    NoMatchingSection { name: String, declared: String },

    #[error("source PDF not found or unreadable: '{path}'")]
    SourceMissing { path: PathBuf },

    #[error("slice failed for section '{section}': {detail}")]
    Slice { section: String, detail: String },

    #[error("text extraction failed for section '{section}': {detail}")]
    Extract { section: String, detail: String },

    #[error("AI summarization failed for section '{section}': {detail}")]
    Summarize { section: String, detail: String },

    #[error(
        "no cached AI response for section '{section}' at '{path}'\nRun once without --skip-ai to populate the cache."
    )]
    CacheMiss { section: String, path: PathBuf },

    #[error("consolidation failed: {detail}")]
    Consolidation { detail: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Metadata { .. } | Self::NoMatchingSection { .. } | Self::SourceMissing { .. } => {
                "METADATA"
            }
            Self::Boundary { .. } => "BOUNDARY",
            Self::Slice { .. } => "SLICE",
            Self::Extract { .. } => "EXTRACT",
            Self::Summarize { .. } => "AI",
            Self::CacheMiss { .. } => "CACHE",
            Self::Consolidation { .. } => "CONSOLIDATE",
            Self::Io { .. } => "RUN",
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Renders an `anyhow` chain on one line for embedding in a variant's detail.
pub(crate) fn detail(err: &anyhow::Error) -> String {
    format!("{err:#}")
}
