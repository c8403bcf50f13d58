use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSpec {
    pub source_path: PathBuf,
    pub source_name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionSpec {
    pub name: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    pub start_page: u32,
    pub end_page: u32,
}

impl SectionSpec {
    pub fn page_range(&self) -> String {
        format!("{}-{}", self.start_page, self.end_page)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub document: DocumentSpec,
    pub sections: Vec<SectionSpec>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    document: RawDocument,
    #[serde(default)]
    sections: Vec<RawSection>,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    source_pdf: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSection {
    name: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    start_page: i64,
    end_page: i64,
    #[serde(default)]
    priority: Priority,
}

pub fn load(path: &Path) -> Result<Metadata> {
    let invalid = |detail: String| PipelineError::Metadata {
        path: path.to_path_buf(),
        detail,
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|err| invalid(format!("cannot read file: {err}")))?;
    let format = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let raw = parse_raw(&contents, format).map_err(invalid)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    build(raw, base_dir).map_err(invalid)
}

pub fn parse_str(contents: &str, format: &str, base_dir: &Path) -> Result<Metadata> {
    let invalid = |detail: String| PipelineError::Metadata {
        path: PathBuf::from(format!("<inline {format}>")),
        detail,
    };
    let raw = parse_raw(contents, format).map_err(invalid)?;
    build(raw, base_dir).map_err(invalid)
}

fn parse_raw(contents: &str, format: &str) -> std::result::Result<RawMetadata, String> {
    match format {
        // toml and serde_json both put line/column into their messages.
        "toml" => toml::from_str(contents).map_err(|err| err.to_string().trim_end().to_owned()),
        "json" => serde_json::from_str(contents).map_err(|err| err.to_string()),
        other => Err(format!(
            "unsupported metadata format '.{other}' (expected .toml or .json)"
        )),
    }
}

fn build(raw: RawMetadata, base_dir: &Path) -> std::result::Result<Metadata, String> {
    if raw.document.source_pdf.trim().is_empty() {
        return Err("document.source_pdf is empty".to_owned());
    }
    let source_pdf = PathBuf::from(&raw.document.source_pdf);
    let source_path = if source_pdf.is_absolute() {
        source_pdf
    } else {
        base_dir.join(source_pdf)
    };

    let source_name = match raw.document.name {
        Some(name) => {
            check_name(&name).map_err(|why| format!("document.name '{name}' {why}"))?;
            name
        }
        None => derive_source_name(&source_path).ok_or_else(|| {
            format!(
                "cannot derive a source name from '{}'; set document.name",
                source_path.display()
            )
        })?,
    };

    if raw.sections.is_empty() {
        return Err("no sections defined".to_owned());
    }

    let mut seen = HashSet::new();
    let mut sections = Vec::with_capacity(raw.sections.len());
    for (idx, section) in raw.sections.into_iter().enumerate() {
        let at = format!("sections[{idx}]");
        check_name(&section.name).map_err(|why| format!("{at}: name '{}' {why}", section.name))?;
        if !seen.insert(section.name.clone()) {
            return Err(format!("{at}: duplicate section name '{}'", section.name));
        }
        if section.title.trim().is_empty() {
            return Err(format!("{at} ('{}'): title is empty", section.name));
        }
        let start_page = positive_page(section.start_page)
            .ok_or_else(|| format!("{at} ('{}'): start_page must be >= 1", section.name))?;
        let end_page = positive_page(section.end_page)
            .ok_or_else(|| format!("{at} ('{}'): end_page must be >= 1", section.name))?;
        if end_page < start_page {
            return Err(format!(
                "{at} ('{}'): end_page {end_page} < start_page {start_page}",
                section.name
            ));
        }

        sections.push(SectionSpec {
            name: section.name,
            title: section.title,
            description: section.description.filter(|d| !d.trim().is_empty()),
            priority: section.priority,
            start_page,
            end_page,
        });
    }

    let title = raw
        .document
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| source_name.clone());

    Ok(Metadata {
        document: DocumentSpec {
            source_path,
            source_name,
            title,
            version: raw.document.version,
            date: raw.document.date,
        },
        sections,
    })
}

fn positive_page(page: i64) -> Option<u32> {
    u32::try_from(page).ok().filter(|p| *p >= 1)
}

fn check_name(name: &str) -> std::result::Result<(), &'static str> {
    if name.is_empty() {
        return Err("is empty");
    }
    if name.len() > MAX_NAME_LEN {
        return Err("is longer than 64 characters");
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !first_ok || !chars.all(is_name_char) {
        return Err("must match [a-z0-9][a-z0-9_-]*");
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'
}

fn derive_source_name(source_path: &Path) -> Option<String> {
    let stem = source_path.file_stem()?.to_str()?;
    let mut name = String::with_capacity(stem.len());
    for c in stem.chars().map(|c| c.to_ascii_lowercase()) {
        if is_name_char(c) {
            name.push(c);
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_matches(|c| c == '-' || c == '_');
    let name: String = name.chars().take(MAX_NAME_LEN).collect();
    check_name(&name).ok()?;
    Some(name)
}

pub fn filter_sections(sections: &[SectionSpec], name: Option<&str>) -> Result<Vec<SectionSpec>> {
    let Some(name) = name else {
        return Ok(sections.to_vec());
    };
    let selected = sections
        .iter()
        .filter(|s| s.name == name)
        .cloned()
        .collect::<Vec<_>>();
    if selected.is_empty() {
        return Err(PipelineError::NoMatchingSection {
            name: name.to_owned(),
            declared: sections
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    Ok(selected)
}

/// Checks every section's `end_page` against the document's real page count.
pub fn validate_against_document(
    _document: &DocumentSpec,
    sections: &[SectionSpec],
    total_pages: u32,
) -> Result<()> {
    for section in sections {
        if section.end_page > total_pages {
            return Err(PipelineError::Boundary {
                section: section.name.clone(),
                end_page: section.end_page,
                total_pages,
            });
        }
    }
    Ok(())
}
