use std::path::{Path, PathBuf};

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::formats::{IndexEntry, MasterIndex, MasterIndexSection, SectionIndex};
use crate::fsutil::{write_atomic, write_json_atomic};
use crate::ledger::RunLedger;
use crate::metadata::DocumentSpec;
use crate::processor::SectionResult;

pub const QUICK_REFERENCE_HEADINGS: [&str; 2] = ["Overview", "Key Concepts"];

#[derive(Debug, Clone, Serialize)]
pub struct ConsolidationReport {
    pub master_index_path: PathBuf,
    pub quick_reference_path: PathBuf,
    pub indexed_sections: usize,
    pub summarized_sections: usize,
}

pub fn master_index_path(output_dir: &Path, document: &DocumentSpec) -> PathBuf {
    output_dir.join(format!("{}.master-index.json", document.source_name))
}

pub fn quick_reference_path(output_dir: &Path, document: &DocumentSpec) -> PathBuf {
    output_dir.join(format!("{}.quick-reference.md", document.source_name))
}

/// Builds and writes both artifacts. Fails only when no section left a
/// usable index or summary behind; nothing is written in that case.
pub fn consolidate(
    document: &DocumentSpec,
    results: &[SectionResult],
    output_dir: &Path,
    generated_at: &str,
    ledger: &RunLedger,
) -> Result<ConsolidationReport> {
    let (master, indexed) = build_master_index(document, results, generated_at, ledger);
    let (quick_reference, summarized) =
        build_quick_reference(document, results, generated_at, ledger);

    if indexed == 0 && summarized == 0 {
        return Err(PipelineError::Consolidation {
            detail: format!(
                "none of the {} section(s) produced a usable index or summary file",
                results.len()
            ),
        });
    }
    if indexed == 0 {
        ledger.warn("CONSOLIDATE", "no usable index files; master index is empty");
    }
    if summarized == 0 {
        ledger.warn("CONSOLIDATE", "no usable summary files; quick reference is empty");
    }

    let master_index_path = master_index_path(output_dir, document);
    write_json_atomic(&master_index_path, &master).map_err(|err| {
        PipelineError::Consolidation {
            detail: format!("write {}: {err:#}", master_index_path.display()),
        }
    })?;
    ledger.info(
        "CONSOLIDATE",
        &format!(
            "master index: {} ({indexed}/{} sections, {} concepts, {} terms, {} topics)",
            master_index_path.display(),
            results.len(),
            master.all_concepts.len(),
            master.all_terms.len(),
            master.all_topics.len()
        ),
    );

    let quick_reference_path = quick_reference_path(output_dir, document);
    write_atomic(&quick_reference_path, quick_reference.as_bytes()).map_err(|err| {
        PipelineError::Consolidation {
            detail: format!("write {}: {err:#}", quick_reference_path.display()),
        }
    })?;
    ledger.info(
        "CONSOLIDATE",
        &format!(
            "quick reference: {} ({summarized}/{} sections)",
            quick_reference_path.display(),
            results.len()
        ),
    );

    Ok(ConsolidationReport {
        master_index_path,
        quick_reference_path,
        indexed_sections: indexed,
        summarized_sections: summarized,
    })
}

pub fn build_master_index(
    document: &DocumentSpec,
    results: &[SectionResult],
    generated_at: &str,
    ledger: &RunLedger,
) -> (MasterIndex, usize) {
    let mut master = MasterIndex {
        generated_at: generated_at.to_owned(),
        source: document.source_name.clone(),
        title: document.title.clone(),
        sections: Vec::new(),
        all_concepts: Vec::new(),
        all_terms: Vec::new(),
        all_topics: Vec::new(),
    };

    for result in results {
        let index = match read_section_index(&result.index_path) {
            Ok(Some(index)) => index,
            Ok(None) => {
                ledger.warn(
                    "CONSOLIDATE",
                    &format!(
                        "section '{}': index file missing, skipped: {}",
                        result.name,
                        result.index_path.display()
                    ),
                );
                continue;
            }
            Err(err) => {
                ledger.warn(
                    "CONSOLIDATE",
                    &format!("section '{}': unusable index, skipped: {err:#}", result.name),
                );
                continue;
            }
        };

        master.sections.push(MasterIndexSection {
            name: result.name.clone(),
            title: result.title.clone(),
            index_path: result.index_path.display().to_string(),
        });
        master.all_concepts.extend(index.concepts.iter().map(IndexEntry::label));
        master.all_terms.extend(index.terms.iter().map(IndexEntry::label));
        master.all_topics.extend(index.topics.iter().map(IndexEntry::label));
    }

    let usable = master.sections.len();
    (master, usable)
}

fn read_section_index(path: &Path) -> anyhow::Result<Option<SectionIndex>> {
    use anyhow::Context as _;

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let index = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(index))
}

pub fn build_quick_reference(
    document: &DocumentSpec,
    results: &[SectionResult],
    generated_at: &str,
    ledger: &RunLedger,
) -> (String, usize) {
    let mut out = format!("# {} Quick Reference\n\n", document.title);
    out.push_str(&format!("- Source: `{}`\n", document.source_name));
    if let Some(version) = document.version.as_deref() {
        out.push_str(&format!("- Version: {version}\n"));
    }
    out.push_str(&format!("- Generated: {generated_at}\n"));

    let mut summarized = 0usize;
    for result in results {
        let summary = match std::fs::read_to_string(&result.summary_path) {
            Ok(summary) => summary,
            Err(err) => {
                ledger.warn(
                    "CONSOLIDATE",
                    &format!(
                        "section '{}': summary unreadable, skipped: {}: {err}",
                        result.name,
                        result.summary_path.display()
                    ),
                );
                continue;
            }
        };
        summarized += 1;

        let parts = QUICK_REFERENCE_HEADINGS
            .iter()
            .filter_map(|heading| extract_subsection(&summary, heading).map(|body| (heading, body)))
            .collect::<Vec<_>>();
        if parts.is_empty() {
            ledger.info(
                "CONSOLIDATE",
                &format!(
                    "section '{}': summary has no Overview or Key Concepts",
                    result.name
                ),
            );
            continue;
        }

        out.push_str(&format!("\n---\n\n## {} (`{}`)\n", result.title, result.name));
        for (heading, body) in parts {
            out.push_str(&format!("\n### {heading}\n\n{body}\n"));
        }
    }

    (out, summarized)
}

#[derive(Debug)]
struct HeadingSpan {
    level: HeadingLevel,
    text: String,
    start: usize,
    end: usize,
}

/// Returns the body under the first heading named `name` (case-insensitive,
/// ignoring leading numbering and a trailing colon), up to the next heading
/// of the same or a higher level. `None` when the heading is absent or its
/// body is blank. Lines inside code fences never count as headings.
pub fn extract_subsection(markdown: &str, name: &str) -> Option<String> {
    let headings = collect_headings(markdown);
    let wanted = normalize_heading(name);

    let (idx, found) = headings
        .iter()
        .enumerate()
        .find(|(_, h)| normalize_heading(&h.text) == wanted)?;

    let body_end = headings[idx + 1..]
        .iter()
        .find(|h| (h.level as u8) <= (found.level as u8))
        .map(|h| h.start)
        .unwrap_or(markdown.len());

    let body = markdown.get(found.end..body_end)?.trim();
    (!body.is_empty()).then(|| body.to_owned())
}

fn collect_headings(markdown: &str) -> Vec<HeadingSpan> {
    let mut headings = Vec::new();
    let mut current: Option<HeadingSpan> = None;

    for (event, range) in Parser::new_ext(markdown, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                current = Some(HeadingSpan {
                    level,
                    text: String::new(),
                    start: range.start,
                    end: range.end,
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(heading) = current.as_mut() {
                    heading.text.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(heading) = current.take() {
                    headings.push(heading);
                }
            }
            _ => {}
        }
    }

    headings
}

fn normalize_heading(text: &str) -> String {
    text.trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_lowercase()
}
