use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::fsutil::write_json_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAiResponse {
    pub source_name: String,
    pub section_name: String,
    pub engine: String,
    pub created_at: String,
    pub raw_response: String,
}

#[derive(Debug, Clone)]
pub struct AiResponseCache {
    dir: PathBuf,
}

impl AiResponseCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, source_name: &str, section_name: &str) -> PathBuf {
        self.dir
            .join(format!("{source_name}.ai-response.{section_name}.json"))
    }

    pub fn put(
        &self,
        source_name: &str,
        section_name: &str,
        engine: &str,
        raw_response: &str,
    ) -> anyhow::Result<PathBuf> {
        let entry = CachedAiResponse {
            source_name: source_name.to_owned(),
            section_name: section_name.to_owned(),
            engine: engine.to_owned(),
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            raw_response: raw_response.to_owned(),
        };
        let path = self.entry_path(source_name, section_name);
        write_json_atomic(&path, &entry)
            .with_context(|| format!("write cache entry: {}", path.display()))?;
        Ok(path)
    }

    pub fn get(
        &self,
        source_name: &str,
        section_name: &str,
    ) -> anyhow::Result<Option<CachedAiResponse>> {
        let path = self.entry_path(source_name, section_name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read cache entry: {}", path.display()));
            }
        };
        let entry: CachedAiResponse = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse cache entry: {}", path.display()))?;
        if entry.source_name != source_name || entry.section_name != section_name {
            anyhow::bail!(
                "cache entry {} belongs to {}/{}",
                path.display(),
                entry.source_name,
                entry.section_name
            );
        }
        Ok(Some(entry))
    }

    pub fn contains(&self, source_name: &str, section_name: &str) -> bool {
        self.entry_path(source_name, section_name).is_file()
    }
}
