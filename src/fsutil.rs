use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Replaces `path` with `data` via a sibling temp file and a rename, so
/// readers see either the old contents or the new ones, never a prefix.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = tmp_sibling(path)?;
    let result = (|| -> anyhow::Result<()> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)
            .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync tmp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("rename tmp to final: {}", path.display()))
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

pub fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut data = serde_json::to_vec_pretty(value).context("serialize json")?;
    data.push(b'\n');
    write_atomic(path, &data)
}

fn tmp_sibling(path: &Path) -> anyhow::Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    Ok(path.with_file_name(format!(
        ".{file_name}.tmp.{}",
        uuid::Uuid::new_v4().simple()
    )))
}
