use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::processor::SectionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug)]
pub struct RunLedger {
    path: PathBuf,
    started_at: DateTime<Utc>,
    state: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    file: Option<File>,
    last_ts: Option<DateTime<Utc>>,
    failure: Option<String>,
    warnings: Vec<String>,
}

impl RunLedger {
    /// Opens `<logs_dir>/docdigest-<timestamp>.log`. Never fails; an
    /// unwritable location puts the ledger into its degraded state.
    pub fn open(logs_dir: &Path) -> Self {
        let started_at = Utc::now();
        let path = logs_dir.join(format!(
            "docdigest-{}.log",
            started_at.format("%Y%m%dT%H%M%S%.6fZ")
        ));

        let mut state = LedgerState::default();
        match open_append(&path) {
            Ok(file) => state.file = Some(file),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(ledger = %path.display(), error = %message, "run ledger unavailable");
                state.failure = Some(message);
            }
        }

        Self {
            path,
            started_at,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record(&self, severity: Severity, category: &str, message: &str) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Lines carry microseconds; compare at that precision.
        let now = Utc::now();
        let mut ts = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        if let Some(last) = state.last_ts
            && ts <= last
        {
            ts = last + chrono::Duration::microseconds(1);
        }
        state.last_ts = Some(ts);

        let message = single_line(message);
        if severity == Severity::Warn {
            state.warnings.push(format!("[{category}] {message}"));
        }

        let line = format!(
            "{} [{category}] [{}] {message}\n",
            ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            severity.as_str()
        );

        let Some(file) = state.file.as_mut() else {
            return;
        };
        if let Err(err) = file.write_all(line.as_bytes()).and_then(|()| file.flush()) {
            tracing::error!(ledger = %self.path.display(), error = %err, "run ledger write failed; further ledger lines are dropped");
            state.file = None;
            state.failure = Some(format!("write {}: {err}", self.path.display()));
        }
    }

    pub fn debug(&self, category: &str, message: &str) {
        self.record(Severity::Debug, category, message);
    }

    pub fn info(&self, category: &str, message: &str) {
        self.record(Severity::Info, category, message);
    }

    pub fn warn(&self, category: &str, message: &str) {
        self.record(Severity::Warn, category, message);
    }

    pub fn error(&self, category: &str, message: &str) {
        self.record(Severity::Error, category, message);
    }

    pub fn failure(&self) -> Option<String> {
        self.lock_state().failure.clone()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.lock_state().warnings.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn run_record_path(&self) -> PathBuf {
        self.path.with_extension("run.json")
    }

    /// Writes the invocation's [`RunRecord`] next to the ledger. The file is
    /// created exclusively: a record is never rewritten.
    pub fn write_run_record(&self, record: &RunRecord) -> anyhow::Result<PathBuf> {
        let path = self.run_record_path();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("create run record: {}", path.display()))?;
        serde_json::to_writer_pretty(&mut file, record).context("serialize run record")?;
        file.write_all(b"\n").context("write run record newline")?;
        file.flush().context("flush run record")?;
        Ok(path)
    }
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create logs dir: {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open run ledger: {}", path.display()))
}

fn single_line(message: &str) -> String {
    if !message.contains('\n') {
        return message.to_owned();
    }
    message
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, Clone, Serialize)]
pub struct MetadataIdentity {
    pub path: String,
    pub sha256: String,
}

impl MetadataIdentity {
    pub fn of(path: &Path) -> anyhow::Result<Self> {
        use sha2::Digest as _;

        let bytes =
            std::fs::read(path).with_context(|| format!("read metadata: {}", path.display()))?;
        let digest = sha2::Sha256::digest(&bytes);
        Ok(Self {
            path: path.display().to_string(),
            sha256: hex::encode(digest),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub started_at: String,
    pub finished_at: String,
    pub status: RunStatus,
    pub skip_ai: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataIdentity>,
    pub tool_versions: BTreeMap<String, String>,
    pub selected_sections: Vec<String>,
    pub sections: Vec<SectionResult>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ledger: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line(line: &str) -> (DateTime<Utc>, String, String, String) {
        let (ts, rest) = line.split_once(' ').expect("timestamp");
        let (category, rest) = rest.split_once(' ').expect("category");
        let (severity, message) = rest.split_once(' ').expect("severity");
        (
            DateTime::parse_from_rfc3339(ts)
                .expect("rfc3339")
                .with_timezone(&Utc),
            category.to_owned(),
            severity.to_owned(),
            message.to_owned(),
        )
    }

    #[test]
    fn lines_are_parseable_and_monotonic() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let ledger = RunLedger::open(&temp.path().join("logs"));

        for idx in 0..50 {
            ledger.info("SLICE", &format!("event {idx}"));
        }
        ledger.warn("AI", "first line\nsecond line");
        ledger.error("RUN", "boom");

        let text = std::fs::read_to_string(ledger.path())?;
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 52);

        let parsed = lines.iter().map(|l| parse_line(l)).collect::<Vec<_>>();
        for pair in parsed.windows(2) {
            assert!(pair[0].0 < pair[1].0, "timestamps must strictly increase");
        }
        assert_eq!(parsed[0].1, "[SLICE]");
        assert_eq!(parsed[0].2, "[INFO]");
        assert_eq!(parsed[50].3, "first line | second line");
        assert_eq!(parsed[51].2, "[ERROR]");

        assert_eq!(ledger.warnings(), vec!["[AI] first line | second line".to_owned()]);
        assert!(ledger.failure().is_none());
        Ok(())
    }

    #[test]
    fn unwritable_location_degrades_without_panicking() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "file")?;

        let ledger = RunLedger::open(&blocker.join("logs"));
        ledger.info("RUN", "still running");
        ledger.warn("RUN", "kept for the run record");

        assert!(ledger.failure().is_some());
        assert_eq!(ledger.warnings().len(), 1);
        Ok(())
    }

    #[test]
    fn run_record_is_written_once() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let ledger = RunLedger::open(temp.path());
        let record = RunRecord {
            started_at: "2026-01-01T00:00:00Z".to_owned(),
            finished_at: "2026-01-01T00:00:01Z".to_owned(),
            status: RunStatus::Success,
            skip_ai: false,
            metadata: None,
            tool_versions: BTreeMap::new(),
            selected_sections: vec!["intro".to_owned()],
            sections: Vec::new(),
            warnings: Vec::new(),
            error: None,
            ledger: ledger.path().display().to_string(),
        };

        let path = ledger.write_run_record(&record)?;
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(value["status"], "success");
        assert!(ledger.write_run_record(&record).is_err());
        Ok(())
    }

    #[test]
    fn metadata_identity_hashes_contents() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("meta.toml");
        std::fs::write(&path, "abc")?;
        let identity = MetadataIdentity::of(&path)?;
        assert_eq!(
            identity.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }
}
