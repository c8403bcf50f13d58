use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use anyhow::Context as _;

use crate::config::ToolsConfig;
use crate::ledger::RunLedger;

const STDERR_TAIL_CHARS: usize = 400;

pub trait DocumentTools {
    fn page_count(&self, pdf: &Path, ledger: &RunLedger) -> anyhow::Result<u32>;

    fn slice(
        &self,
        pdf: &Path,
        start: u32,
        end: u32,
        out: &Path,
        ledger: &RunLedger,
    ) -> anyhow::Result<()>;

    fn extract_text(&self, pdf: &Path, out: &Path, ledger: &RunLedger) -> anyhow::Result<()>;

    fn versions(&self) -> BTreeMap<String, String>;
}

#[derive(Debug, Clone)]
pub struct CommandTools {
    config: ToolsConfig,
}

impl CommandTools {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    fn run(
        &self,
        category: &str,
        program: &str,
        args: Vec<OsString>,
        ledger: &RunLedger,
    ) -> anyhow::Result<Output> {
        let command_line = render_command_line(program, &args);
        ledger.info("COMMAND", &format!("[{category}] {command_line}"));
        tracing::debug!(command = %command_line, "run tool");

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawn {program}"))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            ledger.debug(category, &format!("{program} stderr: {}", tail(stderr)));
        }
        ledger.info(
            "COMMAND",
            &format!("[{category}] {program} exited with {}", output.status),
        );

        if !output.status.success() {
            let mut message = format!("`{command_line}` failed ({})", output.status);
            if !stderr.is_empty() {
                message.push_str(": ");
                message.push_str(&tail(stderr));
            }
            anyhow::bail!(message);
        }
        Ok(output)
    }
}

impl DocumentTools for CommandTools {
    fn page_count(&self, pdf: &Path, ledger: &RunLedger) -> anyhow::Result<u32> {
        let output = self.run(
            "BOUNDARY",
            &self.config.pdfinfo,
            vec![pdf.as_os_str().to_owned()],
            ledger,
        )?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_page_count(&stdout)
            .with_context(|| format!("read page count from {} output", self.config.pdfinfo))
    }

    fn slice(
        &self,
        pdf: &Path,
        start: u32,
        end: u32,
        out: &Path,
        ledger: &RunLedger,
    ) -> anyhow::Result<()> {
        let args = vec![
            OsString::from("--empty"),
            OsString::from("--pages"),
            pdf.as_os_str().to_owned(),
            OsString::from(format!("{start}-{end}")),
            OsString::from("--"),
            out.as_os_str().to_owned(),
        ];
        self.run("SLICE", &self.config.qpdf, args, ledger)?;
        Ok(())
    }

    fn extract_text(&self, pdf: &Path, out: &Path, ledger: &RunLedger) -> anyhow::Result<()> {
        let args = vec![
            OsString::from("-layout"),
            pdf.as_os_str().to_owned(),
            out.as_os_str().to_owned(),
        ];
        self.run("EXTRACT", &self.config.pdftotext, args, ledger)?;
        Ok(())
    }

    fn versions(&self) -> BTreeMap<String, String> {
        [
            ("qpdf", &self.config.qpdf, "--version"),
            ("pdftotext", &self.config.pdftotext, "-v"),
            ("pdfinfo", &self.config.pdfinfo, "-v"),
        ]
        .into_iter()
        .map(|(name, program, flag)| (name.to_owned(), detect_version(program, flag)))
        .collect()
    }
}

pub fn parse_page_count(pdfinfo_stdout: &str) -> anyhow::Result<u32> {
    let line = pdfinfo_stdout
        .lines()
        .find(|line| line.trim_start().starts_with("Pages:"))
        .ok_or_else(|| anyhow::anyhow!("no `Pages:` line"))?;
    let value = line.trim_start()["Pages:".len()..].trim();
    let pages: u32 = value
        .parse()
        .with_context(|| format!("invalid page count {value:?}"))?;
    if pages == 0 {
        anyhow::bail!("document reports zero pages");
    }
    Ok(pages)
}

/// First non-empty line a tool prints for its version flag, on either stream.
fn detect_version(program: &str, flag: &str) -> String {
    let Ok(output) = Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .output()
    else {
        return "unavailable".to_owned();
    };
    [&output.stdout, &output.stderr]
        .into_iter()
        .flat_map(|bytes| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(|l| l.trim().to_owned())
                .collect::<Vec<_>>()
        })
        .find(|l| !l.is_empty())
        .unwrap_or_else(|| "unknown".to_owned())
}

fn render_command_line(program: &str, args: &[OsString]) -> String {
    let mut parts = vec![quote(program)];
    parts.extend(args.iter().map(|a| quote(&a.to_string_lossy())));
    parts.join(" ")
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@".contains(c))
    {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn tail(text: &str) -> String {
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text.to_owned();
    }
    let skipped = text.chars().skip(count - STDERR_TAIL_CHARS).collect::<String>();
    format!("…{skipped}")
}
