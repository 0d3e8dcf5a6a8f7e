//! Per-pair results and the run summary.

use serde::{Serialize, Serializer};
use std::{
    fmt, fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    compare::{CrossCheck, LineDiff},
    toolchain::ToolchainId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Assembly,
    Extraction,
    SymbolNotFound,
    Disassembler,
    Reassembly,
    Divergence,
    Timeout,
    /// the pair panicked
    Internal,
    Io,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<LineDiff>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diff: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail(Failure),
    /// a tool could not be found; never fails the run
    Skipped { program: String },
    BaselineMissing { path: PathBuf },
    Aborted { reason: String },
}

impl Status {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Status::Fail(_) | Status::BaselineMissing { .. } | Status::Aborted { .. }
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pass => write!(f, "pass"),
            Status::Fail(failure) => write!(f, "FAIL ({})", failure.kind),
            Status::Skipped { program } => write!(f, "skipped (`{program}` unavailable)"),
            Status::BaselineMissing { .. } => write!(f, "baseline missing"),
            Status::Aborted { reason } => write!(f, "aborted ({reason})"),
        }
    }
}

/// What make-known-good did to the stored baseline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BaselineAction {
    Created,
    Unchanged,
    Updated { diff: LineDiff },
}

fn as_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

fn as_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub case: String,
    pub toolchain: ToolchainId,
    pub status: Status,
    /// what the case is there to exercise
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rationale: String,
    pub binaries: Vec<PathBuf>,
    #[serde(serialize_with = "as_hex")]
    pub extracted: Vec<u8>,
    pub base: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disassembly: Option<String>,
    pub extras: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<BaselineAction>,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
}

impl RunResult {
    pub fn new(case: impl Into<String>, toolchain: ToolchainId, status: Status) -> Self {
        Self {
            case: case.into(),
            toolchain,
            status,
            rationale: String::new(),
            binaries: Vec::new(),
            extracted: Vec::new(),
            base: None,
            disassembly: None,
            extras: Vec::new(),
            baseline: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn pair(&self) -> String {
        format!("{}/{}", self.case, self.toolchain)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub baseline_missing: usize,
    pub aborted: usize,
    pub cross_check_failures: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub counts: Counts,
    pub results: Vec<RunResult>,
    pub cross_checks: Vec<CrossCheck>,
}

impl Report {
    /// Sorts by (case, toolchain) so rendering doesn't depend on scheduling.
    pub fn new(mut results: Vec<RunResult>, mut cross_checks: Vec<CrossCheck>) -> Self {
        results.sort_by(|a, b| (&a.case, &a.toolchain).cmp(&(&b.case, &b.toolchain)));
        cross_checks.sort_by(|a, b| a.case.cmp(&b.case));

        let mut counts = Counts::default();
        for result in &results {
            match result.status {
                Status::Pass => counts.passed += 1,
                Status::Fail(_) => counts.failed += 1,
                Status::Skipped { .. } => counts.skipped += 1,
                Status::BaselineMissing { .. } => counts.baseline_missing += 1,
                Status::Aborted { .. } => counts.aborted += 1,
            }
        }
        counts.cross_check_failures = cross_checks.iter().filter(|c| !c.agrees()).count();

        Self {
            counts,
            results,
            cross_checks,
        }
    }

    /// Skipped pairs alone never fail a run.
    pub fn success(&self) -> bool {
        !self.results.iter().any(|r| r.status.is_failure()) && self.counts.cross_check_failures == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter().filter(|r| r.status.is_failure())
    }

    pub fn write_json(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        writeln!(out)?;
        out.flush()
    }
}

fn indented(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    for line in text.lines() {
        writeln!(f, "      {line}")?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(f, "{:<40} {}", result.pair(), result.status)?;
        }

        for result in self.failures() {
            writeln!(f)?;
            match &result.status {
                Status::Fail(failure) => {
                    writeln!(f, "{} failed: {}", result.pair(), failure.kind)?;
                    indented(f, &failure.message)?;
                    if let Some(diff) = &failure.diff {
                        indented(f, &diff.to_string())?;
                    }
                }
                Status::BaselineMissing { path } => writeln!(
                    f,
                    "{}: no known good at {}, run with --make-known-good",
                    result.pair(),
                    path.display()
                )?,
                Status::Aborted { reason } => writeln!(f, "{}: aborted, {}", result.pair(), reason)?,
                Status::Pass | Status::Skipped { .. } => {}
            }
            if !result.rationale.is_empty() {
                writeln!(f, "  case rationale: {}", result.rationale)?;
            }
        }

        for check in self.cross_checks.iter().filter(|c| !c.agrees()) {
            for divergence in &check.divergences {
                writeln!(f)?;
                writeln!(
                    f,
                    "{}: `{}` disagrees with `{}`",
                    check.case, divergence.toolchain, check.reference
                )?;
                indented(f, &divergence.diff.to_string())?;
            }
        }

        let c = &self.counts;
        writeln!(f)?;
        writeln!(
            f,
            "{} pairs: {} passed, {} failed, {} skipped, {} baseline missing, {} aborted; {} cross-check failures",
            self.results.len(),
            c.passed,
            c.failed,
            c.skipped,
            c.baseline_missing,
            c.aborted,
            c.cross_check_failures
        )
    }
}
