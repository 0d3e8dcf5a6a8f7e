//! Runs the (case × toolchain) matrix.
//!
//! Pairs are independent: each gets its own working directory and nothing
//! is shared between them but the read-only suite and the abort flag. Jobs
//! go out to a scoped worker pool over one channel and results come back
//! over another to a single consumer, which is the only place results are
//! collected.

use itertools::Itertools;
use std::{
    any::Any,
    collections::BTreeSet,
    fs, io,
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    case::TestCase,
    compare::{self, Comparison, CrossCheck},
    disasm::{self, DisassemblerError, Request},
    extract::{self, ExtractionError, Extracted},
    host::{Abort, Host, Limits, ProcessError},
    manifest::Suite,
    report::{BaselineAction, Failure, FailureKind, Report, RunResult, Status},
    toolchain::{AssembleError, ToolchainId, ToolchainSpec},
};

/// Built once from the command line, read by every worker.
#[derive(Clone, Debug)]
pub struct Options {
    pub make_extras: bool,
    pub check_disassembly: bool,
    pub make_known_good: bool,
    /// toolchains allowed to run; a pair needs its toolchain in both this and
    /// the case's own set
    pub assemblers: BTreeSet<ToolchainId>,
    pub jobs: usize,
    pub timeout: Duration,
    pub work_dir: PathBuf,
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("no case named `{0}`")]
    UnknownCase(String),
    #[error("no toolchain named `{0}`")]
    UnknownToolchain(ToolchainId),
}

/// Bytes to show on either side of a reassembly mismatch
const CONTEXT: usize = 8;

#[derive(Error, Debug)]
enum PairError {
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error(transparent)]
    Extract(#[from] ExtractionError),
    #[error(transparent)]
    Disassemble(#[from] DisassemblerError),
    #[error("reassembling the disassembly")]
    Reassemble(#[source] AssembleError),
    #[error(
        "reassembled image differs at offset {offset} (${address:04x})\n  extracted:   {expected}\n  reassembled: {got}"
    )]
    Mismatch {
        offset: usize,
        address: u64,
        expected: String,
        got: String,
    },
    #[error("io error in {0}")]
    Io(PathBuf, #[source] io::Error),
}

impl PairError {
    fn process(&self) -> Option<&ProcessError> {
        match self {
            PairError::Assemble(AssembleError::Process(e))
            | PairError::Reassemble(AssembleError::Process(e))
            | PairError::Disassemble(DisassemblerError::Process(e)) => Some(e),
            _ => None,
        }
    }

    fn kind(&self) -> FailureKind {
        match self {
            PairError::Assemble(AssembleError::NotApplicable { .. }) => FailureKind::Configuration,
            PairError::Assemble(AssembleError::Io(..)) => FailureKind::Io,
            PairError::Assemble(_) => FailureKind::Assembly,
            PairError::Extract(ExtractionError::SymbolNotFound { .. }) => FailureKind::SymbolNotFound,
            PairError::Extract(_) => FailureKind::Extraction,
            PairError::Disassemble(_) => FailureKind::Disassembler,
            PairError::Reassemble(_) | PairError::Mismatch { .. } => FailureKind::Reassembly,
            PairError::Io(..) => FailureKind::Io,
        }
    }

    fn into_status(self) -> Status {
        let kind = match self.process() {
            Some(ProcessError::Unavailable { program }) => {
                return Status::Skipped {
                    program: program.clone(),
                }
            }
            Some(ProcessError::Aborted { program }) => {
                return Status::Aborted {
                    reason: format!("`{program}` killed"),
                }
            }
            Some(ProcessError::Timeout { .. }) => FailureKind::Timeout,
            _ => self.kind(),
        };
        Status::Fail(Failure::new(kind, format!("{:#}", anyhow::Error::new(self))))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PairError + '_ {
    move |e| PairError::Io(path.to_path_buf(), e)
}

/// Empties (or creates) a pair's working directory.
fn reset_dir(dir: &Path) -> Result<(), PairError> {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(PairError::Io(dir.to_path_buf(), e)),
    }
    fs::create_dir_all(dir).map_err(io_err(dir))
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}

fn window(bytes: &[u8], offset: usize) -> String {
    let from = offset.saturating_sub(CONTEXT);
    let to = (offset + CONTEXT).min(bytes.len());
    if from >= to {
        return "(end)".to_string();
    }
    format!("+{from}: {}", hex::encode(&bytes[from..to]))
}

/// One (case, toolchain) combination.
#[derive(Clone, Copy, Debug)]
pub struct Pair<'a> {
    pub case: &'a TestCase,
    pub toolchain: &'a ToolchainSpec,
}

pub struct CaseRunner<'a, H: Host + ?Sized> {
    host: &'a H,
    suite: &'a Suite,
    options: &'a Options,
    abort: Abort,
}

impl<'a, H: Host + ?Sized> CaseRunner<'a, H> {
    pub fn new(host: &'a H, suite: &'a Suite, options: &'a Options, abort: Abort) -> Self {
        Self {
            host,
            suite,
            options,
            abort,
        }
    }

    fn limits(&self) -> Limits {
        Limits {
            timeout: self.options.timeout,
            abort: self.abort.clone(),
        }
    }

    /// Case names from the command line; nothing or `all` selects every case.
    pub fn select(&self, names: &[String]) -> Result<Vec<&'a TestCase>, RunnerError> {
        for id in &self.options.assemblers {
            if !self.suite.toolchains.contains_key(id) {
                return Err(RunnerError::UnknownToolchain(id.clone()));
            }
        }

        if names.is_empty() || names.iter().any(|n| n == "all") {
            return Ok(self.suite.cases.iter().collect());
        }

        names
            .iter()
            .unique()
            .map(|name| {
                self.suite
                    .case(name)
                    .ok_or_else(|| RunnerError::UnknownCase(name.clone()))
            })
            .collect()
    }

    /// Every applicable pair; a case is never paired with a toolchain it
    /// doesn't declare.
    pub fn matrix(&self, cases: &[&'a TestCase]) -> Vec<Pair<'a>> {
        let suite = self.suite;
        let allowed = &self.options.assemblers;
        cases
            .iter()
            .flat_map(move |&case| {
                case.assemblers
                    .iter()
                    .filter(move |id| allowed.contains(*id))
                    .filter_map(move |id| suite.toolchains.get(id))
                    .map(move |toolchain| Pair { case, toolchain })
            })
            .collect()
    }

    pub fn run(&self, cases: &[&'a TestCase]) -> Report {
        let pairs = self.matrix(cases);
        let total = pairs.len();
        let workers = self.options.jobs.clamp(1, total.max(1));
        info!("running {} pairs on {} workers", total, workers);

        let (job_tx, job_rx) = flume::unbounded::<Pair>();
        let (result_tx, result_rx) = flume::unbounded::<RunResult>();

        for pair in pairs {
            if job_tx.send(pair).is_err() {
                break;
            }
        }
        drop(job_tx);

        let results = thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                s.spawn(move || {
                    for pair in job_rx.iter() {
                        let result = if self.abort.is_triggered() {
                            RunResult::new(
                                &pair.case.name,
                                pair.toolchain.id.clone(),
                                Status::Aborted {
                                    reason: "not started".to_string(),
                                },
                            )
                        } else {
                            self.run_guarded(pair)
                        };
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            let mut results = Vec::with_capacity(total);
            for result in result_rx.iter() {
                info!("{}: {}", result.pair(), result.status);
                results.push(result);
            }
            results
        });

        let cross_checks = Self::cross_checks(&results);
        Report::new(results, cross_checks)
    }

    fn cross_checks(results: &[RunResult]) -> Vec<CrossCheck> {
        results
            .iter()
            .filter_map(|r| r.disassembly.as_deref().map(|text| (&r.case, (r.toolchain.clone(), text))))
            .into_group_map()
            .into_iter()
            .filter_map(|(case, texts)| compare::cross_check(case, &texts))
            .inspect(|check| {
                if !check.agrees() {
                    warn!("{}: toolchains disagree", check.case);
                }
            })
            .collect()
    }

    /// A panic fails only the pair it happened in.
    fn run_guarded(&self, pair: Pair) -> RunResult {
        let started = Instant::now();
        let mut result = RunResult::new(&pair.case.name, pair.toolchain.id.clone(), Status::Pass);
        result.rationale = pair.case.rationale.clone();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_pair(pair, &mut result)));

        result.status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => err.into_status(),
            Err(payload) => Status::Fail(Failure::new(FailureKind::Internal, panic_message(payload))),
        };
        result.elapsed = started.elapsed();
        result
    }

    fn run_pair(&self, pair: Pair, result: &mut RunResult) -> Result<Status, PairError> {
        let Pair { case, toolchain } = pair;
        let limits = self.limits();
        let workdir = self
            .options
            .work_dir
            .join(&case.name)
            .join(toolchain.id.as_str());
        reset_dir(&workdir)?;
        debug!("{}/{} in {}", case.name, toolchain.id, workdir.display());

        let images = toolchain.assemble(self.host, case, &workdir, &limits)?;
        result.binaries = images.iter().map(|a| a.binary.clone()).collect();

        let extracted = extract::extract(&case.sources, &images, case.composition)?;
        result.extracted = extracted.bytes.clone();
        result.base = Some(extracted.base);

        let request = Request {
            dialect: &toolchain.dialect,
            control: case.control.as_deref(),
            extras: self.options.make_extras,
        };
        let disassembly =
            self.suite
                .disassembler
                .disassemble(self.host, &extracted, &request, &workdir, &limits)?;
        result.extras = disassembly.extras;
        result.disassembly = Some(disassembly.text.clone());

        if self.options.make_extras {
            let dir = disasm::extras_dir(&workdir);
            for (idx, assembled) in images.iter().enumerate() {
                for side in assembled.side.iter().filter(|p| p.is_file()) {
                    let name = side.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                    let target = dir.join(format!("part{idx}-{name}"));
                    fs::copy(side, &target).map_err(io_err(side))?;
                    result.extras.push(target);
                }
            }
        }

        if self.options.check_disassembly {
            self.reassemble(pair, &extracted, &disassembly.text, &workdir, &limits)?;
        }

        let text = disassembly.text;
        let store = &self.suite.baselines;
        let path = store.path(&case.name, &toolchain.id);

        if self.options.make_known_good {
            let previous = store.read(&case.name, &toolchain.id).map_err(io_err(&path))?;
            store.write(&case.name, &toolchain.id, &text).map_err(io_err(&path))?;

            let action = match previous {
                None => BaselineAction::Created,
                Some(previous) => match compare::compare(&text, &previous) {
                    Comparison::Match => BaselineAction::Unchanged,
                    Comparison::Divergence(diff) => {
                        info!("{}/{}: known good updated\n{}", case.name, toolchain.id, diff);
                        BaselineAction::Updated { diff }
                    }
                },
            };
            result.baseline = Some(action);
            return Ok(Status::Pass);
        }

        let status = match store.read(&case.name, &toolchain.id).map_err(io_err(&path))? {
            None => Status::BaselineMissing { path },
            Some(baseline) => match compare::compare(&text, &baseline) {
                Comparison::Match => Status::Pass,
                Comparison::Divergence(diff) => Status::Fail(Failure {
                    kind: FailureKind::Divergence,
                    message: format!("disassembly differs from {}", path.display()),
                    diff: Some(diff),
                }),
            },
        };
        Ok(status)
    }

    /// Assembles the disassembly with the same toolchain; the image must be
    /// the bytes that were disassembled.
    fn reassemble(
        &self,
        pair: Pair,
        extracted: &Extracted,
        text: &str,
        workdir: &Path,
        limits: &Limits,
    ) -> Result<(), PairError> {
        let Pair { case, toolchain } = pair;
        let dir = workdir.join("reassembly");
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let source = dir.join(format!("{}.{}", case.name, toolchain.extension));
        fs::write(&source, text).map_err(io_err(&source))?;

        let assembled = toolchain
            .assemble_source(self.host, &source, &dir, limits)
            .map_err(PairError::Reassemble)?;

        match first_difference(&extracted.bytes, &assembled.image) {
            None => Ok(()),
            Some(offset) => Err(PairError::Mismatch {
                offset,
                address: extracted.base + offset as u64,
                expected: window(&extracted.bytes, offset),
                got: window(&assembled.image, offset),
            }),
        }
    }
}
