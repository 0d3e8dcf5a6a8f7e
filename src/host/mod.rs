pub mod native;

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process::{Child, ExitStatus},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, warn};

pub use native::Native;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// - Runs external tools
/// - Exposes file read (for artifacts the tools leave behind)
pub trait Host: Sync {
    fn launch(&self, invocation: &Invocation) -> Result<Child, LaunchError>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
}

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// One external command, run inside `cwd`. Output goes to `<cwd>/<name>.stdout`
/// and `<cwd>/<name>.stderr`.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn stdout_path(&self) -> PathBuf {
        self.cwd.join(format!("{}.stdout", self.name))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.cwd.join(format!("{}.stderr", self.name))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Shared cancellation flag, raised once (e.g. on Ctrl-C) and never lowered.
#[derive(Clone, Debug, Default)]
pub struct Abort(Arc<AtomicBool>);

impl Abort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct Limits {
    pub timeout: Duration,
    pub abort: Abort,
}

#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Finished {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("`{program}` is not installed")]
    Unavailable { program: String },
    #[error("`{program}` did not finish within {after:?} and was killed")]
    Timeout { program: String, after: Duration },
    #[error("`{program}` was killed by abort")]
    Aborted { program: String },
    #[error("failed to spawn `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("io error while running `{program}`")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl From<LaunchError> for ProcessError {
    fn from(err: LaunchError) -> Self {
        match err {
            LaunchError::NotFound(program) => ProcessError::Unavailable { program },
            LaunchError::Spawn { program, source } => ProcessError::Spawn { program, source },
        }
    }
}

/// Launches the invocation and waits for it, killing it when the timeout
/// expires or the abort flag is raised.
pub fn run<H: Host + ?Sized>(
    host: &H,
    invocation: &Invocation,
    limits: &Limits,
) -> Result<Finished, ProcessError> {
    let program = || invocation.program.clone();
    let io_err = |source| ProcessError::Io {
        program: program(),
        source,
    };

    if limits.abort.is_triggered() {
        return Err(ProcessError::Aborted { program: program() });
    }

    debug!("{}", invocation);
    let mut child = host.launch(invocation)?;
    let started = Instant::now();

    let status = loop {
        match child.try_wait().map_err(io_err)? {
            Some(status) => break status,
            None if limits.abort.is_triggered() => {
                kill(&mut child, &invocation.program);
                return Err(ProcessError::Aborted { program: program() });
            }
            None if started.elapsed() >= limits.timeout => {
                warn!("{} timed out after {:?}", invocation.program, limits.timeout);
                kill(&mut child, &invocation.program);
                return Err(ProcessError::Timeout {
                    program: program(),
                    after: limits.timeout,
                });
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    let stdout = read_lossy(&invocation.stdout_path()).map_err(io_err)?;
    let stderr = read_lossy(&invocation.stderr_path()).map_err(io_err)?;

    Ok(Finished {
        status,
        stdout,
        stderr,
    })
}

fn kill(child: &mut Child, program: &str) {
    // the process may have exited between try_wait and kill
    let _ = child.kill();
    if let Err(err) = child.wait() {
        warn!("failed to reap `{}`: {}", program, err);
    }
}

fn read_lossy(path: &Path) -> io::Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}
