use anyhow::{Context, Result};
use std::{
    collections::BTreeSet,
    env,
    num::NonZeroUsize,
    path::PathBuf,
    process::ExitCode,
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rtcheck::{
    host::{Abort, Native},
    manifest,
    runner::{CaseRunner, Options},
    toolchain::ToolchainId,
};

#[derive(argh::FromArgs)]
/// round-trip check of a disassembler against several assemblers
struct Arguments {
    #[argh(positional)]
    /// cases to run, or `all` (the default)
    cases: Vec<String>,

    #[argh(switch)]
    /// have the disassembler write its extra outputs too
    make_extras: bool,

    #[argh(switch)]
    /// reassemble each disassembly and compare the bytes
    check_disassembly: bool,

    #[argh(switch)]
    /// store the current disassemblies as known good
    make_known_good: bool,

    #[argh(option)]
    /// only use these toolchains: acme,beebasm,...
    assemblers: Option<AssemblerList>,

    #[argh(option, default = r#"PathBuf::from("rtcheck.toml")"#)]
    /// suite manifest
    manifest: PathBuf,

    #[argh(option, short = 'j')]
    /// pairs to run at once
    jobs: Option<usize>,

    #[argh(option, default = "60")]
    /// seconds before an external tool is killed
    timeout: u64,

    #[argh(option, default = r#"PathBuf::from("rtcheck-work")"#)]
    /// per-pair working directories go here
    work_dir: PathBuf,

    #[argh(option)]
    /// write a json report here
    report: Option<PathBuf>,
}

struct AssemblerList(BTreeSet<ToolchainId>);

impl argh::FromArgValue for AssemblerList {
    fn from_arg_value(value: &str) -> Result<Self, String> {
        let ids: BTreeSet<_> = value
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToolchainId::new)
            .collect();

        if ids.is_empty() {
            return Err(format!("No assemblers in: {}", value));
        }
        Ok(AssemblerList(ids))
    }
}

/// Raises `abort` on the first Ctrl-C.
fn watch_ctrl_c(abort: Abort) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("signal runtime")?;

    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("interrupted, killing running tools");
                        abort.trigger();
                    }
                    Err(err) => warn!("cannot listen for ctrl-c: {}", err),
                }
            })
        })
        .context("spawning ctrl-c watcher")?;

    Ok(())
}

/// `Ok(false)` when the run itself failed
fn run(args: Arguments) -> Result<bool> {
    let suite = manifest::load(&args.manifest)
        .with_context(|| format!("loading {}", args.manifest.display()))?;

    let assemblers = match args.assemblers {
        Some(AssemblerList(ids)) => ids,
        None => suite.toolchains.keys().cloned().collect(),
    };
    let jobs = args.jobs.unwrap_or_else(|| {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    });

    // tools run inside per-pair directories, so every path they see is
    // absolute
    let cwd = env::current_dir().context("current directory")?;

    let options = Options {
        make_extras: args.make_extras,
        check_disassembly: args.check_disassembly,
        make_known_good: args.make_known_good,
        assemblers,
        jobs,
        timeout: Duration::from_secs(args.timeout),
        work_dir: cwd.join(args.work_dir),
    };

    let abort = Abort::new();
    watch_ctrl_c(abort.clone())?;

    let runner = CaseRunner::new(&Native, &suite, &options, abort);
    let cases = runner.select(&args.cases)?;
    let report = runner.run(&cases);

    print!("{report}");

    if let Some(path) = args.report {
        report
            .write_json(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("report written to {}", path.display());
    }

    Ok(report.success())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(argh::from_env()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(2)
        }
    }
}
