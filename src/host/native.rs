use std::{
    fs::{self, File},
    io,
    path::Path,
    process::{Child, Command, Stdio},
};
use tracing::debug;

use super::{Host, Invocation, LaunchError};

/// Runs tools directly on this machine, resolving programs through `PATH`.
pub struct Native;

impl Host for Native {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn launch(&self, invocation: &Invocation) -> Result<Child, LaunchError> {
        let spawn_err = |source| LaunchError::Spawn {
            program: invocation.program.clone(),
            source,
        };

        // files instead of pipes so a chatty tool can't block on a full pipe
        // while we poll it
        let stdout = File::create(invocation.stdout_path()).map_err(spawn_err)?;
        let stderr = File::create(invocation.stderr_path()).map_err(spawn_err)?;

        debug!("launching {} in {}", invocation, invocation.cwd.display());

        Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    LaunchError::NotFound(invocation.program.clone())
                } else {
                    spawn_err(err)
                }
            })
    }
}
