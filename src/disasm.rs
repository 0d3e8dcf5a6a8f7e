//! Driving the disassembler under test.
//!
//! The disassembler is an external program; we only hand it a file of bytes
//! and a base address and take whatever it prints as the disassembly.

use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    extract::Extracted,
    host::{self, Host, Invocation, Limits, ProcessError},
};

#[derive(Clone, Debug, Deserialize)]
pub struct DisassemblerSpec {
    pub program: String,
    /// Placeholders: `{input}`, `{base}`, `{base_dec}`, `{dialect}`,
    /// `{control}`, `{extras}`. Arguments rendering to "" are dropped.
    pub args: Vec<String>,
    /// appended to `args` when extras are requested
    #[serde(default)]
    pub extras_args: Vec<String>,
}

#[derive(Error, Debug)]
pub enum DisassemblerError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("`{program}` failed ({status})\n{stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("io error in {0}")]
    Io(PathBuf, #[source] io::Error),
}

/// Per-pair inputs that aren't bytes.
#[derive(Clone, Debug)]
pub struct Request<'a> {
    pub dialect: &'a str,
    pub control: Option<&'a Path>,
    pub extras: bool,
}

#[derive(Clone, Debug)]
pub struct Disassembly {
    pub text: String,
    /// files found in the extras directory; empty unless requested
    pub extras: Vec<PathBuf>,
}

impl DisassemblerSpec {
    fn command(&self, input: &Path, base: u64, request: &Request, workdir: &Path) -> Invocation {
        let extras_dir = extras_dir(workdir);
        let control = request
            .control
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let templates = self
            .args
            .iter()
            .chain(request.extras.then_some(&self.extras_args).into_iter().flatten());

        let args = templates
            .map(|arg| {
                arg.replace("{input}", &input.display().to_string())
                    .replace("{base}", &format!("0x{base:04x}"))
                    .replace("{base_dec}", &base.to_string())
                    .replace("{dialect}", request.dialect)
                    .replace("{control}", &control)
                    .replace("{extras}", &extras_dir.display().to_string())
            })
            .filter(|arg| !arg.is_empty())
            .collect();

        Invocation {
            name: "disassemble".to_string(),
            program: self.program.clone(),
            args,
            cwd: workdir.to_path_buf(),
        }
    }

    /// Writes the extracted bytes to `<workdir>/extracted.bin` and runs the
    /// disassembler on them.
    pub fn disassemble<H: Host + ?Sized>(
        &self,
        host: &H,
        extracted: &Extracted,
        request: &Request,
        workdir: &Path,
        limits: &Limits,
    ) -> Result<Disassembly, DisassemblerError> {
        let input = workdir.join("extracted.bin");
        fs::write(&input, &extracted.bytes).map_err(|e| DisassemblerError::Io(input.clone(), e))?;

        let extras_dir = extras_dir(workdir);
        if request.extras {
            fs::create_dir_all(&extras_dir)
                .map_err(|e| DisassemblerError::Io(extras_dir.clone(), e))?;
        }

        info!(
            "disassembling {} bytes at ${:04x} ({})",
            extracted.bytes.len(),
            extracted.base,
            request.dialect
        );
        let invocation = self.command(&input, extracted.base, request, workdir);
        let done = host::run(host, &invocation, limits)?;

        if !done.success() {
            return Err(DisassemblerError::Failed {
                program: self.program.clone(),
                status: done.status.to_string(),
                stderr: done.stderr,
            });
        }

        let extras = if request.extras {
            list_files(&extras_dir).map_err(|e| DisassemblerError::Io(extras_dir.clone(), e))?
        } else {
            Vec::new()
        };
        debug!("{} lines, {} extras", done.stdout.lines().count(), extras.len());

        Ok(Disassembly {
            text: done.stdout,
            extras,
        })
    }
}

pub fn extras_dir(workdir: &Path) -> PathBuf {
    workdir.join("extras")
}

fn list_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::{DisassemblerSpec, Request};
    use std::path::{Path, PathBuf};

    fn spec() -> DisassemblerSpec {
        DisassemblerSpec {
            program: "py8dis".to_string(),
            args: vec![
                "{control}".to_string(),
                "--{dialect}".to_string(),
                "--base={base}".to_string(),
                "{input}".to_string(),
            ],
            extras_args: vec!["--xref".to_string(), "{extras}/xref.txt".to_string()],
        }
    }

    #[test]
    fn renders_placeholders() {
        let request = Request {
            dialect: "acme",
            control: None,
            extras: false,
        };
        let cmd = spec().command(Path::new("/w/extracted.bin"), 0x1900, &request, Path::new("/w"));

        // an absent control file drops the argument entirely
        assert_eq!(cmd.args, vec!["--acme", "--base=0x1900", "/w/extracted.bin"]);
        assert_eq!(cmd.cwd, PathBuf::from("/w"));
    }

    #[test]
    fn extras_only_on_request() {
        let request = Request {
            dialect: "beebasm",
            control: Some(Path::new("hello.py")),
            extras: true,
        };
        let cmd = spec().command(Path::new("in.bin"), 0xe00, &request, Path::new("/w"));

        assert_eq!(
            cmd.args,
            vec![
                "hello.py",
                "--beebasm",
                "--base=0x0e00",
                "in.bin",
                "--xref",
                "/w/extras/xref.txt"
            ]
        );
    }
}
