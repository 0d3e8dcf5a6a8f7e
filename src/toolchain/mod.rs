//! Assembler toolchains.
//!
//! A toolchain is pure data ([`ToolchainSpec`]): a command template, where its
//! artifacts land, and what it can assemble ([`Capabilities`]). Quirks of a
//! particular assembler are expressed as missing capabilities, and cases that
//! need them are never paired with it.

pub mod builtin;

use bitflags::bitflags;
use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Borrow,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    case::TestCase,
    host::{self, Host, Invocation, Limits, ProcessError},
    syms::{SymbolError, SymbolTable},
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolchainId(String);

impl ToolchainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ToolchainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ToolchainId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const CPU_6502 = 1 << 0;
        const CPU_65C02 = 1 << 1;
        const CPU_8080 = 1 << 2;

        /// `name = "string"` constants usable as operands of text directives
        const STRING_CONSTANTS = 1 << 8;
        /// expressions producing strings, e.g. beebasm's `STR$~(x)`
        const STRING_EXPRESSIONS = 1 << 9;
        const LOCAL_LABELS = 1 << 10;
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown capability `{0}`")]
pub struct UnknownCapability(pub String);

impl Capabilities {
    /// Parses kebab-case names as used in the manifest, e.g. `string-constants`.
    pub fn from_names<I, S>(names: I) -> Result<Self, UnknownCapability>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names.into_iter().try_fold(Self::empty(), |acc, name| {
            let name = name.as_ref();
            Self::from_name(&name.from_case(Case::Kebab).to_case(Case::UpperSnake))
                .map(|flag| acc | flag)
                .ok_or_else(|| UnknownCapability(name.to_string()))
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.from_case(Case::UpperSnake).to_case(Case::Kebab))
            .collect()
    }
}

/// Where an assembler leaves its symbol dump.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolSource {
    /// a file, named by the `symbols` template
    #[default]
    File,
    Stdout,
}

#[derive(Clone, Debug)]
pub struct ToolchainSpec {
    pub id: ToolchainId,
    pub program: String,
    /// Placeholders: `{source}`, `{binary}`, `{symbols}`, `{listing}`,
    /// `{stem}`, `{workdir}`
    pub args: Vec<String>,
    /// Artifact names, relative to the working directory; may use `{stem}`
    pub binary: String,
    pub symbols: Option<String>,
    pub symbols_from: SymbolSource,
    pub listing: Option<String>,
    pub capabilities: Capabilities,
    /// Output syntax the disassembler should be asked for
    pub dialect: String,
    /// Source file extension, used when reassembling disassembler output
    pub extension: String,
}

#[derive(Error, Debug)]
pub enum AssembleError {
    #[error("case `{case}` cannot run on toolchain `{toolchain}`")]
    NotApplicable { case: String, toolchain: ToolchainId },
    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("`{program}` rejected {source_path} ({status})\n{stderr}")]
    Rejected {
        program: String,
        source_path: PathBuf,
        status: String,
        stderr: String,
    },
    #[error("`{program}` exited successfully but left no {what} at {path}")]
    MissingArtifact {
        program: String,
        what: &'static str,
        path: PathBuf,
    },
    #[error("symbol dump from `{program}`")]
    Symbols {
        program: String,
        #[source]
        source: SymbolError,
    },
    #[error("io error in {0}")]
    Io(PathBuf, #[source] io::Error),
}

/// What one assembler run left behind.
#[derive(Clone, Debug)]
pub struct Assembled {
    pub source: PathBuf,
    pub binary: PathBuf,
    pub image: Vec<u8>,
    pub symbols: SymbolTable,
    /// symbol dump, listing, tool logs
    pub side: Vec<PathBuf>,
}

struct Paths {
    binary: PathBuf,
    symbols: Option<PathBuf>,
    listing: Option<PathBuf>,
}

impl ToolchainSpec {
    pub fn supports(&self, required: Capabilities) -> bool {
        self.capabilities.contains(required)
    }

    fn render(template: &str, stem: &str) -> String {
        template.replace("{stem}", stem)
    }

    fn paths(&self, workdir: &Path, stem: &str) -> Paths {
        Paths {
            binary: workdir.join(Self::render(&self.binary, stem)),
            symbols: self
                .symbols
                .as_deref()
                .map(|t| workdir.join(Self::render(t, stem))),
            listing: self
                .listing
                .as_deref()
                .map(|t| workdir.join(Self::render(t, stem))),
        }
    }

    fn command(&self, source: &Path, workdir: &Path, stem: &str, paths: &Paths) -> Invocation {
        let show = |p: &Path| p.display().to_string();
        let absent = |template: &str| {
            (paths.symbols.is_none() && template.contains("{symbols}"))
                || (paths.listing.is_none() && template.contains("{listing}"))
        };

        let mut args: Vec<String> = Vec::with_capacity(self.args.len());
        for (idx, template) in self.args.iter().enumerate() {
            if absent(template) {
                // `-l {symbols}` without a symbol file: the flag goes too
                let flag = idx
                    .checked_sub(1)
                    .map(|prev| &self.args[prev])
                    .filter(|prev| prev.starts_with('-') && !prev.contains('{'));
                if flag.is_some() && args.last() == flag {
                    args.pop();
                }
                continue;
            }

            let arg = template
                .replace("{source}", &show(source))
                .replace("{binary}", &show(&paths.binary))
                .replace(
                    "{symbols}",
                    &paths.symbols.as_deref().map(show).unwrap_or_default(),
                )
                .replace(
                    "{listing}",
                    &paths.listing.as_deref().map(show).unwrap_or_default(),
                )
                .replace("{workdir}", &show(workdir))
                .replace("{stem}", stem);
            if !arg.is_empty() {
                args.push(arg);
            }
        }

        Invocation {
            name: format!("{}-{}", self.id, stem),
            program: self.program.clone(),
            args,
            cwd: workdir.to_path_buf(),
        }
    }

    /// Assembles every source of `case`, each into its own `part<N>`
    /// directory under `workdir`.
    pub fn assemble<H: Host + ?Sized>(
        &self,
        host: &H,
        case: &TestCase,
        workdir: &Path,
        limits: &Limits,
    ) -> Result<Vec<Assembled>, AssembleError> {
        if !case.assemblers.contains(&self.id) || !self.supports(case.required_capabilities()) {
            return Err(AssembleError::NotApplicable {
                case: case.name.clone(),
                toolchain: self.id.clone(),
            });
        }

        if let Some(missing) = case.sources.iter().find(|s| !s.path.is_file()) {
            return Err(AssembleError::SourceMissing(missing.path.clone()));
        }

        case.sources
            .iter()
            .enumerate()
            .map(|(idx, part)| {
                let dir = workdir.join(format!("part{idx}"));
                fs::create_dir_all(&dir).map_err(|e| AssembleError::Io(dir.clone(), e))?;
                self.assemble_source(host, &part.path, &dir, limits)
            })
            .collect()
    }

    /// Runs the assembler on a single source file inside `workdir`.
    pub fn assemble_source<H: Host + ?Sized>(
        &self,
        host: &H,
        source: &Path,
        workdir: &Path,
        limits: &Limits,
    ) -> Result<Assembled, AssembleError> {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let paths = self.paths(workdir, &stem);
        let invocation = self.command(source, workdir, &stem, &paths);

        info!("assembling {} with {}", source.display(), self.id);
        let done = host::run(host, &invocation, limits)?;

        if !done.success() {
            return Err(AssembleError::Rejected {
                program: self.program.clone(),
                source_path: source.to_path_buf(),
                status: done.status.to_string(),
                stderr: done.stderr,
            });
        }

        let image = self.read_artifact(host, "binary", &paths.binary)?;

        let mut side = vec![invocation.stdout_path(), invocation.stderr_path()];

        let dump = match (&self.symbols_from, &paths.symbols) {
            (SymbolSource::Stdout, _) => Some(done.stdout.clone()),
            (SymbolSource::File, Some(path)) => {
                let raw = self.read_artifact(host, "symbol dump", path)?;
                side.push(path.clone());
                Some(String::from_utf8_lossy(&raw).into_owned())
            }
            (SymbolSource::File, None) => None,
        };
        let symbols = match dump {
            Some(dump) => {
                let symbols = SymbolTable::parse(&dump).map_err(|source| AssembleError::Symbols {
                    program: self.program.clone(),
                    source,
                })?;
                if symbols.is_empty() {
                    warn!("`{}` dumped no symbols for {}", self.program, source.display());
                }
                symbols
            }
            None => SymbolTable::default(),
        };

        if let Some(listing) = paths.listing.filter(|p| p.is_file()) {
            side.push(listing);
        }

        debug!(
            "{}: {} bytes, {} symbols",
            paths.binary.display(),
            image.len(),
            symbols.len()
        );

        Ok(Assembled {
            source: source.to_path_buf(),
            binary: paths.binary,
            image,
            symbols,
            side,
        })
    }

    fn read_artifact<H: Host + ?Sized>(
        &self,
        host: &H,
        what: &'static str,
        path: &Path,
    ) -> Result<Vec<u8>, AssembleError> {
        host.read_file(path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                AssembleError::MissingArtifact {
                    program: self.program.clone(),
                    what,
                    path: path.to_path_buf(),
                }
            } else {
                AssembleError::Io(path.to_path_buf(), err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{builtin, AssembleError, Capabilities, ToolchainId, UnknownCapability};
    use crate::{
        arch::Cpu,
        case::{Composition, Part, TestCase},
        host::{Abort, Limits, Native},
    };
    use std::{collections::BTreeSet, path::PathBuf, time::Duration};

    #[test]
    fn capability_names() {
        let caps = Capabilities::from_names(["cpu-65c02", "string-constants"]).unwrap();
        assert_eq!(caps, Capabilities::CPU_65C02 | Capabilities::STRING_CONSTANTS);
        assert_eq!(caps.names(), vec!["cpu-65c02", "string-constants"]);

        assert_eq!(
            Capabilities::from_names(["teleport"]),
            Err(UnknownCapability("teleport".to_string()))
        );
    }

    #[test]
    fn command_line() {
        let acme = builtin::acme();
        let workdir = PathBuf::from("/w");
        let paths = acme.paths(&workdir, "hello");
        let cmd = acme.command(&PathBuf::from("/s/hello.asm"), &workdir, "hello", &paths);

        assert_eq!(cmd.program, "acme");
        assert!(cmd.args.contains(&"/w/hello.bin".to_string()));
        assert!(cmd.args.contains(&"/s/hello.asm".to_string()));
        assert_eq!(paths.symbols, Some(PathBuf::from("/w/hello.sym")));
    }

    #[test]
    fn cleared_symbols_drop_their_flag() {
        let mut acme = builtin::acme();
        acme.symbols = None;
        let workdir = PathBuf::from("/w");
        let paths = acme.paths(&workdir, "hello");
        let cmd = acme.command(&PathBuf::from("/s/hello.asm"), &workdir, "hello", &paths);

        assert!(!cmd.args.iter().any(|a| a == "-l"), "{:?}", cmd.args);
        assert_eq!(cmd.args.last().map(String::as_str), Some("/s/hello.asm"));
        assert!(cmd.args.contains(&"/w/hello.bin".to_string()));
    }

    #[test]
    fn refuses_undeclared_case() {
        let case = TestCase {
            name: "helloworld".to_string(),
            cpu: Cpu::Mos6502,
            sources: vec![Part {
                path: PathBuf::from("/nonexistent.asm"),
                load: None,
                start: None,
                end: None,
            }],
            composition: Composition::Concatenate,
            assemblers: BTreeSet::from([ToolchainId::new("beebasm")]),
            requires: Capabilities::empty(),
            control: None,
            rationale: String::new(),
        };
        let limits = Limits {
            timeout: Duration::from_secs(1),
            abort: Abort::new(),
        };
        let dir = tempfile::tempdir().unwrap();

        let err = builtin::acme()
            .assemble(&Native, &case, dir.path(), &limits)
            .unwrap_err();
        assert!(matches!(err, AssembleError::NotApplicable { .. }));

        let err = builtin::beebasm()
            .assemble(&Native, &case, dir.path(), &limits)
            .unwrap_err();
        assert!(matches!(err, AssembleError::SourceMissing(_)));
    }
}
