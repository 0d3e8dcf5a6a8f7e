//! The suite definition: cases, toolchains, the disassembler command and
//! where baselines live. Loaded from TOML.

use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    arch::Cpu,
    baseline::BaselineStore,
    case::{Composition, Marker, Part, TestCase},
    disasm::DisassemblerSpec,
    toolchain::{builtin, Capabilities, SymbolSource, ToolchainId, ToolchainSpec, UnknownCapability},
};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("cannot read {0}")]
    Read(PathBuf, #[source] io::Error),
    #[error("invalid manifest")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Capability(#[from] UnknownCapability),
    #[error("toolchain `{0}` is new and needs `{1}`")]
    IncompleteToolchain(ToolchainId, &'static str),
    #[error("case `{0}` is defined twice")]
    DuplicateCase(String),
    #[error("case name `{0}` must be a single plain path component")]
    BadCaseName(String),
    #[error("case `{0}` has no sources")]
    NoSources(String),
    #[error("case `{case}` lists unknown toolchain `{toolchain}`")]
    UnknownToolchain { case: String, toolchain: ToolchainId },
    #[error("case `{case}` needs {missing:?}, which toolchain `{toolchain}` lacks")]
    MissingCapabilities {
        case: String,
        toolchain: ToolchainId,
        missing: Vec<String>,
    },
    #[error("no toolchain can assemble case `{0}`")]
    NoToolchain(String),
}

fn default_baselines() -> PathBuf {
    PathBuf::from("known_good")
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default = "default_baselines")]
    baselines: PathBuf,
    disassembler: DisassemblerSpec,
    #[serde(default, rename = "toolchain")]
    toolchains: Vec<RawToolchain>,
    #[serde(default, rename = "case")]
    cases: Vec<RawCase>,
}

/// Overrides a built-in toolchain field by field, or defines a new one.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawToolchain {
    id: ToolchainId,
    program: Option<String>,
    args: Option<Vec<String>>,
    binary: Option<String>,
    symbols: Option<String>,
    symbols_from: Option<SymbolSource>,
    listing: Option<String>,
    capabilities: Option<Vec<String>>,
    dialect: Option<String>,
    extension: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPart {
    path: PathBuf,
    load: Option<Marker>,
    start: Option<Marker>,
    end: Option<Marker>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
    name: String,
    cpu: Cpu,
    sources: Vec<RawPart>,
    #[serde(default)]
    composition: Composition,
    assemblers: Option<Vec<ToolchainId>>,
    #[serde(default)]
    requires: Vec<String>,
    control: Option<PathBuf>,
    #[serde(default)]
    rationale: String,
}

/// Everything a run needs, with paths resolved against the manifest's
/// directory.
#[derive(Debug)]
pub struct Suite {
    pub cases: Vec<TestCase>,
    pub toolchains: BTreeMap<ToolchainId, ToolchainSpec>,
    pub disassembler: DisassemblerSpec,
    pub baselines: BaselineStore,
}

fn need<T>(field: Option<T>, id: &ToolchainId, name: &'static str) -> Result<T, ManifestError> {
    field.ok_or_else(|| ManifestError::IncompleteToolchain(id.clone(), name))
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

impl RawToolchain {
    fn apply(self, base: Option<ToolchainSpec>) -> Result<ToolchainSpec, ManifestError> {
        let capabilities = self
            .capabilities
            .map(Capabilities::from_names)
            .transpose()?;

        let spec = match base {
            Some(mut spec) => {
                if let Some(program) = self.program {
                    spec.program = program;
                }
                if let Some(args) = self.args {
                    spec.args = args;
                }
                if let Some(binary) = self.binary {
                    spec.binary = binary;
                }
                // `symbols = ""` clears the artifact
                if let Some(symbols) = self.symbols {
                    spec.symbols = non_empty(symbols);
                }
                if let Some(from) = self.symbols_from {
                    spec.symbols_from = from;
                }
                if let Some(listing) = self.listing {
                    spec.listing = non_empty(listing);
                }
                if let Some(capabilities) = capabilities {
                    spec.capabilities = capabilities;
                }
                if let Some(dialect) = self.dialect {
                    spec.dialect = dialect;
                }
                if let Some(extension) = self.extension {
                    spec.extension = extension;
                }
                spec
            }
            None => {
                let id = &self.id;
                ToolchainSpec {
                    program: need(self.program, id, "program")?,
                    args: need(self.args, id, "args")?,
                    binary: need(self.binary, id, "binary")?,
                    dialect: need(self.dialect, id, "dialect")?,
                    symbols: self.symbols.and_then(non_empty),
                    symbols_from: self.symbols_from.unwrap_or_default(),
                    listing: self.listing.and_then(non_empty),
                    capabilities: capabilities.unwrap_or_default(),
                    extension: self.extension.unwrap_or_else(|| "asm".to_string()),
                    id: self.id.clone(),
                }
            }
        };
        Ok(spec)
    }
}

impl RawCase {
    fn resolve(
        self,
        dir: &Path,
        toolchains: &BTreeMap<ToolchainId, ToolchainSpec>,
    ) -> Result<TestCase, ManifestError> {
        // the name becomes a directory under the work dir and the baselines
        let mut components = Path::new(&self.name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(ManifestError::BadCaseName(self.name));
        }
        if self.sources.is_empty() {
            return Err(ManifestError::NoSources(self.name));
        }

        let requires = Capabilities::from_names(&self.requires)?;
        let needed = requires | self.cpu.capability();

        let assemblers: BTreeSet<ToolchainId> = match self.assemblers {
            Some(declared) => {
                for id in &declared {
                    let toolchain =
                        toolchains
                            .get(id)
                            .ok_or_else(|| ManifestError::UnknownToolchain {
                                case: self.name.clone(),
                                toolchain: id.clone(),
                            })?;
                    if !toolchain.supports(needed) {
                        return Err(ManifestError::MissingCapabilities {
                            case: self.name.clone(),
                            toolchain: id.clone(),
                            missing: needed.difference(toolchain.capabilities).names(),
                        });
                    }
                }
                declared.into_iter().collect()
            }
            None => toolchains
                .values()
                .filter(|t| t.supports(needed))
                .map(|t| t.id.clone())
                .collect(),
        };
        if assemblers.is_empty() {
            return Err(ManifestError::NoToolchain(self.name));
        }

        let sources = self
            .sources
            .into_iter()
            .map(|raw| Part {
                path: dir.join(raw.path),
                load: raw.load,
                start: raw.start,
                end: raw.end,
            })
            .collect();

        Ok(TestCase {
            name: self.name,
            cpu: self.cpu,
            sources,
            composition: self.composition,
            assemblers,
            requires,
            control: self.control.map(|c| dir.join(c)),
            rationale: self.rationale,
        })
    }
}

impl Suite {
    /// Relative paths in `text` are taken relative to `dir`.
    pub fn parse(text: &str, dir: &Path) -> Result<Self, ManifestError> {
        let raw: RawManifest = toml::from_str(text)?;

        let mut toolchains: BTreeMap<ToolchainId, ToolchainSpec> = builtin::all()
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        for raw in raw.toolchains {
            let base = toolchains.remove(&raw.id);
            debug!(
                "{} toolchain `{}`",
                if base.is_some() { "overriding" } else { "adding" },
                raw.id
            );
            let spec = raw.apply(base)?;
            toolchains.insert(spec.id.clone(), spec);
        }

        let mut seen = BTreeSet::new();
        let mut cases = Vec::with_capacity(raw.cases.len());
        for case in raw.cases {
            if !seen.insert(case.name.clone()) {
                return Err(ManifestError::DuplicateCase(case.name));
            }
            cases.push(case.resolve(dir, &toolchains)?);
        }

        Ok(Self {
            cases,
            toolchains,
            disassembler: raw.disassembler,
            baselines: BaselineStore::new(dir.join(raw.baselines)),
        })
    }

    pub fn case(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|c| c.name == name)
    }
}

pub fn load(path: &Path) -> Result<Suite, ManifestError> {
    let read_err = |e| ManifestError::Read(path.to_path_buf(), e);
    let text = fs::read_to_string(path).map_err(read_err)?;
    // suite paths end up on tool command lines run from other directories
    let full = fs::canonicalize(path).map_err(read_err)?;
    let dir = full.parent().unwrap_or_else(|| Path::new("/"));
    let suite = Suite::parse(&text, dir)?;

    info!(
        "{}: {} cases, {} toolchains",
        path.display(),
        suite.cases.len(),
        suite.toolchains.len()
    );
    Ok(suite)
}

#[cfg(test)]
mod tests {
    use super::{ManifestError, Suite};
    use crate::{
        case::{Composition, Marker},
        toolchain::{Capabilities, ToolchainId},
    };
    use std::path::{Path, PathBuf};

    const DISASSEMBLER: &str = r#"
[disassembler]
program = "python3"
args = ["{control}", "--{dialect}", "{input}"]
"#;

    fn parse(body: &str) -> Result<Suite, ManifestError> {
        Suite::parse(&format!("{DISASSEMBLER}\n{body}"), Path::new("/suite"))
    }

    #[test]
    fn helloworld() {
        let suite = parse(
            r#"
[[case]]
name = "helloworld"
cpu = "6502"
sources = [{ path = "helloworld.asm", start = "pydis_start", end = "pydis_end" }]
assemblers = ["acme", "beebasm", "xa"]
control = "helloworld.py"
rationale = "smallest program"
"#,
        )
        .unwrap();

        let case = suite.case("helloworld").unwrap();
        assert_eq!(case.sources[0].path, PathBuf::from("/suite/helloworld.asm"));
        assert_eq!(case.sources[0].start, Some(Marker::Label("pydis_start".into())));
        assert_eq!(case.control, Some(PathBuf::from("/suite/helloworld.py")));
        assert_eq!(case.assemblers.len(), 3);
        assert_eq!(suite.baselines.root(), Path::new("/suite/known_good"));
        assert_eq!(suite.disassembler.program, "python3");
    }

    #[test]
    fn split_with_addresses() {
        let suite = parse(
            r#"
[[case]]
name = "split"
cpu = "6502"
composition = "contiguous"
assemblers = ["acme"]
sources = [
    { path = "split1.asm", load = 0x1900, start = "pydis_start" },
    { path = "split2.asm", load = 0x1a00, end = "pydis_end" },
]
"#,
        )
        .unwrap();

        let case = suite.case("split").unwrap();
        assert_eq!(case.sources.len(), 2);
        assert_eq!(case.composition, Composition::Contiguous);
        assert_eq!(case.sources[1].load, Some(Marker::Address(0x1a00)));
    }

    #[test]
    fn omitted_assemblers_follow_capabilities() {
        let suite = parse(
            r#"
[[case]]
name = "strings"
cpu = "6502"
requires = ["string-constants"]
sources = [{ path = "strings.asm" }]
"#,
        )
        .unwrap();

        let ids: Vec<_> = suite.cases[0].assemblers.iter().map(|t| t.as_str()).collect();
        assert_eq!(ids, vec!["beebasm", "xa"]);
        assert_eq!(suite.cases[0].requires, Capabilities::STRING_CONSTANTS);
    }

    #[test]
    fn declared_toolchain_lacking_capability() {
        let err = parse(
            r#"
[[case]]
name = "strings"
cpu = "6502"
requires = ["string-constants"]
assemblers = ["acme"]
sources = [{ path = "strings.asm" }]
"#,
        )
        .unwrap_err();

        match err {
            ManifestError::MissingCapabilities { missing, .. } => {
                assert_eq!(missing, vec!["string-constants"])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_toolchain_and_duplicates() {
        let err = parse(
            r#"
[[case]]
name = "x"
cpu = "6502"
assemblers = ["ca65"]
sources = [{ path = "x.asm" }]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::UnknownToolchain { .. }));

        let case = "[[case]]\nname = \"x\"\ncpu = \"6502\"\nsources = [{ path = \"x.asm\" }]\n";
        let err = parse(&format!("{case}{case}")).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateCase(name) if name == "x"));
    }

    #[test]
    fn toolchain_override_and_addition() {
        let suite = parse(
            r#"
[[toolchain]]
id = "acme"
program = "/opt/acme/bin/acme"

[[toolchain]]
id = "ca65"
program = "cl65"
args = ["-t", "none", "-o", "{binary}", "-Ln", "{symbols}", "{source}"]
binary = "{stem}.bin"
symbols = "{stem}.lbl"
capabilities = ["cpu-6502", "cpu-65c02"]
dialect = "ca65"
"#,
        )
        .unwrap();

        let acme = &suite.toolchains["acme"];
        assert_eq!(acme.program, "/opt/acme/bin/acme");
        assert_eq!(acme.dialect, "acme");

        let ca65 = &suite.toolchains[&ToolchainId::new("ca65")];
        assert!(ca65.supports(Capabilities::CPU_65C02));
        assert_eq!(ca65.extension, "asm");
    }

    #[test]
    fn new_toolchain_needs_program() {
        let err = parse("[[toolchain]]\nid = \"ca65\"\n").unwrap_err();
        assert!(matches!(err, ManifestError::IncompleteToolchain(_, "program")));
    }

    #[test]
    fn case_names_stay_inside_their_directories() {
        for name in ["../x", "a/b", "/abs", "..", ".", ""] {
            let err = parse(&format!(
                "[[case]]\nname = \"{name}\"\ncpu = \"6502\"\nsources = [{{ path = \"x.asm\" }}]\n"
            ))
            .unwrap_err();
            assert!(matches!(err, ManifestError::BadCaseName(ref n) if n == name), "{name}: {err:?}");
        }
        assert!(parse("[[case]]\nname = \"hello-world_2\"\ncpu = \"6502\"\nsources = [{ path = \"x.asm\" }]\n").is_ok());
    }

    #[test]
    fn cleared_symbols_override() {
        let suite = parse("[[toolchain]]\nid = \"acme\"\nsymbols = \"\"\n").unwrap();
        assert_eq!(suite.toolchains["acme"].symbols, None);
        assert!(suite.toolchains["acme"].listing.is_some());
    }

    #[test]
    fn unknown_capability() {
        let err = parse(
            "[[case]]\nname = \"x\"\ncpu = \"6502\"\nrequires = [\"teleport\"]\nsources = [{ path = \"x.asm\" }]\n",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Capability(_)));
    }
}
