use serde::Deserialize;
use std::{collections::BTreeSet, fmt, path::PathBuf};

use crate::{
    arch::Cpu,
    toolchain::{Capabilities, ToolchainId},
};

/// Either a label looked up in the assembler's symbol dump, or an address.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Marker {
    Address(u64),
    Label(String),
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Address(a) => write!(f, "${a:04x}"),
            Marker::Label(l) => f.write_str(l),
        }
    }
}

/// One source file of a case and the range to take from its image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub path: PathBuf,
    /// address of the first byte of the image; defaults to `start`
    pub load: Option<Marker>,
    /// defaults to the load address
    pub start: Option<Marker>,
    /// exclusive, defaults to the end of the image
    pub end: Option<Marker>,
}

/// How the byte ranges of a multi-source case are put together.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Composition {
    /// in declaration order
    #[default]
    Concatenate,
    /// like `Concatenate`, but each range must end where the next starts
    Contiguous,
}

#[derive(Clone, Debug)]
pub struct TestCase {
    pub name: String,
    pub cpu: Cpu,
    pub sources: Vec<Part>,
    pub composition: Composition,
    /// toolchains this case may run against
    pub assemblers: BTreeSet<ToolchainId>,
    /// on top of `cpu`
    pub requires: Capabilities,
    /// handed to the disassembler as `{control}`
    pub control: Option<PathBuf>,
    pub rationale: String,
}

impl TestCase {
    pub fn required_capabilities(&self) -> Capabilities {
        self.requires | self.cpu.capability()
    }
}
