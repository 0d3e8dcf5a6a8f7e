use serde::Deserialize;

use crate::toolchain::Capabilities;

/// Instruction set a test program is written for.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, strum::Display, strum::EnumString,
)]
pub enum Cpu {
    #[serde(rename = "6502")]
    #[strum(serialize = "6502")]
    Mos6502,
    #[serde(rename = "65c02")]
    #[strum(serialize = "65c02")]
    Cmos65c02,
    #[serde(rename = "8080")]
    #[strum(serialize = "8080")]
    I8080,
}

impl Cpu {
    /// The capability a toolchain needs to assemble for this cpu
    pub fn capability(self) -> Capabilities {
        match self {
            Cpu::Mos6502 => Capabilities::CPU_6502,
            Cpu::Cmos65c02 => Capabilities::CPU_65C02,
            Cpu::I8080 => Capabilities::CPU_8080,
        }
    }
}
