pub mod arch;
pub mod baseline;
pub mod case;
pub mod compare;
pub mod disasm;
pub mod extract;
pub mod host;
pub mod manifest;
pub mod report;
pub mod runner;
pub mod syms;
pub mod toolchain;
