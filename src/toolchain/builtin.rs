use super::{Capabilities, SymbolSource, ToolchainId, ToolchainSpec};

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

pub fn acme() -> ToolchainSpec {
    ToolchainSpec {
        id: ToolchainId::new("acme"),
        program: "acme".to_string(),
        args: args(&[
            "--format",
            "plain",
            "-o",
            "{binary}",
            "-l",
            "{symbols}",
            "-r",
            "{listing}",
            "{source}",
        ]),
        binary: "{stem}.bin".to_string(),
        symbols: Some("{stem}.sym".to_string()),
        symbols_from: SymbolSource::File,
        listing: Some("{stem}.lst".to_string()),
        // no string constants: `!text name` can't take a string-valued symbol
        capabilities: Capabilities::CPU_6502 | Capabilities::CPU_65C02 | Capabilities::LOCAL_LABELS,
        dialect: "acme".to_string(),
        extension: "asm".to_string(),
    }
}

pub fn beebasm() -> ToolchainSpec {
    ToolchainSpec {
        id: ToolchainId::new("beebasm"),
        program: "beebasm".to_string(),
        // `-d` dumps every symbol to stdout once assembly is done
        args: args(&["-i", "{source}", "-o", "{binary}", "-d"]),
        binary: "{stem}.bin".to_string(),
        symbols: None,
        symbols_from: SymbolSource::Stdout,
        listing: None,
        capabilities: Capabilities::CPU_6502
            | Capabilities::CPU_65C02
            | Capabilities::STRING_CONSTANTS
            | Capabilities::STRING_EXPRESSIONS
            | Capabilities::LOCAL_LABELS,
        dialect: "beebasm".to_string(),
        extension: "asm".to_string(),
    }
}

pub fn xa() -> ToolchainSpec {
    ToolchainSpec {
        id: ToolchainId::new("xa"),
        program: "xa".to_string(),
        args: args(&["-o", "{binary}", "-l", "{symbols}", "{source}"]),
        binary: "{stem}.bin".to_string(),
        symbols: Some("{stem}.lbl".to_string()),
        symbols_from: SymbolSource::File,
        listing: None,
        capabilities: Capabilities::CPU_6502 | Capabilities::STRING_CONSTANTS,
        dialect: "xa".to_string(),
        extension: "s".to_string(),
    }
}

pub fn z88dk_8080() -> ToolchainSpec {
    ToolchainSpec {
        id: ToolchainId::new("z88dk-8080"),
        program: "z88dk-z80asm".to_string(),
        // the map file is named after the output binary
        args: args(&["-m8080", "-b", "-m", "-o{binary}", "{source}"]),
        binary: "{stem}.bin".to_string(),
        symbols: Some("{stem}.map".to_string()),
        symbols_from: SymbolSource::File,
        listing: None,
        capabilities: Capabilities::CPU_8080 | Capabilities::LOCAL_LABELS,
        dialect: "z88dk".to_string(),
        extension: "asm".to_string(),
    }
}

pub fn all() -> Vec<ToolchainSpec> {
    vec![acme(), beebasm(), xa(), z88dk_8080()]
}

#[cfg(test)]
mod tests {
    use super::all;
    use crate::toolchain::Capabilities;

    #[test]
    fn ids_are_unique() {
        let specs = all();
        let mut ids: Vec<_> = specs.iter().map(|s| s.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), specs.len());
    }

    #[test]
    fn string_constants_exclude_acme() {
        let supporting: Vec<_> = all()
            .into_iter()
            .filter(|s| s.supports(Capabilities::CPU_6502 | Capabilities::STRING_CONSTANTS))
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(supporting, vec!["beebasm", "xa"]);
    }
}
