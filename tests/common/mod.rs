#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use rtcheck::{
    host::{Abort, Native},
    manifest::Suite,
    report::{Report, RunResult},
    runner::{CaseRunner, Options},
    toolchain::ToolchainId,
};

/// Assembles lines of `bytes xx yy ..` into a binary. Every `name = value`
/// line is a symbol; they go to the file named by the third argument, or to
/// stdout when there is none.
const FAKE_ASSEMBLER: &str = r#"
src="$1"; bin="$2"; sym="$3"
if [ -n "$sym" ]; then
    grep '=' "$src" > "$sym" || true
else
    grep '=' "$src" || true
fi
: > "$bin"
grep '^bytes' "$src" | while read -r _ rest; do
    for b in $rest; do
        printf "\\$(printf '%03o' "0x$b")" >> "$bin"
    done
done
"#;

/// Prints the bytes back in the format the fake assembler reads, so the
/// output reassembles.
const FAKE_DISASSEMBLER: &str = r#"
echo "; disassembled at $1"
echo "pydis_start = $1"
od -An -tx1 -v "$2" | sed 's/^ */bytes /'
if [ -n "$3" ]; then
    echo "xref" > "$3/xref.txt"
fi
"#;

/// Like the fake disassembler but invents a trailing byte.
const LOSSY_DISASSEMBLER: &str = r#"
echo "pydis_start = $1"
od -An -tx1 -v "$2" | sed 's/^ */bytes /'
echo "bytes ff"
"#;

pub const HELLOWORLD: &str = "\
pydis_start = $1900
pydis_end = $1903
bytes a9 00 60 ff
";

pub const CASES: &str = r#"
[[case]]
name = "helloworld"
cpu = "6502"
sources = [{ path = "helloworld.asm", start = "pydis_start", end = "pydis_end" }]
assemblers = ["acme", "beebasm", "xa"]
rationale = "smallest program"

[[case]]
name = "split"
cpu = "6502"
assemblers = ["acme"]
sources = [
    { path = "split1.asm", start = "pydis_start" },
    { path = "split2.asm", load = "second", end = "pydis_end" },
]
"#;

pub struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fixture.script("fakeasm", FAKE_ASSEMBLER);
        fixture.script("fakedis", FAKE_DISASSEMBLER);
        fixture.script("lossydis", LOSSY_DISASSEMBLER);

        fixture.write("helloworld.asm", HELLOWORLD);
        fixture.write("split1.asm", "pydis_start = $1900\nbytes ea ea ea\n");
        fixture.write(
            "split2.asm",
            "second = $1a00\npydis_end = $1a03\nbytes 4c 00 19 ff\n",
        );
        fixture
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.write(name, &format!("#!/bin/sh\n{body}"));
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// acme writes its symbols to a file, beebasm to stdout; xa is missing.
    pub fn manifest(&self, disassembler: &str, extra: &str) -> String {
        let dir = self.path().display();
        format!(
            r#"
baselines = "known_good"

[disassembler]
program = "{dir}/{disassembler}"
args = ["{{base}}", "{{input}}"]
extras_args = ["{{extras}}"]

[[toolchain]]
id = "acme"
program = "{dir}/fakeasm"
args = ["{{source}}", "{{binary}}", "{{symbols}}"]

[[toolchain]]
id = "beebasm"
program = "{dir}/fakeasm"
args = ["{{source}}", "{{binary}}"]

[[toolchain]]
id = "xa"
program = "{dir}/rtcheck-no-such-xa"
{cases}
{extra}
"#,
            cases = CASES,
        )
    }

    pub fn suite(&self, extra: &str) -> Suite {
        Suite::parse(&self.manifest("fakedis", extra), self.path()).unwrap()
    }

    pub fn options(&self, assemblers: &[&str]) -> Options {
        Options {
            make_extras: false,
            check_disassembly: false,
            make_known_good: false,
            assemblers: assemblers.iter().map(|a| ToolchainId::new(*a)).collect(),
            jobs: 4,
            timeout: Duration::from_secs(20),
            work_dir: self.path().join("work"),
        }
    }
}

pub fn run(suite: &Suite, options: &Options) -> Report {
    let runner = CaseRunner::new(&Native, suite, options, Abort::new());
    let cases = runner.select(&[]).unwrap();
    runner.run(&cases)
}

pub fn result<'a>(report: &'a Report, pair: &str) -> &'a RunResult {
    report
        .results
        .iter()
        .find(|r| r.pair() == pair)
        .unwrap_or_else(|| panic!("no result for {pair}"))
}
