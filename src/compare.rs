//! Comparing disassemblies, against a baseline and against each other.
//!
//! Baseline comparison is exact after [`normalize`]. Cross-toolchain
//! comparison works on a canonical instruction stream (see [`canonical`])
//! since two assemblers may legitimately pick different encodings for the
//! same source.

use itertools::Itertools;
use serde::Serialize;
use std::fmt;

use crate::toolchain::ToolchainId;

/// Past this many LCS cells the middle of a diff is reported as one
/// replaced block.
const MAX_DIFF_CELLS: usize = 4_000_000;
/// Edits shown by `Display` before eliding the rest
const SHOWN_EDITS: usize = 40;

/// Canonical line endings, no trailing whitespace, no trailing blank lines,
/// exactly one final newline (none for empty text).
pub fn normalize(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last() == Some(&"") {
        lines.pop();
    }

    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Edit {
    /// only in the baseline (or reference)
    Removed { line: usize, text: String },
    /// only in the current output
    Added { line: usize, text: String },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LineDiff {
    pub edits: Vec<Edit>,
}

impl fmt::Display for LineDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for edit in self.edits.iter().take(SHOWN_EDITS) {
            match edit {
                Edit::Removed { line, text } => writeln!(f, "-{line:>5} | {text}")?,
                Edit::Added { line, text } => writeln!(f, "+{line:>5} | {text}")?,
            }
        }
        if self.edits.len() > SHOWN_EDITS {
            writeln!(f, "... {} more", self.edits.len() - SHOWN_EDITS)?;
        }
        Ok(())
    }
}

/// Line diff from `old` to `new`. Line numbers are 1-based and refer to the
/// side the line comes from.
pub fn diff_lines<S: AsRef<str>>(old: &[S], new: &[S]) -> LineDiff {
    let prefix = old
        .iter()
        .zip(new)
        .take_while(|(a, b)| a.as_ref() == b.as_ref())
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a.as_ref() == b.as_ref())
        .count();

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];

    let removed = |i: usize| Edit::Removed {
        line: prefix + i + 1,
        text: a[i].as_ref().to_string(),
    };
    let added = |j: usize| Edit::Added {
        line: prefix + j + 1,
        text: b[j].as_ref().to_string(),
    };

    let mut edits = Vec::new();

    if a.len().saturating_mul(b.len()) > MAX_DIFF_CELLS {
        edits.extend((0..a.len()).map(removed));
        edits.extend((0..b.len()).map(added));
        return LineDiff { edits };
    }

    // lcs[i][j] = length of the LCS of a[i..] and b[j..]
    let width = b.len() + 1;
    let mut lcs = vec![0u32; (a.len() + 1) * width];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i * width + j] = if a[i].as_ref() == b[j].as_ref() {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].as_ref() == b[j].as_ref() {
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            edits.push(removed(i));
            i += 1;
        } else {
            edits.push(added(j));
            j += 1;
        }
    }
    edits.extend((i..a.len()).map(removed));
    edits.extend((j..b.len()).map(added));

    LineDiff { edits }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Divergence(LineDiff),
}

/// Exact comparison of the normalized texts.
pub fn compare(current: &str, baseline: &str) -> Comparison {
    let current = normalize(current);
    let baseline = normalize(baseline);

    if current == baseline {
        return Comparison::Match;
    }

    let old: Vec<&str> = baseline.lines().collect();
    let new: Vec<&str> = current.lines().collect();
    Comparison::Divergence(diff_lines(&old, &new))
}

const REGISTERS: &[&str] = &["a", "b", "c", "d", "e", "h", "l", "m", "x", "y", "sp", "psw"];

/// Cuts a `;` or `//` comment, ignoring either inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quote = None;
    let mut prev = None;
    for (idx, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ';') => return &line[..idx],
            (None, '/') if prev == Some('/') => return &line[..idx - 1],
            _ => {}
        }
        prev = Some(c);
    }
    line
}

/// Splits on commas that are outside parentheses and quotes.
fn split_operands(operand: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut from = 0;
    for (idx, c) in operand.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                pieces.push(&operand[from..idx]);
                from = idx + 1;
            }
            _ => {}
        }
    }
    pieces.push(&operand[from..]);
    pieces
}

/// Addressing shape of an operand: registers are kept, immediates become
/// `#`, any other value (number, label, expression) becomes `_`, and
/// parentheses are kept.
fn shape(operand: &str) -> String {
    split_operands(operand)
        .into_iter()
        .map(|piece| {
            let piece = piece.trim().to_lowercase();
            if REGISTERS.contains(&piece.as_str()) {
                piece
            } else if piece.starts_with('#') {
                "#".to_string()
            } else if piece.len() >= 2 && piece.starts_with('(') && piece.ends_with(')') {
                format!("({})", shape(&piece[1..piece.len() - 1]))
            } else {
                "_".to_string()
            }
        })
        .join(",")
}

enum Directive {
    Data(&'static str),
    Ignored,
}

fn directive(word: &str) -> Option<Directive> {
    let d = match word {
        "!byte" | "!by" | "!08" | ".byt" | ".byte" | ".db" | "equb" | "db" | "defb" => {
            Directive::Data("byte")
        }
        "!word" | "!wo" | "!16" | ".word" | ".dw" | "equw" | "dw" | "defw" => Directive::Data("word"),
        "!text" | "!tx" | ".asc" | ".text" | ".ascii" | "equs" | "defm" => Directive::Data("text"),
        "org" | "*" | "*=" | "cpu" | "!cpu" | "save" | "guard" | "clear" | "copyblock" | "include"
        | "incbin" | "!to" | "!source" | "!binary" | "!zone" | "!initmem" | "!pseudopc" | "!if"
        | "!ifdef" | "!error" | "{" | "}" => Directive::Ignored,
        _ => return None,
    };
    Some(d)
}

/// `lda+2` (acme, xa) and `lda.w` force an operand width; the width is an
/// encoding choice, so only the mnemonic is kept.
fn strip_width(mnemonic: &str) -> &str {
    match mnemonic.rsplit_once(['+', '.']) {
        Some((base, "1" | "2" | "b" | "w"))
            if !base.is_empty() && base.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            base
        }
        _ => mnemonic,
    }
}

fn canonical_line(raw: &str) -> Option<String> {
    let code = strip_comment(raw);
    if code.trim().is_empty() {
        return None;
    }

    let mut rest = code.trim_start();

    // anything starting in column 0 is a label (`name`, `.name`, `name:`)
    // or an assignment
    if !code.starts_with(char::is_whitespace) {
        let (_, after) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        rest = after.trim_start();
    }

    loop {
        let (word, after) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        // nothing left, or `name = value` / `* = $1900`
        if word.is_empty() || word.contains('=') || after.trim_start().starts_with('=') {
            return None;
        }
        if let Some(label) = word.strip_suffix(':') {
            if !label.is_empty() {
                rest = after.trim_start();
                continue;
            }
        }

        let mnemonic = word.to_lowercase();
        let operand = after.trim();

        return match directive(&mnemonic) {
            Some(Directive::Ignored) => None,
            Some(Directive::Data("text")) => Some("text".to_string()),
            Some(Directive::Data(kind)) => {
                Some(format!("{kind}*{}", split_operands(operand).len()))
            }
            None => {
                let mnemonic = strip_width(&mnemonic);
                let mut shape = if operand.is_empty() {
                    String::new()
                } else {
                    shape(operand)
                };
                if shape == "a" && matches!(mnemonic, "asl" | "lsr" | "rol" | "ror") {
                    // `ROR A` and `ror` are the same instruction
                    shape.clear();
                }
                if shape.is_empty() {
                    Some(mnemonic.to_string())
                } else {
                    Some(format!("{mnemonic} {shape}"))
                }
            }
        };
    }
}

/// The instruction stream of a disassembly with everything an assembler
/// dialect or encoding choice can change stripped away: comments, labels,
/// assignments and layout directives are dropped, data directives collapse
/// to `byte*N`/`word*N`/`text`, and operands keep only their shape.
pub fn canonical(text: &str) -> Vec<String> {
    text.lines().filter_map(canonical_line).collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrossDivergence {
    pub toolchain: ToolchainId,
    pub diff: LineDiff,
}

/// Agreement of all toolchains that ran one case, measured against the
/// first (by id).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CrossCheck {
    pub case: String,
    pub reference: ToolchainId,
    pub compared: Vec<ToolchainId>,
    pub divergences: Vec<CrossDivergence>,
}

impl CrossCheck {
    pub fn agrees(&self) -> bool {
        self.divergences.is_empty()
    }
}

/// `None` unless at least two toolchains produced a disassembly.
pub fn cross_check(case: &str, texts: &[(ToolchainId, &str)]) -> Option<CrossCheck> {
    if texts.len() < 2 {
        return None;
    }

    let mut sorted: Vec<_> = texts.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let (reference, reference_text) = sorted[0];
    let expected = canonical(reference_text);

    let divergences = sorted[1..]
        .iter()
        .filter_map(|(toolchain, text)| {
            let got = canonical(text);
            (got != expected).then(|| CrossDivergence {
                toolchain: toolchain.clone(),
                diff: diff_lines(&expected, &got),
            })
        })
        .collect();

    Some(CrossCheck {
        case: case.to_string(),
        reference: reference.clone(),
        compared: sorted[1..].iter().map(|(t, _)| t.clone()).collect(),
        divergences,
    })
}
