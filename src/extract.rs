//! Cutting the bytes under test out of assembled images.

use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    case::{Composition, Marker, Part},
    syms::SymbolTable,
    toolchain::Assembled,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("label `{label}` not found in the symbols of {source_path}")]
    SymbolNotFound { label: String, source_path: PathBuf },
    #[error("{source_path}: no load address, give `load` or `start`")]
    NoLoadAddress { source_path: PathBuf },
    #[error(
        "{source_path}: range ${start:04x}..${end:04x} is outside the image \
         ${load:04x}..${image_end:04x}"
    )]
    OutOfImage {
        source_path: PathBuf,
        start: u64,
        end: u64,
        load: u64,
        image_end: u64,
    },
    #[error("range ending at ${end:04x} is not followed by one starting there (next starts at ${next:04x})")]
    NotContiguous { end: u64, next: u64 },
    #[error("{sources} sources but {images} assembled images")]
    PartMismatch { sources: usize, images: usize },
}

/// A resolved `start..end` range inside one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extracted {
    pub bytes: Vec<u8>,
    /// address the disassembler is told the bytes live at
    pub base: u64,
    pub ranges: Vec<Range>,
}

fn resolve(marker: &Marker, symbols: &SymbolTable, assembled: &Assembled) -> Result<u64, ExtractionError> {
    match marker {
        Marker::Address(address) => Ok(*address),
        Marker::Label(label) => symbols
            .lookup(label)
            .ok_or_else(|| ExtractionError::SymbolNotFound {
                label: label.clone(),
                source_path: assembled.source.clone(),
            }),
    }
}

fn extract_part<'a>(
    part: &Part,
    assembled: &'a Assembled,
) -> Result<(Range, &'a [u8]), ExtractionError> {
    let symbols = &assembled.symbols;
    let find = |m: &Marker| resolve(m, symbols, assembled);

    let start = part.start.as_ref().map(find).transpose()?;
    let load = match (&part.load, start) {
        (Some(load), _) => find(load)?,
        (None, Some(start)) => start,
        (None, None) => {
            return Err(ExtractionError::NoLoadAddress {
                source_path: assembled.source.clone(),
            })
        }
    };
    let image_end = load + assembled.image.len() as u64;

    let start = start.unwrap_or(load);
    let end = match &part.end {
        Some(end) => find(end)?,
        None => image_end,
    };

    if start < load || end > image_end || end < start {
        return Err(ExtractionError::OutOfImage {
            source_path: assembled.source.clone(),
            start,
            end,
            load,
            image_end,
        });
    }

    let from = (start - load) as usize;
    let to = (end - load) as usize;
    Ok((Range { start, end }, &assembled.image[from..to]))
}

/// Resolves each part's markers against its own image's symbols and
/// composes the byte ranges in declaration order.
pub fn extract(
    parts: &[Part],
    images: &[Assembled],
    composition: Composition,
) -> Result<Extracted, ExtractionError> {
    if parts.len() != images.len() || parts.is_empty() {
        return Err(ExtractionError::PartMismatch {
            sources: parts.len(),
            images: images.len(),
        });
    }

    let mut bytes = Vec::new();
    let mut ranges: Vec<Range> = Vec::with_capacity(parts.len());

    for (part, assembled) in parts.iter().zip(images) {
        let (range, slice) = extract_part(part, assembled)?;

        if composition == Composition::Contiguous {
            if let Some(prev) = ranges.last() {
                if prev.end != range.start {
                    return Err(ExtractionError::NotContiguous {
                        end: prev.end,
                        next: range.start,
                    });
                }
            }
        }

        debug!(
            "{}: ${:04x}..${:04x} ({} bytes){}",
            assembled.source.display(),
            range.start,
            range.end,
            range.len(),
            assembled
                .symbols
                .name_at(range.start)
                .map(|s| format!(" from {}", s.name))
                .unwrap_or_default()
        );

        if range.is_empty() {
            warn!(
                "{}: nothing between ${:04x} and its end marker",
                assembled.source.display(),
                range.start
            );
        }

        bytes.extend_from_slice(slice);
        ranges.push(range);
    }

    Ok(Extracted {
        bytes,
        base: ranges[0].start,
        ranges,
    })
}

#[cfg(test)]
mod tests {
    use super::{extract, ExtractionError, Range};
    use crate::{
        case::{Composition, Marker, Part},
        syms::SymbolTable,
        toolchain::Assembled,
    };
    use std::path::PathBuf;

    fn image(name: &str, bytes: &[u8], symbols: &str) -> Assembled {
        Assembled {
            source: PathBuf::from(name),
            binary: PathBuf::from(format!("{name}.bin")),
            image: bytes.to_vec(),
            symbols: SymbolTable::parse(symbols).unwrap(),
            side: vec![],
        }
    }

    fn part(load: Option<Marker>, start: Option<&str>, end: Option<&str>) -> Part {
        Part {
            path: PathBuf::from("x.asm"),
            load,
            start: start.map(|s| Marker::Label(s.to_string())),
            end: end.map(|s| Marker::Label(s.to_string())),
        }
    }

    #[test]
    fn single_by_labels() {
        let img = image("hello.asm", &[0xa9, 0x00, 0x60, 0xff], "start = $1900\nend = $1903\n");
        let parts = [part(None, Some("start"), Some("end"))];

        let got = extract(&parts, &[img], Composition::Concatenate).unwrap();

        assert_eq!(got.bytes, vec![0xa9, 0x00, 0x60]);
        assert_eq!(got.base, 0x1900);
    }

    #[test]
    fn literal_addresses() {
        let img = image("a.asm", &[1, 2, 3, 4, 5], "");
        let parts = [Part {
            path: PathBuf::from("a.asm"),
            load: Some(Marker::Address(0x2000)),
            start: Some(Marker::Address(0x2001)),
            end: Some(Marker::Address(0x2004)),
        }];

        let got = extract(&parts, &[img], Composition::Concatenate).unwrap();
        assert_eq!(got.bytes, vec![2, 3, 4]);
        assert_eq!(got.base, 0x2001);
    }

    #[test]
    fn split_concatenates_both_halves() {
        let first = image("split1.asm", &[0xea, 0xea, 0xea], "pydis_start = $1900\n");
        let second = image(
            "split2.asm",
            &[0x4c, 0x00, 0x19, 0x00],
            "second = $1a00\npydis_end = $1a03\n",
        );
        let parts = [
            part(None, Some("pydis_start"), None),
            part(Some(Marker::Label("second".into())), None, Some("pydis_end")),
        ];

        let got = extract(&parts, &[first, second], Composition::Concatenate).unwrap();

        assert_eq!(
            got.ranges,
            vec![
                Range { start: 0x1900, end: 0x1903 },
                Range { start: 0x1a00, end: 0x1a03 }
            ]
        );
        assert_eq!(got.bytes.len(), got.ranges.iter().map(Range::len).sum::<usize>());
        assert_eq!(got.bytes, vec![0xea, 0xea, 0xea, 0x4c, 0x00, 0x19]);
    }

    #[test]
    fn contiguous_rejects_gap() {
        let first = image("a.asm", &[0; 3], "s = $1900\n");
        let second = image("b.asm", &[0; 3], "t = $1a00\n");
        let parts = [part(None, Some("s"), None), part(None, Some("t"), None)];

        let err = extract(&parts, &[first, second], Composition::Contiguous).unwrap_err();
        assert_eq!(err, ExtractionError::NotContiguous { end: 0x1903, next: 0x1a00 });
    }

    #[test]
    fn missing_label_names_the_source() {
        let img = image("hello.asm", &[0; 4], "start = $1900\n");
        let parts = [part(None, Some("start"), Some("finish"))];

        let err = extract(&parts, &[img], Composition::Concatenate).unwrap_err();
        assert_eq!(
            err,
            ExtractionError::SymbolNotFound {
                label: "finish".to_string(),
                source_path: PathBuf::from("hello.asm")
            }
        );
    }

    #[test]
    fn range_past_image_end() {
        let img = image("a.asm", &[0; 2], "s = $10\ne = $20\n");
        let parts = [part(None, Some("s"), Some("e"))];

        let err = extract(&parts, &[img], Composition::Concatenate).unwrap_err();
        assert!(matches!(err, ExtractionError::OutOfImage { .. }));
    }

    #[test]
    fn no_load_address() {
        let img = image("a.asm", &[0; 2], "");
        let parts = [part(None, None, None)];

        let err = extract(&parts, &[img], Composition::Concatenate).unwrap_err();
        assert!(matches!(err, ExtractionError::NoLoadAddress { .. }));
    }
}
