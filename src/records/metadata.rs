//! The index-file line codec.
//!
//! A pass-1 compilation reports each [`IndexRecord`] as one line of the form
//! `\CSEQ{T1}{T2}...`. Nested braces inside a term are kept verbatim; any text
//! between or after the braced terms is an error.
use thiserror::Error;

use super::{DataKind, IndexRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("index line {0:?} does not start with `\\`")]
    MissingBackslash(String),
    #[error("unexpected character at byte {1} between terms of index line {0:?}")]
    StrayCharacter(String, usize),
    #[error("incomplete or unbalanced terms in index line {0:?}")]
    Unbalanced(String),
    #[error("index line {line:?}: \\{cseq} takes exactly {expected} braced term(s)")]
    WrongArity {
        line: String,
        cseq: String,
        expected: usize,
    },
    #[error("index line {0:?}: unknown reference flag {1:?}")]
    BadFlag(String, char),
    #[error("unrecognized index line {0:?}")]
    Unrecognized(String),
}

/// Split `\CSEQ{A}{B}` into the control sequence name and its terms.
///
/// The control sequence runs from after the backslash up to the first `{`, so
/// whitespace before the first term belongs to the name.
pub fn parse_cseq_line(line: &str) -> Result<(&str, Vec<&str>), MetadataError> {
    let Some(rest) = line.strip_prefix('\\') else {
        return Err(MetadataError::MissingBackslash(line.to_string()));
    };
    let Some(open) = rest.find('{') else {
        return Ok((rest, Vec::new()));
    };
    let cseq = &rest[..open];

    let mut terms = Vec::new();
    let mut chars = rest.char_indices().skip(open);
    while let Some((i, c)) = chars.next() {
        if c != '{' {
            return Err(MetadataError::StrayCharacter(line.to_string(), i + 1));
        }
        let start = i + 1;
        let mut depth = 0usize;
        let end = loop {
            match chars.next() {
                Some((_, '{')) => depth += 1,
                Some((j, '}')) if depth == 0 => break j,
                Some((_, '}')) => depth -= 1,
                Some(_) => {}
                None => return Err(MetadataError::Unbalanced(line.to_string())),
            }
        };
        terms.push(&rest[start..end]);
    }
    Ok((cseq, terms))
}

fn arity<'a>(
    line: &str,
    cseq: &str,
    terms: Vec<&'a str>,
    expected: usize,
) -> Result<Vec<&'a str>, MetadataError> {
    if terms.len() != expected {
        return Err(MetadataError::WrongArity {
            line: line.to_string(),
            cseq: cseq.to_string(),
            expected,
        });
    }
    Ok(terms)
}

/// Parse one index-file line into a record.
pub fn parse_line(line: &str) -> Result<IndexRecord, MetadataError> {
    let (cseq, terms) = parse_cseq_line(line)?;
    match cseq {
        "output" => {
            let t = arity(line, cseq, terms, 1)?;
            Ok(IndexRecord::Output {
                path: t[0].to_string(),
            })
        }
        "idef" => {
            let t = arity(line, cseq, terms, 3)?;
            Ok(IndexRecord::Define {
                index: t[0].to_string(),
                entry: t[1].to_string(),
                fragment: t[2].to_string(),
            })
        }
        "itext" => {
            let t = arity(line, cseq, terms, 4)?;
            Ok(IndexRecord::Text {
                index: t[0].to_string(),
                entry: t[1].to_string(),
                tex: t[2].to_string(),
                plain: t[3].to_string(),
            })
        }
        "iref" => {
            let t = arity(line, cseq, terms, 3)?;
            let flags = DataKind::parse_flags(t[2])
                .map_err(|c| MetadataError::BadFlag(line.to_string(), c))?;
            Ok(IndexRecord::Reference {
                index: t[0].to_string(),
                entry: t[1].to_string(),
                flags,
            })
        }
        _ => Err(MetadataError::Unrecognized(line.to_string())),
    }
}

/// Serialize a record back into its index-file line.
pub fn to_line(record: &IndexRecord) -> String {
    match record {
        IndexRecord::Output { path } => format!("\\output{{{path}}}"),
        IndexRecord::Define {
            index,
            entry,
            fragment,
        } => format!("\\idef{{{index}}}{{{entry}}}{{{fragment}}}"),
        IndexRecord::Text {
            index,
            entry,
            tex,
            plain,
        } => format!("\\itext{{{index}}}{{{entry}}}{{{tex}}}{{{plain}}}"),
        IndexRecord::Reference {
            index,
            entry,
            flags,
        } => format!(
            "\\iref{{{index}}}{{{entry}}}{{{}}}",
            DataKind::format_flags(*flags)
        ),
    }
}

/// Parse a whole index file, one record per non-blank line.
pub fn parse_index_file(text: &str) -> Result<Vec<IndexRecord>, MetadataError> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(parse_line)
        .collect()
}
