//! Index records: the facts a pass-1 compilation emits about one input file.
//!
//! Every input declares the HTML outputs it will produce, the index entries it
//! defines, literal TeX text attached to those entries and the references it makes
//! to other entries. The scheduler collects these per input into an
//! [`IndexRecordStore`] and hands the complete set to the
//! [resolver](crate::resolve) between the two passes.
//!
//! Records travel from the engine as single index-file lines (`\output{...}`,
//! `\idef{...}{...}{...}`, `\itext{...}`, `\iref{...}`); see [`metadata`] for that
//! codec.
use std::fmt;

use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};

pub mod metadata;
pub mod store;

pub use metadata::{parse_cseq_line, MetadataError};
pub use store::{IndexRecordStore, RecordSnapshot};

/// The kinds of data a reference can ask the resolver for.
#[derive(EnumSetType, Debug, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[enumset(serialize_repr = "list")]
pub enum DataKind {
    /// The URL of the entry's definition site.
    Location,
    /// The entry's text, in TeX and plain form.
    Text,
}

impl DataKind {
    pub fn flag(&self) -> char {
        match self {
            DataKind::Location => 'l',
            DataKind::Text => 't',
        }
    }

    pub fn from_flag(c: char) -> Option<DataKind> {
        match c {
            'l' => Some(DataKind::Location),
            't' => Some(DataKind::Text),
            _ => None,
        }
    }

    /// Parse a flag string such as `"lt"`. Unknown characters are rejected.
    pub fn parse_flags(flags: &str) -> Result<EnumSet<DataKind>, char> {
        let mut kinds = EnumSet::empty();
        for c in flags.chars() {
            kinds |= DataKind::from_flag(c).ok_or(c)?;
        }
        Ok(kinds)
    }

    pub fn format_flags(kinds: EnumSet<DataKind>) -> String {
        kinds.iter().map(|k| k.flag()).collect()
    }
}

/// Identity of an entry: the `(index, entry)` pair. Entry names are opaque
/// strings; no escaping is applied to them anywhere in the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub index: String,
    pub entry: String,
}

impl IndexKey {
    pub fn new(index: impl Into<String>, entry: impl Into<String>) -> IndexKey {
        IndexKey {
            index: index.into(),
            entry: entry.into(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.entry)
    }
}

/// One fact emitted during pass 1 for a single input file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexRecord {
    /// This input will produce an HTML file at `path`.
    Output { path: String },
    /// This input defines `entry` in `index`. The fragment (empty, or `#anchor`)
    /// is appended to the most recent `Output` path of the same input to form
    /// the entry's location.
    Define {
        index: String,
        entry: String,
        fragment: String,
    },
    /// Text attached to an entry: literal, unevaluated TeX and its plain-text
    /// rendering, as the engine produced both.
    Text {
        index: String,
        entry: String,
        tex: String,
        plain: String,
    },
    /// This input references `entry` in `index` and needs `flags` resolved.
    Reference {
        index: String,
        entry: String,
        flags: EnumSet<DataKind>,
    },
}

impl IndexRecord {
    /// The entry this record is about, if any.
    pub fn key(&self) -> Option<IndexKey> {
        match self {
            IndexRecord::Output { .. } => None,
            IndexRecord::Define { index, entry, .. }
            | IndexRecord::Text { index, entry, .. }
            | IndexRecord::Reference { index, entry, .. } => Some(IndexKey::new(index, entry)),
        }
    }

    pub fn index_name(&self) -> Option<&str> {
        match self {
            IndexRecord::Output { .. } => None,
            IndexRecord::Define { index, .. }
            | IndexRecord::Text { index, .. }
            | IndexRecord::Reference { index, .. } => Some(index),
        }
    }

    pub fn reference(index: &str, entry: &str, flags: EnumSet<DataKind>) -> IndexRecord {
        IndexRecord::Reference {
            index: index.to_string(),
            entry: entry.to_string(),
            flags,
        }
    }
}

impl fmt::Display for IndexRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&metadata::to_line(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn flags_parse_as_a_set() {
        let kinds = DataKind::parse_flags("tlt").unwrap();
        assert_eq!(kinds, DataKind::Location | DataKind::Text);
        assert_eq!(DataKind::format_flags(kinds), "lt");
        assert_eq!(DataKind::parse_flags(""), Ok(EnumSet::empty()));
        assert_eq!(DataKind::parse_flags("lx"), Err('x'));
    }

    #[test]
    fn keys_order_by_index_then_entry() {
        let mut keys = vec![
            IndexKey::new("terms", "a"),
            IndexKey::new("entries", "z"),
            IndexKey::new("entries", "b"),
        ];
        keys.sort();
        assert_eq!(keys[0], IndexKey::new("entries", "b"));
        assert_eq!(keys[2].to_string(), "terms:a");
        assert_eq!(IndexRecord::Output { path: "a.html".into() }.key(), None);
    }
}
