//! Cross-reference resolution between the two passes.
//!
//! [`resolve`] folds the complete pass-1 record set into a [`ResolutionTable`]:
//! one row per referenced `(index, entry)` key carrying the location and/or text
//! that pass 2 substitutes for the reference. Validation failures are collected
//! into a [`ResolutionReport`] rather than stopping at the first one.
//!
//! Resolution is a pure function of the record set. Records are grouped by input
//! path in sorted order, so the same set of records always yields the same table
//! whatever order the inputs were compiled in. The incremental cache relies on
//! this when it fingerprints the rows a file consumed.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Write},
    sync::Arc,
};

use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cache::{Fingerprint, FingerprintBuilder},
    records::{DataKind, IndexKey, IndexRecord, RecordSnapshot},
};

/// Value a lookup yields when nothing is known about an entry yet.
pub const PLACEHOLDER: &str = "?";

/// Terminates the resolved-reference block handed to a pass-2 compilation.
pub const RESOLVED_TEX_TERMINATOR: &str = "---";

/// The three data types a pass-2 compilation can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResolvedDatum {
    Location,
    TextTex,
    TextPlain,
}

impl ResolvedDatum {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedDatum::Location => "loc",
            ResolvedDatum::TextTex => "text tex",
            ResolvedDatum::TextPlain => "text plain",
        }
    }

    pub fn parse(s: &str) -> Option<ResolvedDatum> {
        match s {
            "loc" => Some(ResolvedDatum::Location),
            "text tex" => Some(ResolvedDatum::TextTex),
            "text plain" => Some(ResolvedDatum::TextPlain),
            _ => None,
        }
    }

    fn for_kind(kind: DataKind) -> &'static [ResolvedDatum] {
        match kind {
            DataKind::Location => &[ResolvedDatum::Location],
            DataKind::Text => &[ResolvedDatum::TextTex, ResolvedDatum::TextPlain],
        }
    }
}

/// Resolved data for one entry. Only the kinds some input asked for are filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResolvedEntry {
    pub location: Option<String>,
    pub text_tex: Option<String>,
    pub text_plain: Option<String>,
}

impl ResolvedEntry {
    pub fn datum(&self, datum: ResolvedDatum) -> Option<&str> {
        match datum {
            ResolvedDatum::Location => self.location.as_deref(),
            ResolvedDatum::TextTex => self.text_tex.as_deref(),
            ResolvedDatum::TextPlain => self.text_plain.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ResolutionError {
    #[error("{key} is defined more than once")]
    DuplicateDefinition { key: IndexKey, files: Vec<String> },
    #[error("reference to undefined entry {key}")]
    UnresolvedReference { key: IndexKey, files: Vec<String> },
    #[error("entry {key} is referenced with flag(s) `{}` but never supplies that data", flag_label(.missing))]
    IncompleteEntry {
        key: IndexKey,
        missing: EnumSet<DataKind>,
        files: Vec<String>,
    },
    #[error("index `{index}` is not declared in the project configuration")]
    UnknownIndex { index: String, files: Vec<String> },
}

fn flag_label(kinds: &EnumSet<DataKind>) -> String {
    DataKind::format_flags(*kinds)
}

impl ResolutionError {
    /// Input files to attribute the error to.
    pub fn files(&self) -> &[String] {
        match self {
            ResolutionError::DuplicateDefinition { files, .. }
            | ResolutionError::UnresolvedReference { files, .. }
            | ResolutionError::IncompleteEntry { files, .. }
            | ResolutionError::UnknownIndex { files, .. } => files,
        }
    }

    pub fn context(&self) -> Vec<String> {
        let verb = match self {
            ResolutionError::DuplicateDefinition { .. } => "defined in",
            ResolutionError::UnresolvedReference { .. }
            | ResolutionError::IncompleteEntry { .. } => "referenced from",
            ResolutionError::UnknownIndex { .. } => "used in",
        };
        self.files().iter().map(|f| format!("{verb} {f}")).collect()
    }
}

/// Every validation failure found in one resolution, in deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub errors: Vec<ResolutionError>,
}

impl ResolutionReport {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for ResolutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for err in self.errors.iter() {
            writeln!(f, "{err}")?;
            for line in err.context() {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}

/// The published, immutable result of a successful resolution.
///
/// Cloning shares the rows. A new build produces a new table; nothing mutates a
/// table once it exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionTable {
    rows: Arc<BTreeMap<IndexKey, ResolvedEntry>>,
}

impl ResolutionTable {
    pub fn get(&self, key: &IndexKey) -> Option<&ResolvedEntry> {
        self.rows.get(key)
    }

    /// Map lookup with the forward-reference default: unknown entries and
    /// unrequested data yield [`PLACEHOLDER`].
    pub fn lookup(&self, key: &IndexKey, datum: ResolvedDatum) -> &str {
        self.rows
            .get(key)
            .and_then(|row| row.datum(datum))
            .unwrap_or(PLACEHOLDER)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IndexKey, &ResolvedEntry)> {
        self.rows.iter()
    }

    /// Digest of exactly the data `refs` consumes from this table.
    pub fn subset_digest(&self, refs: &BTreeMap<IndexKey, EnumSet<DataKind>>) -> Fingerprint {
        let mut hasher = FingerprintBuilder::new("resolution-subset");
        for (key, kinds) in refs.iter() {
            hasher.update_str(&key.index).update_str(&key.entry);
            for kind in kinds.iter() {
                for datum in ResolvedDatum::for_kind(kind) {
                    hasher.update_str(datum.as_str());
                    match self.get(key).and_then(|row| row.datum(*datum)) {
                        Some(value) => hasher.update_u8(1).update_str(value),
                        None => hasher.update_u8(0),
                    };
                }
            }
        }
        hasher.finish()
    }

    /// Resolved-reference lines for a pass-2 compilation, one per needed datum,
    /// followed by the terminator line.
    pub fn resolved_tex(&self, refs: &BTreeMap<IndexKey, EnumSet<DataKind>>) -> String {
        let mut out = String::new();
        for (key, kinds) in refs.iter() {
            for kind in kinds.iter() {
                for datum in ResolvedDatum::for_kind(kind) {
                    // writing to a String cannot fail
                    let _ = writeln!(
                        out,
                        "\\pediaResolvedRef{{{}}}{{{}}}{{{}}}{{{}}}",
                        key.index,
                        key.entry,
                        datum.as_str(),
                        self.lookup(key, *datum)
                    );
                }
            }
        }
        out.push_str(RESOLVED_TEX_TERMINATOR);
        out.push('\n');
        out
    }
}

/// The references one input makes, merged per key.
pub fn references_of(records: &[IndexRecord]) -> BTreeMap<IndexKey, EnumSet<DataKind>> {
    let mut refs: BTreeMap<IndexKey, EnumSet<DataKind>> = BTreeMap::new();
    for record in records.iter() {
        if let IndexRecord::Reference {
            index,
            entry,
            flags,
        } = record
        {
            *refs.entry(IndexKey::new(index, entry)).or_default() |= *flags;
        }
    }
    refs
}

/// Every output path declared by the snapshot, sorted and deduplicated.
pub fn declared_outputs(records: &RecordSnapshot) -> BTreeSet<String> {
    records
        .iter()
        .filter_map(|(_, r)| match r {
            IndexRecord::Output { path } => Some(path.clone()),
            _ => None,
        })
        .collect()
}

struct Definition<'a> {
    file: &'a str,
    location: Option<String>,
}

struct TextSource<'a> {
    file: &'a str,
    seq: usize,
    tex: &'a str,
    plain: &'a str,
}

#[derive(Default)]
struct EntryFacts<'a> {
    defines: Vec<Definition<'a>>,
    texts: Vec<TextSource<'a>>,
    referrers: BTreeSet<&'a str>,
    wanted: EnumSet<DataKind>,
}

impl EntryFacts<'_> {
    fn available(&self) -> EnumSet<DataKind> {
        let mut kinds = EnumSet::empty();
        if self.defines.iter().any(|d| d.location.is_some()) {
            kinds |= DataKind::Location;
        }
        if !self.texts.is_empty() {
            kinds |= DataKind::Text;
        }
        kinds
    }

    /// Text attached in the defining file wins; otherwise the first text by
    /// `(file, position)`.
    fn chosen_text(&self) -> Option<&TextSource<'_>> {
        let def_file = self.defines.first().map(|d| d.file);
        self.texts
            .iter()
            .min_by_key(|t| (Some(t.file) != def_file, t.file, t.seq))
    }
}

/// Build the resolution table for a complete record set.
///
/// `indices` lists the index names the project accepts; an empty slice accepts
/// any name.
#[tracing::instrument(skip_all)]
pub fn resolve(
    records: &RecordSnapshot,
    indices: &[String],
) -> Result<ResolutionTable, ResolutionReport> {
    let mut facts: BTreeMap<IndexKey, EntryFacts<'_>> = BTreeMap::new();
    let mut unknown: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for (file, file_records) in records.files() {
        let mut current_output: Option<&str> = None;
        for (seq, record) in file_records.iter().enumerate() {
            if let Some(index) = record.index_name() {
                if !indices.is_empty() && !indices.iter().any(|i| i == index) {
                    unknown.entry(index).or_default().insert(file);
                    continue;
                }
            }
            match record {
                IndexRecord::Output { path } => current_output = Some(path),
                IndexRecord::Define {
                    index,
                    entry,
                    fragment,
                } => {
                    facts
                        .entry(IndexKey::new(index, entry))
                        .or_default()
                        .defines
                        .push(Definition {
                            file,
                            location: current_output.map(|path| format!("{path}{fragment}")),
                        });
                }
                IndexRecord::Text {
                    index,
                    entry,
                    tex,
                    plain,
                } => {
                    facts
                        .entry(IndexKey::new(index, entry))
                        .or_default()
                        .texts
                        .push(TextSource {
                            file,
                            seq,
                            tex,
                            plain,
                        });
                }
                IndexRecord::Reference {
                    index,
                    entry,
                    flags,
                } => {
                    let f = facts.entry(IndexKey::new(index, entry)).or_default();
                    f.referrers.insert(file);
                    f.wanted |= *flags;
                }
            }
        }
    }

    let mut errors = Vec::new();
    for (index, files) in unknown {
        errors.push(ResolutionError::UnknownIndex {
            index: index.to_string(),
            files: files.into_iter().map(String::from).collect(),
        });
    }

    let mut rows = BTreeMap::new();
    for (key, f) in facts {
        let referrers = || f.referrers.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        if f.defines.len() > 1 {
            let files: BTreeSet<&str> = f.defines.iter().map(|d| d.file).collect();
            errors.push(ResolutionError::DuplicateDefinition {
                key,
                files: files.into_iter().map(String::from).collect(),
            });
            continue;
        }
        if f.referrers.is_empty() {
            continue;
        }
        if f.defines.is_empty() {
            errors.push(ResolutionError::UnresolvedReference {
                key,
                files: referrers(),
            });
            continue;
        }
        let missing = f.wanted - f.available();
        if !missing.is_empty() {
            errors.push(ResolutionError::IncompleteEntry {
                key,
                missing,
                files: referrers(),
            });
            continue;
        }

        let mut row = ResolvedEntry::default();
        if f.wanted.contains(DataKind::Location) {
            row.location = f.defines.first().and_then(|d| d.location.clone());
        }
        if f.wanted.contains(DataKind::Text) {
            if let Some(text) = f.chosen_text() {
                row.text_tex = Some(text.tex.to_string());
                row.text_plain = Some(text.plain.to_string());
            }
        }
        rows.insert(key, row);
    }

    if errors.is_empty() {
        tracing::info!("[Resolver] resolved {} referenced entries", rows.len());
        Ok(ResolutionTable {
            rows: Arc::new(rows),
        })
    } else {
        tracing::info!("[Resolver] resolution failed with {} error(s)", errors.len());
        Err(ResolutionReport { errors })
    }
}
