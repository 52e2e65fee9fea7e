use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::RwLock;

use super::IndexRecord;

type FileRecords = BTreeMap<String, Arc<Vec<IndexRecord>>>;

#[derive(Debug, Default)]
struct StoreInner {
    files: FileRecords,
    dirty: BTreeSet<String>,
}

/// Per-input accumulation of pass-1 index records.
///
/// Records are partitioned by repository-relative input path. Each file's list
/// keeps insertion order. Readers take a [`RecordSnapshot`], so replacing one
/// file's records is never observed half-done by a concurrent resolution.
///
/// The store is a cheap handle; clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct IndexRecordStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl IndexRecordStore {
    pub fn new() -> IndexRecordStore {
        IndexRecordStore::default()
    }

    /// Append one record to `file`'s list and mark the file dirty.
    pub fn record(&self, file: &str, record: IndexRecord) {
        let mut inner = self.inner.write();
        let list = inner.files.entry(file.to_string()).or_default();
        Arc::make_mut(list).push(record);
        inner.dirty.insert(file.to_string());
    }

    /// Atomically replace everything known about `file`. The file is only marked
    /// dirty when the new list differs from the old one.
    pub fn replace(&self, file: &str, records: Vec<IndexRecord>) {
        let mut inner = self.inner.write();
        let unchanged = inner
            .files
            .get(file)
            .is_some_and(|old| old.as_slice() == records.as_slice());
        if unchanged {
            return;
        }
        inner.files.insert(file.to_string(), Arc::new(records));
        inner.dirty.insert(file.to_string());
        tracing::trace!("[RecordStore] replaced records for {file}");
    }

    /// Forget `file` entirely.
    pub fn remove(&self, file: &str) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.files.remove(file).is_some();
        if removed {
            inner.dirty.insert(file.to_string());
        }
        removed
    }

    /// Drop every file not named by `keep`, returning the paths that were pruned.
    pub fn retain_files(&self, keep: &BTreeSet<String>) -> Vec<String> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .files
            .keys()
            .filter(|f| !keep.contains(*f))
            .cloned()
            .collect();
        for file in stale.iter() {
            inner.files.remove(file);
            inner.dirty.insert(file.clone());
        }
        stale
    }

    /// Records for one file in insertion order; empty if it was never compiled.
    pub fn records_for(&self, file: &str) -> Arc<Vec<IndexRecord>> {
        self.inner
            .read()
            .files
            .get(file)
            .cloned()
            .unwrap_or_default()
    }

    pub fn files(&self) -> Vec<String> {
        self.inner.read().files.keys().cloned().collect()
    }

    /// A consistent, restartable view of every record in the store.
    pub fn all_records(&self) -> RecordSnapshot {
        RecordSnapshot {
            files: self.inner.read().files.clone(),
        }
    }

    /// Return and clear the set of files whose records changed since the last call.
    pub fn take_dirty(&self) -> BTreeSet<String> {
        std::mem::take(&mut self.inner.write().dirty)
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.read().dirty.is_empty()
    }
}

/// Frozen view of the store taken by [`IndexRecordStore::all_records`].
///
/// Files iterate in path order and each file's records in insertion order.
/// Iteration can be repeated any number of times.
#[derive(Debug, Clone, Default)]
pub struct RecordSnapshot {
    files: FileRecords,
}

impl RecordSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &IndexRecord)> + '_ {
        self.files
            .iter()
            .flat_map(|(file, records)| records.iter().map(move |r| (file.as_str(), r)))
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, &[IndexRecord])> + '_ {
        self.files.iter().map(|(f, r)| (f.as_str(), r.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.files.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<(String, Vec<IndexRecord>)> for RecordSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, Vec<IndexRecord>)>>(iter: T) -> Self {
        let mut files = FileRecords::new();
        for (file, records) in iter {
            Arc::make_mut(files.entry(file).or_default()).extend(records);
        }
        RecordSnapshot { files }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DataKind;
    use test_log::test;

    fn output(path: &str) -> IndexRecord {
        IndexRecord::Output { path: path.into() }
    }

    #[test]
    fn records_keep_insertion_order_per_file() {
        let store = IndexRecordStore::new();
        store.record("txt/b.tex", output("b.html"));
        store.record(
            "txt/b.tex",
            IndexRecord::reference("entries", "a", DataKind::Location.into()),
        );
        store.record("txt/a.tex", output("a.html"));

        assert_eq!(store.records_for("txt/b.tex")[0], output("b.html"));
        assert!(store.records_for("txt/missing.tex").is_empty());

        let snapshot = store.all_records();
        let files: Vec<&str> = snapshot.iter().map(|(f, _)| f).collect();
        assert_eq!(files, vec!["txt/a.tex", "txt/b.tex", "txt/b.tex"]);
        // restartable
        assert_eq!(snapshot.iter().count(), 3);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn snapshots_do_not_see_later_replacements() {
        let store = IndexRecordStore::new();
        store.replace("txt/a.tex", vec![output("old.html")]);
        let before = store.all_records();
        store.replace("txt/a.tex", vec![output("new.html"), output("extra.html")]);

        assert_eq!(before.len(), 1);
        assert_eq!(before.iter().next().unwrap().1, &output("old.html"));
        assert_eq!(store.all_records().len(), 2);
    }

    #[test]
    fn dirty_tracking_ignores_identical_replacements() {
        let store = IndexRecordStore::new();
        store.replace("txt/a.tex", vec![output("a.html")]);
        assert_eq!(
            store.take_dirty(),
            BTreeSet::from(["txt/a.tex".to_string()])
        );
        store.replace("txt/a.tex", vec![output("a.html")]);
        assert!(!store.is_dirty());
        store.record("txt/a.tex", output("a2.html"));
        assert!(store.is_dirty());
    }

    #[test]
    fn retain_prunes_vanished_inputs() {
        let store = IndexRecordStore::new();
        store.replace("txt/a.tex", vec![output("a.html")]);
        store.replace("txt/gone.tex", vec![output("gone.html")]);
        store.take_dirty();

        let pruned = store.retain_files(&BTreeSet::from(["txt/a.tex".to_string()]));
        assert_eq!(pruned, vec!["txt/gone.tex".to_string()]);
        assert_eq!(store.files(), vec!["txt/a.tex".to_string()]);
        assert!(store.take_dirty().contains("txt/gone.tex"));
        assert!(!store.remove("txt/gone.tex"));
    }
}
