//! Append-only result accumulator shared by the pagination loop and the
//! subpage crawler.
//!
//! Only two mutations exist: appending a record and filling empty fields of
//! an existing record. Neither can overwrite populated data, so merges from
//! the crawler commute and a single lock is enough.

use crate::record::Record;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Position of a record in the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordId(usize);

impl RecordId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct Accumulator {
    records: Vec<Record>,
    /// Records already collected, by content fingerprint at append time.
    seen: HashMap<String, Vec<RecordId>>,
}

impl Accumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record unconditionally.
    pub fn append(&mut self, record: Record) -> RecordId {
        let id = RecordId(self.records.len());
        self.seen.entry(record.fingerprint()).or_default().push(id);
        self.records.push(record);
        id
    }

    /// Append the records of one view of a page, skipping records already
    /// collected from an earlier view.
    ///
    /// The k-th occurrence of a fingerprint in `batch` matches the k-th stored
    /// record with that fingerprint, so a page that legitimately lists the same
    /// content twice keeps both, while a re-extracted page adds nothing.
    /// Returns, for each input record, its id if it was newly appended.
    pub fn append_batch(&mut self, batch: Vec<Record>) -> Vec<Option<RecordId>> {
        let mut occurrences: HashMap<String, usize> = HashMap::new();
        batch
            .into_iter()
            .map(|record| {
                let fingerprint = record.fingerprint();
                let occurrence = occurrences.entry(fingerprint.clone()).or_insert(0);
                let k = *occurrence;
                *occurrence += 1;

                let stored = self.seen.get(&fingerprint).map_or(0, Vec::len);
                (stored <= k).then(|| self.append(record))
            })
            .collect()
    }

    /// Fill empty fields of record `id` from `detail`.
    ///
    /// Returns the number of fields filled, or `None` for an unknown id.
    pub fn merge_fill(&mut self, id: RecordId, detail: &Record) -> Option<usize> {
        self.records
            .get_mut(id.0)
            .map(|record| record.fill_from(detail))
    }

    #[must_use]
    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.records.get(id.0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Handle to an [`Accumulator`] behind one async mutation gate.
#[derive(Debug, Clone, Default)]
pub struct SharedAccumulator {
    inner: Arc<Mutex<Accumulator>>,
}

impl SharedAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, record: Record) -> RecordId {
        self.inner.lock().await.append(record)
    }

    pub async fn append_batch(&self, batch: Vec<Record>) -> Vec<Option<RecordId>> {
        self.inner.lock().await.append_batch(batch)
    }

    pub async fn merge_fill(&self, id: RecordId, detail: &Record) -> Option<usize> {
        self.inner.lock().await.merge_fill(id, detail)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Copy of every record in collection order.
    pub async fn snapshot(&self) -> Vec<Record> {
        self.inner.lock().await.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    fn item(name: &str) -> Record {
        let mut record = Record::new();
        record.insert("name", Value::Scalar(name.to_string()));
        record
    }

    #[test]
    fn test_reextracted_page_adds_only_new_records() {
        let mut acc = Accumulator::new();
        let first = acc.append_batch(vec![item("a"), item("b")]);
        assert!(first.iter().all(Option::is_some));

        let second = acc.append_batch(vec![item("a"), item("b"), item("c"), item("d")]);
        assert_eq!(second.iter().filter(|id| id.is_some()).count(), 2);
        assert_eq!(acc.len(), 4);
    }

    #[test]
    fn test_repeated_content_on_one_page_is_kept() {
        let mut acc = Accumulator::new();
        acc.append_batch(vec![item("same"), item("same")]);
        assert_eq!(acc.len(), 2);

        acc.append_batch(vec![item("same"), item("same"), item("same")]);
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn test_merge_fill_keeps_identity_for_dedup() {
        let mut acc = Accumulator::new();
        let ids = acc.append_batch(vec![item("a")]);
        let id = ids[0].expect("appended");

        let mut detail = Record::new();
        detail.insert("bio", Value::Scalar("hello".into()));
        assert_eq!(acc.merge_fill(id, &detail), Some(1));

        let again = acc.append_batch(vec![item("a")]);
        assert_eq!(again, vec![None]);
        assert_eq!(acc.len(), 1);
        assert!(acc.get(id).and_then(|r| r.get("bio")).is_some());
    }

    #[tokio::test]
    async fn test_shared_merges_commute() {
        let shared = SharedAccumulator::new();
        let id = shared.append(item("a")).await;

        let mut left = Record::new();
        left.insert("x", Value::Scalar("1".into()));
        let mut right = Record::new();
        right.insert("y", Value::Scalar("2".into()));

        let (a, b) = tokio::join!(shared.merge_fill(id, &left), shared.merge_fill(id, &right));
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(1));

        let records = shared.snapshot().await;
        assert_eq!(records[0].len(), 3);
        assert_eq!(shared.len().await, 1);
    }
}
