//! Record and batch model.
//!
//! A [`Record`] is an opaque payload plus sequence metadata; a [`Batch`] is an
//! ordered group of records moved atomically between stages. Records are
//! immutable once created: sequence ids are assigned by the engine when the
//! source emits a payload and never change as the batch moves downstream.

/// A single unit of data flowing through a pipeline.
///
/// `sequence_id` is strictly increasing within one source's output. `key` is
/// an optional partition/ordering key carried alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<T> {
    payload: T,
    sequence_id: u64,
    key: Option<String>,
}

impl<T> Record<T> {
    #[must_use]
    pub fn new(sequence_id: u64, payload: T) -> Self {
        Self {
            payload,
            sequence_id,
            key: None,
        }
    }

    /// Attach a partition/ordering key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    #[must_use]
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Consume the record, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Map the payload while keeping sequence metadata intact.
    ///
    /// This is how order-preserving transforms keep their claim: the output
    /// record carries the input's `sequence_id` and `key`.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Record<U> {
        Record {
            payload: f(self.payload),
            sequence_id: self.sequence_id,
            key: self.key,
        }
    }
}

/// An ordered group of records, the unit of hand-off between stages.
///
/// Batches in flight between stages are never empty, but emptiness is
/// representable: [`Batch::filter`] (or a transform's own construction) may
/// produce an empty batch, and the engine drops it instead of forwarding it
/// downstream. End-of-stream is a queue-level marker, not an empty batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    records: Vec<Record<T>>,
}

impl<T> Batch<T> {
    #[must_use]
    pub fn new(records: Vec<Record<T>>) -> Self {
        Self { records }
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
    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<Record<T>> {
        self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record<T>> {
        self.records.iter()
    }

    /// Sequence id of the first record, if any.
    #[must_use]
    pub fn first_sequence_id(&self) -> Option<u64> {
        self.records.first().map(Record::sequence_id)
    }

    /// Sequence id of the last record, if any.
    #[must_use]
    pub fn last_sequence_id(&self) -> Option<u64> {
        self.records.last().map(Record::sequence_id)
    }

    /// Map every payload, preserving order and sequence metadata.
    #[must_use]
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Batch<U> {
        Batch {
            records: self.records.into_iter().map(|r| r.map(&mut f)).collect(),
        }
    }

    /// Fallible [`Batch::map`]: the first error aborts the whole batch.
    pub fn try_map<U, E>(
        self,
        mut f: impl FnMut(&T) -> Result<U, E>,
    ) -> Result<Batch<U>, E> {
        let mut records = Vec::with_capacity(self.records.len());
        for record in self.records {
            let mapped = f(record.payload())?;
            records.push(record.map(|_| mapped));
        }
        Ok(Batch { records })
    }

    /// Keep only the records whose payload satisfies the predicate.
    ///
    /// The result may be empty; the engine drops empty batches instead of
    /// forwarding them.
    #[must_use]
    pub fn filter(self, mut pred: impl FnMut(&T) -> bool) -> Batch<T> {
        Batch {
            records: self
                .records
                .into_iter()
                .filter(|r| pred(r.payload()))
                .collect(),
        }
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a Record<T>;
    type IntoIter = std::slice::Iter<'a, Record<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = Record<T>;
    type IntoIter = std::vec::IntoIter<Record<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}
