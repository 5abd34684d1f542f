//! Batch primitives: chunking inputs to the service's batch limit and folding the per-chunk
//! outcomes back into one [`BatchResult`].
//!
//! Every item handed to a batch operation ends up in exactly one place of its result: the
//! success list, or a single bucket of the failure map.

use std::collections::HashMap;
use std::hash::Hash;

/// Hard limit on entries per batch request.
pub const SQS_BATCH_SIZE: usize = 10;

/// Code used when a whole batch call failed instead of individual entries.
pub const CALL_FAILED_CODE: &str = "CALL_FAILED";

/// An entry of a batch call that the service (or the call as a whole) rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBatchEntry<T> {
    /// The input item that failed.
    pub reference: T,
    /// Provider error code.
    pub code: String,
    pub message: Option<String>,
    /// Whether the provider blamed the caller.
    pub sender_fault: Option<bool>,
}

/// Per-entry error as reported by a batch response, correlated through the request entry id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchErrorEntry {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// Outcome of a batch operation: failed entries grouped by cause, and the items that succeeded.
#[derive(Debug, Clone)]
pub struct BatchResult<F, T> {
    failed: HashMap<F, Vec<FailedBatchEntry<T>>>,
    succeeded: Vec<T>,
}

impl<F, T> Default for BatchResult<F, T> {
    fn default() -> Self {
        Self {
            failed: HashMap::new(),
            succeeded: Vec::new(),
        }
    }
}

impl<F: Eq + Hash, T> BatchResult<F, T> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn success(items: Vec<T>) -> Self {
        Self {
            failed: HashMap::new(),
            succeeded: items,
        }
    }

    pub fn failure(cause: F, entries: Vec<FailedBatchEntry<T>>) -> Self {
        let mut result = Self::default();
        result.add_failures(cause, entries);
        result
    }

    /// Adds entries under `cause`, coalescing with an existing bucket. Empty lists are ignored
    /// so that buckets are never empty.
    pub fn add_failures(&mut self, cause: F, entries: Vec<FailedBatchEntry<T>>) {
        if entries.is_empty() {
            return;
        }
        self.failed.entry(cause).or_default().extend(entries);
    }

    pub fn add_success(&mut self, item: T) {
        self.succeeded.push(item);
    }

    /// Merges `other` into `self`: failure buckets by cause, successes concatenated.
    pub fn merge(mut self, other: Self) -> Self {
        for (cause, entries) in other.failed {
            self.add_failures(cause, entries);
        }
        self.succeeded.extend(other.succeeded);
        self
    }

    pub fn failures(&self) -> &HashMap<F, Vec<FailedBatchEntry<T>>> {
        &self.failed
    }

    pub fn successes(&self) -> &[T] {
        &self.succeeded
    }

    /// Every failed entry paired with its cause.
    pub fn failed_entries(&self) -> impl Iterator<Item = (&F, &FailedBatchEntry<T>)> {
        self.failed
            .iter()
            .flat_map(|(cause, entries)| entries.iter().map(move |entry| (cause, entry)))
    }

    pub fn into_parts(self) -> (HashMap<F, Vec<FailedBatchEntry<T>>>, Vec<T>) {
        (self.failed, self.succeeded)
    }

    pub fn failed_count(&self) -> usize {
        self.failed.values().map(Vec::len).sum()
    }

    /// Total number of classified items.
    pub fn len(&self) -> usize {
        self.failed_count() + self.succeeded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Re-keys failures; buckets that map to the same new cause are merged.
    pub fn map_failures<G: Eq + Hash>(self, mut f: impl FnMut(F) -> G) -> BatchResult<G, T> {
        let mut mapped = BatchResult::success(self.succeeded);
        for (cause, entries) in self.failed {
            mapped.add_failures(f(cause), entries);
        }
        mapped
    }

    /// Transforms every item, failed or succeeded.
    pub fn map_items<U>(self, mut f: impl FnMut(T) -> U) -> BatchResult<F, U> {
        let failed = self
            .failed
            .into_iter()
            .map(|(cause, entries)| {
                let entries = entries
                    .into_iter()
                    .map(|entry| FailedBatchEntry {
                        reference: f(entry.reference),
                        code: entry.code,
                        message: entry.message,
                        sender_fault: entry.sender_fault,
                    })
                    .collect();
                (cause, entries)
            })
            .collect();
        let succeeded = self.succeeded.into_iter().map(f).collect();
        BatchResult { failed, succeeded }
    }
}

impl<F: Eq + Hash, T> FromIterator<BatchResult<F, T>> for BatchResult<F, T> {
    fn from_iter<I: IntoIterator<Item = BatchResult<F, T>>>(iter: I) -> Self {
        aggregate(iter)
    }
}

/// Folds per-chunk results into one result covering the whole input.
pub fn aggregate<F: Eq + Hash, T>(
    results: impl IntoIterator<Item = BatchResult<F, T>>,
) -> BatchResult<F, T> {
    results
        .into_iter()
        .fold(BatchResult::empty(), BatchResult::merge)
}

/// Splits `items` into order-preserving chunks of at most `max_size`, pairing every item with a
/// correlation id derived from its position in the whole input.
///
/// Batch responses report failures by the caller-supplied entry id, so the id is what maps a
/// failure back to the original item.
pub fn chunk_for_batching<T>(
    items: impl IntoIterator<Item = T>,
    max_size: usize,
) -> Vec<Vec<(String, T)>> {
    let max_size = max_size.max(1);
    let mut chunks: Vec<Vec<(String, T)>> = Vec::new();

    for (index, item) in items.into_iter().enumerate() {
        match chunks.last_mut() {
            Some(chunk) if chunk.len() < max_size => chunk.push((index.to_string(), item)),
            _ => {
                let mut chunk = Vec::with_capacity(max_size);
                chunk.push((index.to_string(), item));
                chunks.push(chunk);
            }
        }
    }

    chunks
}

/// Classifies the items of one chunk using the error entries of its batch response. Items
/// without an error entry succeeded; error entries with unknown ids are ignored.
pub fn split_failure_and_success<F: Eq + Hash, T>(
    cause: F,
    chunk: Vec<(String, T)>,
    failed: Vec<BatchErrorEntry>,
) -> BatchResult<F, T> {
    let mut by_id: HashMap<String, BatchErrorEntry> = failed
        .into_iter()
        .map(|entry| (entry.id.clone(), entry))
        .collect();

    let mut result = BatchResult::empty();
    let mut failures = Vec::new();
    for (id, item) in chunk {
        match by_id.remove(&id) {
            Some(error) => failures.push(FailedBatchEntry {
                reference: item,
                code: error.code,
                message: error.message,
                sender_fault: Some(error.sender_fault),
            }),
            None => result.add_success(item),
        }
    }
    result.add_failures(cause, failures);
    result
}

/// Marks every item as failed because the batch call itself failed.
pub fn batch_call_failed<F: Eq + Hash, T>(
    cause: F,
    items: Vec<T>,
    sender_fault: Option<bool>,
) -> BatchResult<F, T> {
    let entries = items
        .into_iter()
        .map(|item| FailedBatchEntry {
            reference: item,
            code: CALL_FAILED_CODE.to_string(),
            message: Some("The batch call failed completely".to_string()),
            sender_fault,
        })
        .collect();
    BatchResult::failure(cause, entries)
}
