//! Lazy record stream backed by the host.
//!
//! A `DataLoader` knows how many records exist and in which order they will
//! be read. Records are fetched only when `next` needs them: the loader
//! sends a `readData` request listing the indices it wants and waits for the
//! host's data-chunk frame.
//!
//! `next` takes `&mut self`, so one loader can never have two reads in
//! flight; the host may rely on answering each loader's requests in order.
//!
//! # Example
//!
//! ```ignore
//! let inputs = data.get_mut("input").unwrap();
//! inputs.shuffle();
//! while inputs.has_next(32) {
//!     let batch = inputs.next(32).await?;
//!     // ...
//! }
//! ```

use std::collections::{HashMap, VecDeque};

use rand::seq::SliceRandom;

use super::CallScope;
use crate::error::LoaderError;
use crate::host::{HostChannel, ReadRequest};
use crate::model::Tensor;

/// Positionable, shuffleable sequence of records.
pub struct DataLoader {
    host: HostChannel,
    scope: CallScope,
    data_id: String,
    total_byte_size: u64,
    /// Read order as indices into the host's dataset.
    order: Vec<u32>,
    position: usize,
    /// Records `order[position..position + buffered.len()]`, already fetched.
    buffered: VecDeque<Tensor>,
    read_ahead: usize,
}

impl DataLoader {
    pub(crate) fn new(
        host: HostChannel,
        scope: CallScope,
        data_id: String,
        amount: u32,
        total_byte_size: u64,
        read_ahead: usize,
    ) -> Self {
        Self {
            host,
            scope,
            data_id,
            total_byte_size,
            order: (0..amount).collect(),
            position: 0,
            buffered: VecDeque::new(),
            read_ahead,
        }
    }

    /// Serialized size of all records together.
    #[inline]
    pub fn total_byte_size(&self) -> u64 {
        self.total_byte_size
    }

    /// Number of records.
    #[inline]
    pub fn size(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size() - self.position
    }

    /// Move the cursor. `position == size()` is allowed and leaves nothing
    /// to read.
    pub fn set_position(&mut self, position: i64) -> Result<(), LoaderError> {
        let size = self.size();
        let valid = usize::try_from(position).ok().filter(|p| *p <= size);
        let Some(position) = valid else {
            return Err(LoaderError::OutOfRange { position, size });
        };

        if position != self.position {
            self.buffered.clear();
            self.position = position;
        }
        Ok(())
    }

    /// Randomly reorder the records not yet read.
    pub fn shuffle(&mut self) {
        self.order[self.position..].shuffle(&mut rand::thread_rng());
        self.buffered.clear();
    }

    /// Apply one random permutation to this loader and all of `others`, so
    /// record `i` of every loader still belongs together afterwards.
    ///
    /// All loaders must have the same `size()`. Only slots past the furthest
    /// position in the group move: no loader reads a record twice, and a
    /// loader that lags behind first reads the slots it has not reached yet
    /// in their current order.
    pub fn shuffle_in_group(&mut self, others: &mut [&mut DataLoader]) -> Result<(), LoaderError> {
        let expected = self.size();
        if let Some(other) = others.iter().find(|o| o.size() != expected) {
            return Err(LoaderError::SizeMismatch {
                expected,
                found: other.size(),
            });
        }

        let start = others
            .iter()
            .map(|o| o.position)
            .fold(self.position, usize::max);
        let mut permutation: Vec<usize> = (0..expected - start).collect();
        permutation.shuffle(&mut rand::thread_rng());

        self.apply_permutation(start, &permutation);
        for other in others.iter_mut() {
            other.apply_permutation(start, &permutation);
        }
        Ok(())
    }

    /// Reorder `order[start..]` so slot `j` takes the record from `start + permutation[j]`.
    fn apply_permutation(&mut self, start: usize, permutation: &[usize]) {
        let tail: Vec<u32> = permutation.iter().map(|&i| self.order[start + i]).collect();
        self.order[start..].copy_from_slice(&tail);
        self.buffered.clear();
    }

    /// Check if at least `amount` records remain.
    #[inline]
    pub fn has_next(&self, amount: usize) -> bool {
        self.remaining() >= amount
    }

    /// Read the next `amount` records.
    ///
    /// Fails with [`LoaderError::Exhausted`] before any request is sent if
    /// fewer than `amount` remain. The position only advances once the
    /// records have arrived.
    pub async fn next(&mut self, amount: usize) -> Result<Vec<Tensor>, LoaderError> {
        if self.scope.is_complete() {
            return Err(LoaderError::CallCompleted);
        }

        let remaining = self.remaining();
        if amount > remaining {
            return Err(LoaderError::Exhausted {
                requested: amount,
                remaining,
            });
        }

        if self.buffered.len() < amount {
            self.fill(amount.max(self.read_ahead.min(remaining))).await?;
        }

        self.position += amount;
        Ok(self.buffered.drain(..amount).collect())
    }

    /// Fetch records until `target` are buffered.
    async fn fill(&mut self, target: usize) -> Result<(), LoaderError> {
        let start = self.position + self.buffered.len();
        let end = self.position + target;
        let indices = &self.order[start..end];

        let segments = self
            .host
            .read(&ReadRequest::Data {
                data_id: &self.data_id,
                indices,
            })
            .await?;

        if segments.len() != indices.len() {
            return Err(LoaderError::Protocol(format!(
                "Requested {} records from {} but received {}",
                indices.len(),
                self.data_id,
                segments.len()
            )));
        }

        self.buffered.extend(segments.into_iter().map(Tensor::from));
        Ok(())
    }
}

impl std::fmt::Debug for DataLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLoader")
            .field("data_id", &self.data_id)
            .field("size", &self.size())
            .field("position", &self.position)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

/// Data loaders of one call, by name.
#[derive(Debug, Default)]
pub struct DataLoaderMap {
    loaders: HashMap<String, DataLoader>,
}

impl DataLoaderMap {
    pub fn get(&self, name: &str) -> Option<&DataLoader> {
        self.loaders.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DataLoader> {
        self.loaders.get_mut(name)
    }

    /// Take ownership of a loader.
    pub fn remove(&mut self, name: &str) -> Option<DataLoader> {
        self.loaders.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }

    /// [`DataLoader::shuffle_in_group`] over the named loaders. Each name
    /// must appear once.
    pub fn shuffle_in_group(&mut self, names: &[&str]) -> Result<(), LoaderError> {
        let mut taken: Vec<(String, DataLoader)> = Vec::with_capacity(names.len());
        let mut missing = None;
        for name in names {
            match self.loaders.remove(*name) {
                Some(loader) => taken.push((name.to_string(), loader)),
                None => {
                    missing = Some(name.to_string());
                    break;
                }
            }
        }

        let result = match (missing, taken.split_first_mut()) {
            (Some(name), _) => Err(LoaderError::UnknownLoader(name)),
            (None, None) => Ok(()),
            (None, Some(((_, first), rest))) => {
                let mut others: Vec<&mut DataLoader> = rest.iter_mut().map(|(_, l)| l).collect();
                first.shuffle_in_group(&mut others)
            }
        };

        self.loaders.extend(taken);
        result
    }
}

impl FromIterator<(String, DataLoader)> for DataLoaderMap {
    fn from_iter<I: IntoIterator<Item = (String, DataLoader)>>(iter: I) -> Self {
        Self {
            loaders: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for DataLoaderMap {
    type Item = (String, DataLoader);
    type IntoIter = std::collections::hash_map::IntoIter<String, DataLoader>;

    fn into_iter(self) -> Self::IntoIter {
        self.loaders.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeHost;
    use bytes::Bytes;

    fn loader(fake: &FakeHost, data_id: &str, amount: u32) -> DataLoader {
        DataLoader::new(
            fake.host.clone(),
            CallScope::new(),
            data_id.to_string(),
            amount,
            amount as u64 * 4,
            0,
        )
    }

    fn names(records: &[Tensor]) -> Vec<String> {
        records
            .iter()
            .map(|t| String::from_utf8(t.as_bytes().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_queries_without_io() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 5);

        assert_eq!(data.size(), 5);
        assert_eq!(data.total_byte_size(), 20);
        assert_eq!(data.position(), 0);
        assert_eq!(data.remaining(), 5);
        assert!(data.has_next(5));
        assert!(!data.has_next(6));

        data.set_position(5).unwrap();
        assert_eq!(data.remaining(), 0);
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn test_next_reads_in_order() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 4);

        assert_eq!(names(&data.next(2).await.unwrap()), vec!["r0", "r1"]);
        assert_eq!(names(&data.next(1).await.unwrap()), vec!["r2"]);
        assert_eq!(data.position(), 3);

        let requests = fake.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0]["dataId"], "d");
        assert_eq!(requests[0]["indices"], serde_json::json!([0, 1]));
    }

    #[tokio::test]
    async fn test_next_exact_remaining_exhausts() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 3);

        let records = data.next(3).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(data.remaining(), 0);
        assert!(!data.has_next(1));
    }

    #[tokio::test]
    async fn test_next_beyond_remaining_sends_nothing() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 2);

        let result = data.next(3).await;
        assert!(matches!(
            result,
            Err(LoaderError::Exhausted {
                requested: 3,
                remaining: 2
            })
        ));

        fake.settle().await;
        assert_eq!(fake.request_count(), 0);
        assert!(fake.pending.is_empty());
        assert_eq!(data.position(), 0);
    }

    #[tokio::test]
    async fn test_set_position_range() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 3);

        assert!(matches!(
            data.set_position(-1),
            Err(LoaderError::OutOfRange { position: -1, size: 3 })
        ));
        assert!(matches!(
            data.set_position(4),
            Err(LoaderError::OutOfRange { position: 4, size: 3 })
        ));

        data.set_position(2).unwrap();
        assert_eq!(names(&data.next(1).await.unwrap()), vec!["r2"]);
    }

    #[tokio::test]
    async fn test_shuffle_keeps_consumed_prefix() {
        let fake = FakeHost::spawn();
        let mut data = loader(&fake, "d", 50);

        data.next(10).await.unwrap();
        data.shuffle();

        assert_eq!(&data.order[..10], &(0..10).collect::<Vec<u32>>()[..]);
        let mut tail = data.order[10..].to_vec();
        tail.sort();
        assert_eq!(tail, (10..50).collect::<Vec<u32>>());
        assert_eq!(data.remaining(), 40);
    }

    #[tokio::test]
    async fn test_shuffle_in_group_preserves_pairing() {
        let fake = FakeHost::spawn();
        let mut inputs = loader(&fake, "inputs", 20);
        let mut labels = loader(&fake, "labels", 20);

        inputs.shuffle_in_group(&mut [&mut labels]).unwrap();

        let a = inputs.next(20).await.unwrap();
        let b = labels.next(20).await.unwrap();
        assert_eq!(names(&a), names(&b));

        let mut sorted = names(&a);
        sorted.sort();
        let mut expected: Vec<String> = (0..20).map(|i| format!("r{}", i)).collect();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[tokio::test]
    async fn test_shuffle_in_group_keeps_read_records() {
        let fake = FakeHost::spawn();
        let mut inputs = loader(&fake, "inputs", 20);
        let mut labels = loader(&fake, "labels", 20);
        let first = inputs.next(5).await.unwrap();
        labels.next(3).await.unwrap();

        inputs.shuffle_in_group(&mut [&mut labels]).unwrap();

        assert_eq!(&inputs.order[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(&labels.order[..5], &[0, 1, 2, 3, 4]);
        assert_eq!(inputs.position(), 5);
        assert_eq!(names(&first), vec!["r0", "r1", "r2", "r3", "r4"]);

        let caught_up = labels.next(2).await.unwrap();
        assert_eq!(names(&caught_up), vec!["r3", "r4"]);

        let a = inputs.next(15).await.unwrap();
        let b = labels.next(15).await.unwrap();
        assert_eq!(names(&a), names(&b));
        let mut rest = names(&a);
        rest.sort();
        let mut expected: Vec<String> = (5..20).map(|i| format!("r{}", i)).collect();
        expected.sort();
        assert_eq!(rest, expected);
    }

    #[tokio::test]
    async fn test_shuffle_in_group_size_mismatch() {
        let fake = FakeHost::spawn();
        let mut a = loader(&fake, "a", 3);
        let mut b = loader(&fake, "b", 4);

        let result = a.shuffle_in_group(&mut [&mut b]);
        assert!(matches!(
            result,
            Err(LoaderError::SizeMismatch {
                expected: 3,
                found: 4
            })
        ));
        assert_eq!(a.order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_read_ahead_buffers() {
        let fake = FakeHost::spawn();
        let mut data = DataLoader::new(
            fake.host.clone(),
            CallScope::new(),
            "d".to_string(),
            10,
            40,
            4,
        );

        assert_eq!(names(&data.next(1).await.unwrap()), vec!["r0"]);
        assert_eq!(names(&data.next(3).await.unwrap()), vec!["r1", "r2", "r3"]);
        assert_eq!(fake.request_count(), 1);

        data.next(1).await.unwrap();
        assert_eq!(fake.request_count(), 2);
        let requests = fake.requests.lock().unwrap().clone();
        assert_eq!(requests[1]["indices"], serde_json::json!([4, 5, 6, 7]));
    }

    #[tokio::test]
    async fn test_completed_scope_rejects_reads() {
        let fake = FakeHost::spawn();
        let scope = CallScope::new();
        let mut data = DataLoader::new(fake.host.clone(), scope.clone(), "d".into(), 3, 12, 0);

        scope.complete();

        assert!(matches!(
            data.next(1).await,
            Err(LoaderError::CallCompleted)
        ));
        assert_eq!(fake.request_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_segment_count_is_protocol_error() {
        let fake = FakeHost::spawn_with(|_| vec![Bytes::from_static(b"only one")]);
        let mut data = loader(&fake, "d", 3);

        let result = data.next(2).await;
        assert!(matches!(result, Err(LoaderError::Protocol(_))));
        assert_eq!(data.position(), 0);
    }

    #[tokio::test]
    async fn test_map_shuffle_in_group() {
        let fake = FakeHost::spawn();
        let mut map: DataLoaderMap = vec![
            ("x".to_string(), loader(&fake, "x", 8)),
            ("y".to_string(), loader(&fake, "y", 8)),
        ]
        .into_iter()
        .collect();

        map.shuffle_in_group(&["x", "y"]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("x").unwrap().order, map.get("y").unwrap().order);

        let result = map.shuffle_in_group(&["x", "missing"]);
        assert!(matches!(result, Err(LoaderError::UnknownLoader(n)) if n == "missing"));
        assert_eq!(map.len(), 2);
    }
}
