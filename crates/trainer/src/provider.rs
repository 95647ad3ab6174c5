use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;

use crate::config::RetryPolicy;
use crate::error::{Result, TrainError};
use crate::example::{Batch, Example, Split};

/// Source of micro-batches. Batches for a split come back in a single
/// ordered sequence ending with `EndOfSplit` until the split is reset.
pub trait DatasetProvider {
    fn next_batch(&mut self, split: Split) -> Result<Batch>;

    /// Rewinds `split` for another pass. The training split is reordered
    /// for `epoch`.
    fn reset(&mut self, split: Split, epoch: usize) -> Result<()>;

    fn has_split(&self, split: Split) -> bool;
}

struct SplitCursor {
    examples: Vec<Example>,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
}

impl SplitCursor {
    fn new(examples: Vec<Example>, batch_size: usize) -> Self {
        let order = (0..examples.len()).collect();
        Self {
            examples,
            order,
            position: 0,
            batch_size: batch_size.max(1),
        }
    }

    fn next(&mut self) -> Batch {
        if self.position >= self.order.len() {
            return Batch::EndOfSplit;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self.order[self.position..end]
            .iter()
            .map(|&i| self.examples[i].clone())
            .collect();
        self.position = end;
        Batch::Examples(batch)
    }
}

/// Serves fully loaded splits from memory.
pub struct InMemoryProvider {
    splits: HashMap<Split, SplitCursor>,
    seed: u64,
    shuffle_train: bool,
}

impl InMemoryProvider {
    /// `batch_size` applies to the training split, `eval_batch_size` to the others.
    pub fn new(
        splits: impl IntoIterator<Item = (Split, Vec<Example>)>,
        batch_size: usize,
        eval_batch_size: usize,
        seed: u64,
    ) -> Self {
        let splits = splits
            .into_iter()
            .map(|(split, examples)| {
                let size = if split == Split::Train { batch_size } else { eval_batch_size };
                (split, SplitCursor::new(examples, size))
            })
            .collect();
        Self {
            splits,
            seed,
            shuffle_train: true,
        }
    }

    /// Keeps the training split in file order every epoch.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle_train = false;
        self
    }

    fn cursor(&mut self, split: Split) -> Result<&mut SplitCursor> {
        self.splits
            .get_mut(&split)
            .ok_or_else(|| TrainError::Provider(format!("no {split} split loaded")))
    }
}

impl DatasetProvider for InMemoryProvider {
    fn next_batch(&mut self, split: Split) -> Result<Batch> {
        Ok(self.cursor(split)?.next())
    }

    fn reset(&mut self, split: Split, epoch: usize) -> Result<()> {
        let shuffle = self.shuffle_train && split == Split::Train;
        let seed = self.seed.wrapping_add(epoch as u64);
        let cursor = self.cursor(split)?;
        cursor.position = 0;
        cursor.order = (0..cursor.examples.len()).collect();
        if shuffle {
            cursor.order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Ok(())
    }

    fn has_split(&self, split: Split) -> bool {
        self.splits.contains_key(&split)
    }
}

/// `next_batch` with bounded exponential backoff on retryable errors.
/// Exhausted retries surface as `ProviderTimeout` carrying the attempt count.
pub fn fetch_with_retry(provider: &mut dyn DatasetProvider, split: Split, policy: &RetryPolicy) -> Result<Batch> {
    let mut attempt = 0u32;
    loop {
        match provider.next_batch(split) {
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                log::warn!("{err}; retry {attempt}/{} in {:?}", policy.max_retries, delay);
                std::thread::sleep(delay);
            }
            Err(TrainError::ProviderTimeout { split, .. }) => {
                return Err(TrainError::ProviderTimeout {
                    split,
                    attempts: attempt + 1,
                })
            }
            other => return other,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn examples(n: usize) -> Vec<Example> {
        (0..n).map(|i| Example::new(i, format!("q{i}"), format!("a{i}"))).collect()
    }

    fn drain(provider: &mut dyn DatasetProvider, split: Split) -> Vec<Vec<usize>> {
        let mut batches = Vec::new();
        while let Batch::Examples(batch) = provider.next_batch(split).unwrap() {
            batches.push(batch.iter().map(|e| e.id).collect());
        }
        batches
    }

    /// Times out `failures` times before answering.
    pub(crate) struct Flaky {
        pub failures: u32,
        pub inner: InMemoryProvider,
    }

    impl DatasetProvider for Flaky {
        fn next_batch(&mut self, split: Split) -> Result<Batch> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(TrainError::ProviderTimeout { split, attempts: 1 });
            }
            self.inner.next_batch(split)
        }

        fn reset(&mut self, split: Split, epoch: usize) -> Result<()> {
            self.inner.reset(split, epoch)
        }

        fn has_split(&self, split: Split) -> bool {
            self.inner.has_split(split)
        }
    }

    #[test]
    fn batches_cover_the_split_then_end() {
        let mut provider = InMemoryProvider::new([(Split::Test, examples(5))], 2, 2, 0);
        assert_eq!(drain(&mut provider, Split::Test), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(provider.next_batch(Split::Test).unwrap(), Batch::EndOfSplit);
    }

    #[test]
    fn training_order_is_seeded_per_epoch() {
        let mut a = InMemoryProvider::new([(Split::Train, examples(20))], 20, 1, 3);
        let mut b = InMemoryProvider::new([(Split::Train, examples(20))], 20, 1, 3);
        a.reset(Split::Train, 1).unwrap();
        b.reset(Split::Train, 1).unwrap();
        let first = drain(&mut a, Split::Train);
        assert_eq!(first, drain(&mut b, Split::Train));

        a.reset(Split::Train, 2).unwrap();
        assert_ne!(first, drain(&mut a, Split::Train));
    }

    #[test]
    fn missing_split_is_an_error() {
        let mut provider = InMemoryProvider::new([(Split::Train, examples(1))], 1, 1, 0);
        assert!(!provider.has_split(Split::Valid));
        assert!(provider.next_batch(Split::Valid).is_err());
    }

    #[test]
    fn retries_recover_from_transient_timeouts() {
        let inner = InMemoryProvider::new([(Split::Train, examples(2))], 2, 1, 0).without_shuffle();
        let mut provider = Flaky { failures: 2, inner };
        let policy = RetryPolicy { max_retries: 3, initial_backoff_ms: 0, max_backoff_ms: 0 };
        let batch = fetch_with_retry(&mut provider, Split::Train, &policy).unwrap();
        assert!(matches!(batch, Batch::Examples(ref b) if b.len() == 2));
    }

    #[test]
    fn retries_are_bounded() {
        let inner = InMemoryProvider::new([(Split::Train, examples(2))], 2, 1, 0);
        let mut provider = Flaky { failures: 10, inner };
        let policy = RetryPolicy { max_retries: 2, initial_backoff_ms: 0, max_backoff_ms: 0 };
        let err = fetch_with_retry(&mut provider, Split::Train, &policy).unwrap_err();
        assert!(matches!(err, TrainError::ProviderTimeout { attempts: 3, .. }));
    }
}
