use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::error::{Result, TrainError};
use crate::example::{Batch, Split};
use crate::provider::DatasetProvider;

enum Request {
    Next(Split),
    Reset(Split, usize),
}

enum Response {
    Batch(Split, Result<Batch>),
    Reset(Result<()>),
}

enum Received {
    Response(Response),
    TimedOut,
    Closed,
}

/// Runs a provider on a blocking worker of the tokio runtime and keeps up
/// to `depth` batches per split in flight. Requests are served strictly in
/// order, so batches come back in the sequence the inner provider produced
/// them.
///
/// A slow fetch surfaces as `ProviderTimeout`; the request stays in flight
/// and the next `next_batch` call for that split waits for the same batch.
/// Must be driven from outside async code (e.g. a `spawn_blocking` task).
pub struct PrefetchProvider {
    runtime: Handle,
    requests: Option<UnboundedSender<Request>>,
    responses: UnboundedReceiver<Response>,
    ready: HashMap<Split, VecDeque<Result<Batch>>>,
    in_flight: HashMap<Split, usize>,
    exhausted: HashSet<Split>,
    splits: HashSet<Split>,
    depth: usize,
    timeout: Option<Duration>,
}

impl PrefetchProvider {
    pub fn spawn<P>(mut inner: P, depth: usize, timeout: Option<Duration>, runtime: Handle) -> Self
    where
        P: DatasetProvider + Send + 'static,
    {
        let splits = [Split::Train, Split::Valid, Split::Test]
            .into_iter()
            .filter(|&s| inner.has_split(s))
            .collect();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Request>();
        let (response_tx, response_rx) = mpsc::unbounded_channel::<Response>();

        // Ends once the request sender is dropped.
        runtime.spawn_blocking(move || {
            while let Some(request) = request_rx.blocking_recv() {
                let response = match request {
                    Request::Next(split) => Response::Batch(split, inner.next_batch(split)),
                    Request::Reset(split, epoch) => Response::Reset(inner.reset(split, epoch)),
                };
                if response_tx.send(response).is_err() {
                    break;
                }
            }
            log::debug!("prefetch worker stopped");
        });

        Self {
            runtime,
            requests: Some(request_tx),
            responses: response_rx,
            ready: HashMap::new(),
            in_flight: HashMap::new(),
            exhausted: HashSet::new(),
            splits,
            depth: depth.max(1),
            timeout,
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .as_ref()
            .and_then(|tx| tx.send(request).ok())
            .ok_or_else(|| TrainError::Provider("prefetch worker is gone".to_string()))
    }

    fn top_up(&mut self, split: Split) -> Result<()> {
        if self.exhausted.contains(&split) {
            return Ok(());
        }
        let buffered = self.ready.get(&split).map_or(0, VecDeque::len);
        let mut in_flight = self.in_flight.get(&split).copied().unwrap_or(0);
        while buffered + in_flight < self.depth {
            self.send(Request::Next(split))?;
            in_flight += 1;
        }
        self.in_flight.insert(split, in_flight);
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Received {
        let response = match timeout {
            Some(limit) => {
                let responses = &mut self.responses;
                match self.runtime.block_on(tokio::time::timeout(limit, responses.recv())) {
                    Ok(response) => response,
                    Err(_) => return Received::TimedOut,
                }
            }
            None => self.responses.blocking_recv(),
        };
        response.map_or(Received::Closed, Received::Response)
    }

    fn store(&mut self, split: Split, batch: Result<Batch>) {
        if let Some(count) = self.in_flight.get_mut(&split) {
            *count = count.saturating_sub(1);
        }
        if matches!(batch, Ok(Batch::EndOfSplit)) {
            self.exhausted.insert(split);
        }
        self.ready.entry(split).or_default().push_back(batch);
    }
}

impl DatasetProvider for PrefetchProvider {
    fn next_batch(&mut self, split: Split) -> Result<Batch> {
        loop {
            if let Some(batch) = self.ready.get_mut(&split).and_then(VecDeque::pop_front) {
                self.top_up(split)?;
                return batch;
            }
            if self.exhausted.contains(&split) {
                return Ok(Batch::EndOfSplit);
            }
            self.top_up(split)?;
            match self.receive(self.timeout) {
                Received::Response(Response::Batch(s, batch)) => self.store(s, batch),
                Received::Response(Response::Reset(_)) => {
                    return Err(TrainError::Provider("unexpected reset acknowledgement".to_string()))
                }
                Received::TimedOut => return Err(TrainError::ProviderTimeout { split, attempts: 1 }),
                Received::Closed => {
                    return Err(TrainError::Provider("prefetch worker disconnected".to_string()))
                }
            }
        }
    }

    /// Blocks until every in-flight request for `split` has been answered
    /// and dropped, then rewinds the inner provider.
    fn reset(&mut self, split: Split, epoch: usize) -> Result<()> {
        self.send(Request::Reset(split, epoch))?;
        loop {
            match self.receive(None) {
                Received::Response(Response::Batch(s, batch)) => self.store(s, batch),
                Received::Response(Response::Reset(result)) => {
                    self.ready.remove(&split);
                    self.in_flight.remove(&split);
                    self.exhausted.remove(&split);
                    return result;
                }
                Received::TimedOut | Received::Closed => {
                    return Err(TrainError::Provider("prefetch worker disconnected".to_string()))
                }
            }
        }
    }

    fn has_split(&self, split: Split) -> bool {
        self.splits.contains(&split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::examples;
    use crate::provider::InMemoryProvider;
    use std::thread;
    use tokio::runtime::{Builder, Runtime};

    fn runtime() -> Runtime {
        Builder::new_multi_thread().worker_threads(1).enable_all().build().unwrap()
    }

    fn ids(batch: Batch) -> Vec<usize> {
        match batch {
            Batch::Examples(b) => b.iter().map(|e| e.id).collect(),
            Batch::EndOfSplit => Vec::new(),
        }
    }

    /// Sleeps before the first batch of every pass.
    struct SlowStart {
        inner: InMemoryProvider,
        delay: Duration,
        first: bool,
    }

    impl DatasetProvider for SlowStart {
        fn next_batch(&mut self, split: Split) -> Result<Batch> {
            if self.first {
                self.first = false;
                thread::sleep(self.delay);
            }
            self.inner.next_batch(split)
        }

        fn reset(&mut self, split: Split, epoch: usize) -> Result<()> {
            self.first = true;
            self.inner.reset(split, epoch)
        }

        fn has_split(&self, split: Split) -> bool {
            self.inner.has_split(split)
        }
    }

    #[test]
    fn prefetched_batches_keep_their_order() {
        let inner = InMemoryProvider::new([(Split::Train, examples(7)), (Split::Test, examples(3))], 2, 3, 0)
            .without_shuffle();
        let rt = runtime();
        let mut provider = PrefetchProvider::spawn(inner, 3, None, rt.handle().clone());

        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![0, 1]);
        // Switching splits mid-pass must not lose prefetched training batches.
        assert_eq!(ids(provider.next_batch(Split::Test).unwrap()), vec![0, 1, 2]);
        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![2, 3]);
        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![4, 5]);
        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![6]);
        assert_eq!(provider.next_batch(Split::Train).unwrap(), Batch::EndOfSplit);

        provider.reset(Split::Train, 0).unwrap();
        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![0, 1]);
    }

    #[test]
    fn timeout_then_retry_waits_for_the_same_batch() {
        let inner = InMemoryProvider::new([(Split::Train, examples(4))], 2, 2, 0).without_shuffle();
        let slow = SlowStart {
            inner,
            delay: Duration::from_millis(300),
            first: true,
        };
        let rt = runtime();
        let mut provider = PrefetchProvider::spawn(slow, 1, Some(Duration::from_millis(20)), rt.handle().clone());

        let err = provider.next_batch(Split::Train).unwrap_err();
        assert!(err.is_retryable());

        let mut batch = provider.next_batch(Split::Train);
        while matches!(batch, Err(TrainError::ProviderTimeout { .. })) {
            batch = provider.next_batch(Split::Train);
        }
        assert_eq!(ids(batch.unwrap()), vec![0, 1]);
        assert_eq!(ids(provider.next_batch(Split::Train).unwrap()), vec![2, 3]);
    }
}
