//! Bounded-concurrency execution of per-item external calls.
//!
//! Each item goes through the same steps:
//!
//! ```text
//! cache hit? --yes--> CACHED
//!    | no
//! prepare --err--> FAILED (nothing charged)
//!    |
//! gate.admit --QuotaExceeded--> PENDING + cancel the batch
//!    |        --other error---> FAILED
//! call --ok--> cache put --> FRESH
//!      --err-> FAILED
//! ```
//!
//! Cancellation only stops new tasks from being spawned. Tasks already
//! running finish their call; a task that reaches admission after the fuse
//! blew leaves its item PENDING.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::Namespace;
use crate::error::AppError;
use crate::models::EnrichmentStatus;
use crate::rate_limit::CallGate;
use crate::traits::{CacheStore, QuotaStore};

/// One kind of external call the scheduler can run over a batch of items.
pub trait BatchTask: Send + Sync + Clone + 'static {
    type Item: Clone + Send + Sync + 'static;
    /// What `call` actually sends, built from an item by `prepare`.
    type Input: Send + Sync + 'static;

    /// Cache namespace holding this task's results.
    fn namespace(&self) -> Namespace;

    fn cache_key(&self, item: &Self::Item) -> String;

    /// Metered service charged for each call.
    fn service(&self) -> &str;

    /// Quota units charged per call.
    fn cost(&self) -> u64;

    /// Build the call input before any quota is spent. May do unmetered
    /// work; items that can never succeed are rejected here.
    fn prepare(
        &self,
        item: &Self::Item,
    ) -> impl Future<Output = Result<Self::Input, AppError>> + Send;

    fn call(&self, input: &Self::Input) -> impl Future<Output = Result<Value, AppError>> + Send;
}

/// Tagged per-item result.
#[derive(Debug)]
pub enum ItemResult {
    Cached(Value),
    Fresh(Value),
    Failed(AppError),
    /// Not attempted because the quota fuse blew.
    Pending,
}

impl ItemResult {
    pub fn status(&self) -> EnrichmentStatus {
        match self {
            ItemResult::Cached(_) => EnrichmentStatus::Cached,
            ItemResult::Fresh(_) => EnrichmentStatus::Fresh,
            ItemResult::Failed(_) => EnrichmentStatus::Failed,
            ItemResult::Pending => EnrichmentStatus::Pending,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ItemResult::Cached(v) | ItemResult::Fresh(v) => Some(v),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AppError> {
        match self {
            ItemResult::Failed(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ItemOutcome {
    /// Position of the item in the submitted slice.
    pub index: usize,
    pub key: String,
    pub result: ItemResult,
}

/// Aggregate of one batch. `results` is in submission order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<ItemOutcome>,
    pub cached: u64,
    pub fresh: u64,
    pub failed: u64,
    pub pending: u64,
    pub quota_exhausted: bool,
}

impl BatchOutcome {
    fn push(&mut self, outcome: ItemOutcome) {
        match outcome.result {
            ItemResult::Cached(_) => self.cached += 1,
            ItemResult::Fresh(_) => self.fresh += 1,
            ItemResult::Failed(_) => self.failed += 1,
            ItemResult::Pending => self.pending += 1,
        }
        self.results.push(outcome);
    }
}

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    Started {
        service: &'a str,
        items: usize,
        concurrency: usize,
    },
    ItemFinished {
        key: &'a str,
        status: EnrichmentStatus,
        error: Option<&'a AppError>,
    },
    QuotaExhausted {
        service: &'a str,
        not_started: usize,
    },
    Finished {
        service: &'a str,
        cached: u64,
        fresh: u64,
        failed: u64,
        pending: u64,
    },
}

/// Trait for receiving batch events (decoupled logging).
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started {
                service,
                items,
                concurrency,
            } => {
                tracing::info!(%service, items, concurrency, "Batch started");
            }
            BatchEvent::ItemFinished { key, status, error } => match error {
                Some(error) => {
                    tracing::warn!(%key, %status, kind = error.kind(), %error, "Item failed")
                }
                None => tracing::debug!(%key, %status, "Item finished"),
            },
            BatchEvent::QuotaExhausted {
                service,
                not_started,
            } => {
                tracing::warn!(%service, not_started, "Quota exhausted, stopping batch");
            }
            BatchEvent::Finished {
                service,
                cached,
                fresh,
                failed,
                pending,
            } => {
                tracing::info!(%service, cached, fresh, failed, pending, "Batch finished");
            }
        }
    }
}

/// Runs batches against a cache and a call gate.
pub struct Scheduler<C, Q> {
    cache: C,
    gate: Arc<CallGate<Q>>,
    concurrency: usize,
}

impl<C: CacheStore, Q: QuotaStore> Scheduler<C, Q> {
    pub fn new(cache: C, gate: Arc<CallGate<Q>>, concurrency: usize) -> Self {
        Self {
            cache,
            gate,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Process `items` with at most `concurrency` tasks in flight.
    ///
    /// Returns once every spawned task has finished. Per-item errors never
    /// fail the batch.
    pub async fn run_batch<T, R>(&self, items: &[T::Item], task: &T, reporter: &R) -> BatchOutcome
    where
        T: BatchTask,
        R: BatchReporter,
    {
        reporter.report(BatchEvent::Started {
            service: task.service(),
            items: items.len(),
            concurrency: self.concurrency,
        });

        let keys: Vec<String> = items.iter().map(|item| task.cache_key(item)).collect();
        let mut results: Vec<Option<ItemResult>> = items.iter().map(|_| None).collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, usize> = HashMap::new();

        for (index, item) in items.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                reporter.report(BatchEvent::QuotaExhausted {
                    service: task.service(),
                    not_started: items.len() - index,
                });
                break;
            };

            let cache = self.cache.clone();
            let gate = self.gate.clone();
            let task = task.clone();
            let item = item.clone();
            let key = keys[index].clone();
            let cancel = cancel.clone();
            let handle = join_set.spawn(async move {
                let result = process_item(&cache, &gate, &task, &item, &key, &cancel).await;
                drop(permit);
                (index, result)
            });
            spawned.insert(handle.id(), index);
        }

        while let Some(joined) = join_set.join_next_with_id().await {
            let (index, result) = match joined {
                Ok((_, pair)) => pair,
                Err(e) => {
                    let Some(&index) = spawned.get(&e.id()) else {
                        tracing::error!(error = %e, "Unknown batch task failed");
                        continue;
                    };
                    tracing::error!(key = %keys[index], error = %e, "Batch task panicked");
                    (
                        index,
                        ItemResult::Failed(AppError::Generic(format!("task panicked: {e}"))),
                    )
                }
            };
            reporter.report(BatchEvent::ItemFinished {
                key: &keys[index],
                status: result.status(),
                error: result.error(),
            });
            results[index] = Some(result);
        }

        let mut outcome = BatchOutcome {
            quota_exhausted: cancel.is_cancelled(),
            ..BatchOutcome::default()
        };
        for (index, (key, result)) in keys.into_iter().zip(results).enumerate() {
            outcome.push(ItemOutcome {
                index,
                key,
                result: result.unwrap_or(ItemResult::Pending),
            });
        }

        reporter.report(BatchEvent::Finished {
            service: task.service(),
            cached: outcome.cached,
            fresh: outcome.fresh,
            failed: outcome.failed,
            pending: outcome.pending,
        });
        outcome
    }
}

async fn process_item<C, Q, T>(
    cache: &C,
    gate: &CallGate<Q>,
    task: &T,
    item: &T::Item,
    key: &str,
    cancel: &CancellationToken,
) -> ItemResult
where
    C: CacheStore,
    Q: QuotaStore,
    T: BatchTask,
{
    let namespace = task.namespace();
    match cache.get(namespace, key).await {
        Ok(Some(entry)) => return ItemResult::Cached(entry.data),
        Ok(None) => {}
        Err(e) => return ItemResult::Failed(e),
    }

    let input = match task.prepare(item).await {
        Ok(input) => input,
        Err(e) => return ItemResult::Failed(e),
    };
    if cancel.is_cancelled() {
        return ItemResult::Pending;
    }

    let service = task.service();
    if let Err(e) = gate.admit(service, task.cost()).await {
        if e.is_quota_exceeded() {
            cancel.cancel();
            return ItemResult::Pending;
        }
        return ItemResult::Failed(e);
    }

    let result = task.call(&input).await;
    gate.record_outcome(service, &result);
    match result {
        Ok(value) => {
            if let Err(e) = cache.put(namespace, key, &value).await {
                tracing::warn!(%namespace, %key, error = %e, "Failed to cache result");
            }
            ItemResult::Fresh(value)
        }
        Err(e) if e.is_quota_exceeded() => {
            cancel.cancel();
            ItemResult::Pending
        }
        Err(e) => ItemResult::Failed(e),
    }
}
