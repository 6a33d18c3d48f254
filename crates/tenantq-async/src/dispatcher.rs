use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tenantq_core::{Message, TenantId};

use crate::buffer::FairBuffer;
use crate::error::{Cancelled, ProcessError};
use crate::processor::MessageProcessor;
use crate::source::MessageSource;

const LOOP_ERROR_PAUSE: Duration = Duration::from_millis(200);

/// Dispatcher concurrency limits. Both are clamped to at least 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of parallel consumer loops.
    pub max_concurrent_handlers: usize,
    /// Maximum simultaneous in-flight messages for one tenant.
    pub max_concurrent_handlers_per_tenant: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 4,
            max_concurrent_handlers_per_tenant: 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Messages processed successfully.
    pub processed: u64,
    /// Messages whose processing failed and were handed back for redelivery.
    pub failed: u64,
    pub acknowledge_failures: u64,
    pub requeue_failures: u64,
    /// Panics caught in processors or consumer loops.
    pub panics: u64,
}

#[derive(Default)]
struct DispatchCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    acknowledge_failures: AtomicU64,
    requeue_failures: AtomicU64,
    panics: AtomicU64,
}

/// Per-tenant in-flight counts.
struct InFlightTable {
    counts: Mutex<HashMap<TenantId, usize>>,
    per_tenant_limit: usize,
}

impl InFlightTable {
    fn new(per_tenant_limit: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            per_tenant_limit,
        }
    }

    /// Eligibility check and reservation in one step: a `true` answer has
    /// already taken the tenant's slot.
    fn try_reserve(&self, tenant: TenantId) -> bool {
        let mut counts = self.counts.lock();
        let current = counts.entry(tenant).or_insert(0);
        if *current < self.per_tenant_limit {
            *current += 1;
            true
        } else {
            false
        }
    }

    fn release(&self, tenant: TenantId) {
        let mut counts = self.counts.lock();
        match counts.get_mut(&tenant) {
            Some(current) if *current > 1 => *current -= 1,
            _ => {
                counts.remove(&tenant);
            }
        }
    }

    fn get(&self, tenant: TenantId) -> usize {
        self.counts.lock().get(&tenant).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

/// Releases a tenant's in-flight slot and wakes parked consumers, on every
/// exit path including unwinding.
struct InFlightGuard<'a> {
    table: &'a InFlightTable,
    buffer: &'a FairBuffer<Message>,
    tenant: TenantId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.tenant);
        self.buffer.notify_eligibility_changed();
    }
}

enum LoopStep {
    Continue,
    Stop,
}

struct DispatchShared<S, P> {
    buffer: FairBuffer<Message>,
    source: Arc<S>,
    processor: Arc<P>,
    in_flight: InFlightTable,
    handlers: usize,
    per_tenant: usize,
    stats: DispatchCounters,
}

/// Pool of consumer loops draining a [`FairBuffer`] under overall and
/// per-tenant concurrency limits.
pub struct Dispatcher<S, P> {
    shared: Arc<DispatchShared<S, P>>,
}

impl<S, P> Clone for Dispatcher<S, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: MessageSource, P: MessageProcessor> Dispatcher<S, P> {
    pub fn new(
        buffer: FairBuffer<Message>,
        source: Arc<S>,
        processor: Arc<P>,
        config: DispatcherConfig,
    ) -> Self {
        let handlers = config.max_concurrent_handlers.max(1);
        let per_tenant = config.max_concurrent_handlers_per_tenant.max(1);
        Self {
            shared: Arc::new(DispatchShared {
                buffer,
                source,
                processor,
                in_flight: InFlightTable::new(per_tenant),
                handlers,
                per_tenant,
                stats: DispatchCounters::default(),
            }),
        }
    }

    /// Starts the consumer loops and waits until every one of them has
    /// exited, which happens once `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            overall = self.shared.handlers,
            per_tenant = self.shared.per_tenant,
            "dispatcher starting"
        );

        let mut consumers = JoinSet::new();
        for worker in 0..self.shared.handlers {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            consumers.spawn(async move { shared.consume_loop(worker, cancel).await });
        }

        while let Some(result) = consumers.join_next().await {
            if let Err(err) = result {
                error!(error = %err, "consumer loop terminated abnormally");
            }
        }

        info!("dispatcher stopped");
    }

    pub fn in_flight(&self, tenant: TenantId) -> usize {
        self.shared.in_flight.get(tenant)
    }

    pub fn in_flight_total(&self) -> usize {
        self.shared.in_flight.total()
    }

    pub fn stats(&self) -> DispatcherStats {
        let stats = &self.shared.stats;
        DispatcherStats {
            processed: stats.processed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            acknowledge_failures: stats.acknowledge_failures.load(Ordering::Relaxed),
            requeue_failures: stats.requeue_failures.load(Ordering::Relaxed),
            panics: stats.panics.load(Ordering::Relaxed),
        }
    }
}

impl<S: MessageSource, P: MessageProcessor> DispatchShared<S, P> {
    async fn consume_loop(&self, worker: usize, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match AssertUnwindSafe(self.consume_one(&cancel))
                .catch_unwind()
                .await
            {
                Ok(LoopStep::Continue) => {}
                Ok(LoopStep::Stop) => break,
                Err(panic) => {
                    self.stats.panics.fetch_add(1, Ordering::Relaxed);
                    error!(
                        worker,
                        panic = %panic_message(&*panic),
                        "unexpected error in consumer loop"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(LOOP_ERROR_PAUSE) => {}
                    }
                }
            }
        }
        debug!(worker, "consumer loop stopped");
    }

    async fn consume_one(&self, cancel: &CancellationToken) -> LoopStep {
        let in_flight = &self.in_flight;
        let entry = match self
            .buffer
            .dequeue_next_eligible(|tenant| in_flight.try_reserve(tenant), cancel)
            .await
        {
            Ok(entry) => entry,
            Err(Cancelled) => return LoopStep::Stop,
        };
        let _slot = InFlightGuard {
            table: in_flight,
            buffer: &self.buffer,
            tenant: entry.tenant,
        };

        let tenant = entry.tenant;
        let message = &entry.item;
        debug!(%tenant, message_id = message.id(), "processing message");

        let outcome = match AssertUnwindSafe(self.processor.process(message, cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                Err(ProcessError::failed(format!(
                    "processor panicked: {}",
                    panic_message(&*panic)
                )))
            }
        };

        match outcome {
            Ok(()) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.source.acknowledge(message).await {
                    self.stats
                        .acknowledge_failures
                        .fetch_add(1, Ordering::Relaxed);
                    error!(%tenant, message_id = message.id(), error = %err, "failed to acknowledge message");
                }
                LoopStep::Continue
            }
            Err(_) if cancel.is_cancelled() => {
                debug!(%tenant, message_id = message.id(), "processing interrupted by shutdown");
                LoopStep::Stop
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(%tenant, message_id = message.id(), error = %err, "error processing message");
                if let Err(inner) = self.source.requeue(message).await {
                    self.stats.requeue_failures.fetch_add(1, Ordering::Relaxed);
                    error!(%tenant, message_id = message.id(), error = %inner, "failed to requeue message");
                }
                LoopStep::Continue
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
