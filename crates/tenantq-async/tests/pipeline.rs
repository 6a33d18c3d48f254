use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tenantq_async::{
    BufferConfig, CancellationToken, Dispatcher, DispatcherConfig, FairBuffer, MemorySource,
    Message, MessageProcessor, MessageSource, NotAdmittedHandling, Populator, PopulatorConfig,
    ProcessError, SourceError, TenantCapacityPolicy, TenantId, extract_tenant_id,
};

const DEADLINE: Duration = Duration::from_secs(5);

fn payload(tenant: i32, seq: u64) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "Tenant_ID": tenant, "seq": seq })).expect("json")
}

fn seq_of(message: &Message) -> u64 {
    serde_json::from_slice::<serde_json::Value>(message.payload())
        .ok()
        .and_then(|v| v.get("seq").and_then(|s| s.as_u64()))
        .unwrap_or(u64::MAX)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(DEADLINE, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within {:?}", DEADLINE);
}

#[derive(Default)]
struct RecordingProcessor {
    active: Mutex<HashMap<TenantId, usize>>,
    max_per_tenant: AtomicUsize,
    active_total: AtomicUsize,
    max_total: AtomicUsize,
    order: Mutex<Vec<(i32, u64)>>,
    fail_once: Mutex<HashSet<u64>>,
    panic_once: Mutex<HashSet<u64>>,
    hold_until_cancel: AtomicBool,
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let tenant = extract_tenant_id(message.payload());
        let seq = seq_of(message);
        {
            let mut active = self.active.lock();
            let count = active.entry(tenant).or_insert(0);
            *count += 1;
            self.max_per_tenant.fetch_max(*count, Ordering::SeqCst);
        }
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);

        let interrupted = if self.hold_until_cancel.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            true
        } else {
            tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_millis(10)) => false,
            }
        };

        self.active_total.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.active.lock().get_mut(&tenant) {
            *count -= 1;
        }

        if interrupted {
            return Err(ProcessError::Cancelled);
        }
        if self.panic_once.lock().remove(&seq) {
            panic!("processor blew up on {seq}");
        }
        if self.fail_once.lock().remove(&seq) {
            return Err(ProcessError::failed(format!("transient failure on {seq}")));
        }
        self.order.lock().push((tenant.as_i32(), seq));
        Ok(())
    }
}

struct Pipeline {
    source: Arc<MemorySource>,
    buffer: FairBuffer<Message>,
    processor: Arc<RecordingProcessor>,
    dispatcher: Dispatcher<MemorySource, RecordingProcessor>,
    cancel: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    fn start(
        buffer_config: BufferConfig,
        dispatcher_config: DispatcherConfig,
        processor: RecordingProcessor,
        source: MemorySource,
    ) -> Self {
        let source = Arc::new(source);
        let buffer = FairBuffer::new(buffer_config);
        let processor = Arc::new(processor);
        let dispatcher = Dispatcher::new(
            buffer.clone(),
            Arc::clone(&source),
            Arc::clone(&processor),
            dispatcher_config,
        );
        let populator = Populator::new(
            buffer.clone(),
            Arc::clone(&source),
            PopulatorConfig::default(),
        );
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        {
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { populator.run(cancel).await }));
        }
        {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { dispatcher.run(cancel).await }));
        }

        Self {
            source,
            buffer,
            processor,
            dispatcher,
            cancel,
            handles,
        }
    }

    async fn shutdown(self) -> (Arc<MemorySource>, Arc<RecordingProcessor>) {
        self.cancel.cancel();
        for handle in self.handles {
            tokio::time::timeout(DEADLINE, handle)
                .await
                .expect("component should stop promptly")
                .expect("join");
        }
        (self.source, self.processor)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drains_three_tenants_fairly_within_limits() {
    let pipeline = Pipeline::start(
        BufferConfig {
            max_total: 10,
            max_per_tenant: 4,
            on_tenant_capacity: TenantCapacityPolicy::Wait,
        },
        DispatcherConfig {
            max_concurrent_handlers: 2,
            max_concurrent_handlers_per_tenant: 1,
        },
        RecordingProcessor::default(),
        MemorySource::new(Duration::from_secs(60)),
    );

    for seq in 0..4 {
        for tenant in 1..=3 {
            pipeline
                .source
                .publish(payload(tenant, seq), HashMap::new())
                .expect("publish");
        }
    }

    let source = Arc::clone(&pipeline.source);
    wait_until(|| source.acknowledged_count() == 12).await;
    assert!(pipeline.buffer.is_empty());
    assert_eq!(pipeline.dispatcher.stats().processed, 12);
    let dispatcher = pipeline.dispatcher.clone();
    wait_until(|| dispatcher.in_flight_total() == 0).await;

    let (source, processor) = pipeline.shutdown().await;
    assert_eq!(source.outstanding_len(), 0);
    assert_eq!(processor.max_per_tenant.load(Ordering::SeqCst), 1);
    assert!(processor.max_total.load(Ordering::SeqCst) <= 2);

    let order = processor.order.lock().clone();
    for tenant in 1..=3 {
        let seqs: Vec<u64> = order
            .iter()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3], "tenant {tenant} order");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_message_is_requeued_and_redelivered() {
    let processor = RecordingProcessor::default();
    processor.fail_once.lock().insert(1);
    let pipeline = Pipeline::start(
        BufferConfig::default(),
        DispatcherConfig::default(),
        processor,
        MemorySource::with_delays(Duration::from_secs(60), Duration::from_millis(20)),
    );

    for seq in 0..3 {
        pipeline
            .source
            .publish(payload(5, seq), HashMap::new())
            .expect("publish");
    }

    let source = Arc::clone(&pipeline.source);
    wait_until(|| source.acknowledged_count() == 3).await;
    assert_eq!(pipeline.source.requeued_count(), 1);
    assert_eq!(pipeline.dispatcher.stats().failed, 1);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processor_panic_does_not_stop_the_pool() {
    let processor = RecordingProcessor::default();
    processor.panic_once.lock().insert(0);
    let pipeline = Pipeline::start(
        BufferConfig::default(),
        DispatcherConfig {
            max_concurrent_handlers: 1,
            max_concurrent_handlers_per_tenant: 1,
        },
        processor,
        MemorySource::with_delays(Duration::from_secs(60), Duration::from_millis(20)),
    );

    for seq in 0..2 {
        pipeline
            .source
            .publish(payload(8, seq), HashMap::new())
            .expect("publish");
    }

    let source = Arc::clone(&pipeline.source);
    wait_until(|| source.acknowledged_count() == 2).await;
    let stats = pipeline.dispatcher.stats();
    assert_eq!(stats.panics, 1);
    assert_eq!(stats.failed, 1);
    let dispatcher = pipeline.dispatcher.clone();
    wait_until(|| dispatcher.in_flight(TenantId::from(8)) == 0).await;
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_leaves_in_progress_message_outstanding() {
    let processor = RecordingProcessor::default();
    processor.hold_until_cancel.store(true, Ordering::SeqCst);
    let pipeline = Pipeline::start(
        BufferConfig::default(),
        DispatcherConfig::default(),
        processor,
        MemorySource::new(Duration::from_secs(60)),
    );
    pipeline
        .source
        .publish(payload(2, 0), HashMap::new())
        .expect("publish");

    let processor = Arc::clone(&pipeline.processor);
    let dispatcher = pipeline.dispatcher.clone();
    wait_until(|| {
        processor.active_total.load(Ordering::SeqCst) == 1 && dispatcher.in_flight_total() == 1
    })
    .await;

    let (source, processor) = pipeline.shutdown().await;
    assert_eq!(source.acknowledged_count(), 0);
    assert_eq!(source.requeued_count(), 0);
    assert_eq!(source.outstanding_len(), 1);
    assert!(processor.order.lock().is_empty());
    assert_eq!(dispatcher.in_flight_total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn populator_resolves_refused_messages_when_configured() {
    for (policy, handling, expect_acked, expect_requeued) in [
        (TenantCapacityPolicy::Accept, NotAdmittedHandling::Resolve, 1, 0),
        (TenantCapacityPolicy::Skip, NotAdmittedHandling::Resolve, 0, 1),
        (TenantCapacityPolicy::Skip, NotAdmittedHandling::Leave, 0, 0),
    ] {
        let source = Arc::new(MemorySource::new(Duration::from_secs(60)));
        let buffer = FairBuffer::new(BufferConfig {
            max_total: 10,
            max_per_tenant: 1,
            on_tenant_capacity: policy,
        });
        let populator = Arc::new(Populator::new(
            buffer.clone(),
            Arc::clone(&source),
            PopulatorConfig {
                not_admitted: handling,
            },
        ));
        let cancel = CancellationToken::new();
        let runner = {
            let populator = Arc::clone(&populator);
            let cancel = cancel.clone();
            tokio::spawn(async move { populator.run(cancel).await })
        };

        source.publish(payload(4, 0), HashMap::new()).expect("publish");
        source.publish(payload(4, 1), HashMap::new()).expect("publish");
        wait_until(|| populator.stats().received == 2).await;
        wait_until(|| {
            source.acknowledged_count() == expect_acked
                && source.requeued_count() == expect_requeued
        })
        .await;

        assert_eq!(buffer.len(), 1);
        assert_eq!(populator.stats().not_admitted, 1);
        let expected_outstanding = (2 - expect_acked - expect_requeued) as usize;
        assert_eq!(source.outstanding_len(), expected_outstanding);

        cancel.cancel();
        tokio::time::timeout(DEADLINE, runner)
            .await
            .expect("populator should stop")
            .expect("join");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_message_left_alone_returns_after_visibility_timeout() {
    let source = Arc::new(MemorySource::new(Duration::from_millis(300)));
    let buffer = FairBuffer::new(BufferConfig {
        max_total: 10,
        max_per_tenant: 1,
        on_tenant_capacity: TenantCapacityPolicy::Skip,
    });
    let processor = Arc::new(RecordingProcessor::default());
    let populator = Arc::new(Populator::new(
        buffer.clone(),
        Arc::clone(&source),
        PopulatorConfig {
            not_admitted: NotAdmittedHandling::Leave,
        },
    ));
    let cancel = CancellationToken::new();
    let populating = {
        let populator = Arc::clone(&populator);
        let cancel = cancel.clone();
        tokio::spawn(async move { populator.run(cancel).await })
    };

    source.publish(payload(4, 0), HashMap::new()).expect("publish");
    source.publish(payload(4, 1), HashMap::new()).expect("publish");
    wait_until(|| populator.stats().not_admitted == 1).await;
    assert_eq!(buffer.len(), 1);
    assert_eq!(source.outstanding_len(), 2);

    // Consumers start only after the refusal so the tenant queue was full.
    let dispatcher = Dispatcher::new(
        buffer.clone(),
        Arc::clone(&source),
        Arc::clone(&processor),
        DispatcherConfig::default(),
    );
    let dispatching = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    wait_until(|| source.acknowledged_count() == 2).await;
    assert_eq!(source.expired_count(), 1);
    assert_eq!(source.outstanding_len(), 0);
    assert_eq!(*processor.order.lock(), vec![(4, 0), (4, 1)]);

    cancel.cancel();
    for handle in [populating, dispatching] {
        tokio::time::timeout(DEADLINE, handle)
            .await
            .expect("component should stop promptly")
            .expect("join");
    }
}

/// Source whose first acknowledgment panics.
struct AckPanicsOnce {
    inner: MemorySource,
    panicked: AtomicBool,
}

#[async_trait]
impl MessageSource for AckPanicsOnce {
    fn messages(&self) -> BoxStream<'static, Message> {
        self.inner.messages()
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), SourceError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("acknowledge blew up");
        }
        self.inner.acknowledge(message).await
    }

    async fn requeue(&self, message: &Message) -> Result<(), SourceError> {
        self.inner.requeue(message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_loop_survives_panic_outside_processor() {
    let memory = MemorySource::new(Duration::from_secs(60));
    let source = Arc::new(AckPanicsOnce {
        inner: memory.clone(),
        panicked: AtomicBool::new(false),
    });
    let buffer = FairBuffer::new(BufferConfig::default());
    let dispatcher = Dispatcher::new(
        buffer.clone(),
        Arc::clone(&source),
        Arc::new(RecordingProcessor::default()),
        DispatcherConfig {
            max_concurrent_handlers: 1,
            max_concurrent_handlers_per_tenant: 1,
        },
    );
    let populator = Populator::new(buffer.clone(), Arc::clone(&source), PopulatorConfig::default());
    let cancel = CancellationToken::new();
    let handles = [
        {
            let cancel = cancel.clone();
            tokio::spawn(async move { populator.run(cancel).await })
        },
        {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.run(cancel).await })
        },
    ];

    for seq in 0..3 {
        memory.publish(payload(9, seq), HashMap::new()).expect("publish");
    }

    wait_until(|| memory.acknowledged_count() == 2 && dispatcher.in_flight_total() == 0).await;
    let stats = dispatcher.stats();
    assert_eq!(stats.panics, 1);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.failed, 0);
    assert!(buffer.is_empty());
    // The message whose acknowledgment panicked waits for its visibility timeout.
    assert_eq!(memory.outstanding_len(), 1);

    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(DEADLINE, handle)
            .await
            .expect("component should stop promptly")
            .expect("join");
    }
}
