use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use tenantq_async::{
    AdmitResult, BufferConfig, BufferedEntry, FairBuffer, TenantCapacityPolicy, TenantId,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let run_seconds = 5u64;
    let worker_count = 4usize;
    let cold_tenants = 40i32;

    let buffer = FairBuffer::new(BufferConfig {
        max_total: 2_000,
        max_per_tenant: 500,
        on_tenant_capacity: TenantCapacityPolicy::Skip,
    });

    let cancel = CancellationToken::new();
    let produced_total = Arc::new(AtomicU64::new(0));
    let dropped_total = Arc::new(AtomicU64::new(0));
    let mut producers = Vec::new();
    let mut workers = Vec::new();

    let hot_tenant = TenantId::from(1);
    producers.push(spawn_producer(
        buffer.clone(),
        cancel.clone(),
        Arc::clone(&produced_total),
        Arc::clone(&dropped_total),
        hot_tenant,
        Duration::ZERO,
    ));

    for tenant_id in 2..(cold_tenants + 2) {
        producers.push(spawn_producer(
            buffer.clone(),
            cancel.clone(),
            Arc::clone(&produced_total),
            Arc::clone(&dropped_total),
            TenantId::from(tenant_id),
            Duration::from_millis(25),
        ));
    }

    for _ in 0..worker_count {
        workers.push(spawn_worker(buffer.clone(), cancel.clone()));
    }

    println!(
        "bench: hot tenant vs {} tenants ({} workers, {}s)",
        cold_tenants, worker_count, run_seconds
    );
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(run_seconds)).await;
    let elapsed = start.elapsed().as_secs_f64();

    cancel.cancel();
    for handle in producers {
        if let Err(err) = handle.await {
            eprintln!("producer task failed: {err}");
        }
    }
    let mut served: HashMap<TenantId, u64> = HashMap::new();
    for handle in workers {
        match handle.await {
            Ok(local) => {
                for (tenant, count) in local {
                    *served.entry(tenant).or_insert(0) += count;
                }
            }
            Err(err) => eprintln!("worker task failed: {err}"),
        }
    }

    let stats = buffer.stats();
    let avg_queue_time_ms = if stats.queue_time_samples > 0 {
        let avg_ns = stats.queue_time_sum_ns as f64 / stats.queue_time_samples as f64;
        avg_ns / 1_000_000.0
    } else {
        0.0
    };
    let throughput = if elapsed > 0.0 {
        stats.dequeued as f64 / elapsed
    } else {
        0.0
    };

    let hot_served = served.get(&hot_tenant).copied().unwrap_or(0);
    let cold_served: u64 = served
        .iter()
        .filter(|(tenant, _)| **tenant != hot_tenant)
        .map(|(_, count)| *count)
        .sum();
    let cold_starved = (2..(cold_tenants + 2))
        .filter(|id| !served.contains_key(&TenantId::from(*id)))
        .count();
    let hot_share = if stats.dequeued > 0 {
        hot_served as f64 * 100.0 / stats.dequeued as f64
    } else {
        0.0
    };

    println!(
        "stats: admitted={} dequeued={} skipped={} buffered={}",
        stats.admitted, stats.dequeued, stats.not_admitted_skip, stats.buffered
    );
    println!(
        "derived: throughput={:.1} ops/s avg_queue_time_ms={:.3}",
        throughput, avg_queue_time_ms
    );
    println!(
        "served: hot={} ({:.1}%) cold={} cold_starved={}",
        hot_served, hot_share, cold_served, cold_starved
    );
    println!(
        "produced_total={} dropped_total={}",
        produced_total.load(Ordering::Relaxed),
        dropped_total.load(Ordering::Relaxed)
    );
}

fn spawn_producer(
    buffer: FairBuffer<u64>,
    cancel: CancellationToken,
    produced_total: Arc<AtomicU64>,
    dropped_total: Arc<AtomicU64>,
    tenant: TenantId,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = 0u64;
        while !cancel.is_cancelled() {
            seq += 1;
            match buffer.admit(BufferedEntry::new(tenant, seq), &cancel).await {
                Ok(AdmitResult::Admitted) => {
                    produced_total.fetch_add(1, Ordering::Relaxed);
                }
                Ok(AdmitResult::NotAdmitted(_)) => {
                    produced_total.fetch_add(1, Ordering::Relaxed);
                    dropped_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
        }
    })
}

/// Drains the buffer until cancelled and returns the per-tenant served counts.
fn spawn_worker(
    buffer: FairBuffer<u64>,
    cancel: CancellationToken,
) -> JoinHandle<HashMap<TenantId, u64>> {
    tokio::spawn(async move {
        let mut served: HashMap<TenantId, u64> = HashMap::new();
        while let Ok(entry) = buffer.dequeue_next_eligible(|_| true, &cancel).await {
            *served.entry(entry.tenant).or_insert(0) += 1;
            tokio::task::yield_now().await;
        }
        served
    })
}
