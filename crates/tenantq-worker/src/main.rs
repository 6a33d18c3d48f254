use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tenantq_async::{Dispatcher, FairBuffer, MemorySource, Populator, prometheus};

mod config;
mod synthetic;

use config::WorkerConfig;
use synthetic::{SimulatedProcessor, SyntheticProducer};

const DEFAULT_FILTER: &str = "tenantq_async=info,tenantq_worker=info,warn";
const DEBUG_FILTER: &str = "tenantq_async=debug,tenantq_worker=debug,info";

#[derive(Parser, Debug)]
#[command(name = "tenantq-worker")]
#[command(about = "Tenant-fair queue worker fed by synthetic traffic")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Print buffer metrics in Prometheus text format on exit
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match WorkerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    run(config, &cli).await;
    ExitCode::SUCCESS
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new(DEBUG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .init();
}

async fn run(config: WorkerConfig, cli: &Cli) {
    let source = MemorySource::with_delays(
        config.source.visibility_timeout(),
        config.source.requeue_delay(),
    );
    let shared_source = Arc::new(source.clone());
    let buffer = FairBuffer::new(config.buffering.buffer.clone());
    let processor = Arc::new(SimulatedProcessor::new(config.processor.clone()));

    let dispatcher = Dispatcher::new(
        buffer.clone(),
        Arc::clone(&shared_source),
        Arc::clone(&processor),
        config.buffering.dispatcher.clone(),
    );
    let populator = Arc::new(Populator::new(
        buffer.clone(),
        Arc::clone(&shared_source),
        config.populator.clone(),
    ));
    let producer = SyntheticProducer::new(source.clone(), config.producer.clone());

    info!(
        max_buffered = buffer.max_total(),
        max_per_tenant = buffer.max_per_tenant(),
        policy = %buffer.policy(),
        not_admitted = ?config.populator.not_admitted,
        "worker starting"
    );

    let cancel = CancellationToken::new();
    let started = Instant::now();

    let producer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(cancel).await })
    };
    let populator_task = {
        let populator = Arc::clone(&populator);
        let cancel = cancel.clone();
        tokio::spawn(async move { populator.run(cancel).await })
    };
    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    wait_for_shutdown(cli.run_for).await;
    info!("shutting down");
    cancel.cancel();

    let published = match producer_task.await {
        Ok(published) => published,
        Err(err) => {
            warn!(error = %err, "producer task failed");
            0
        }
    };
    if let Err(err) = populator_task.await {
        warn!(error = %err, "populator task failed");
    }
    if let Err(err) = dispatcher_task.await {
        warn!(error = %err, "dispatcher task failed");
    }
    source.close();

    let elapsed = started.elapsed().as_secs_f64();
    let buffer_stats = buffer.stats();
    let dispatch = dispatcher.stats();
    let populated = populator.stats();
    let avg_queue_time_ms = if buffer_stats.queue_time_samples > 0 {
        buffer_stats.queue_time_sum_ns as f64 / buffer_stats.queue_time_samples as f64 / 1_000_000.0
    } else {
        0.0
    };
    let throughput = if elapsed > 0.0 {
        dispatch.processed as f64 / elapsed
    } else {
        0.0
    };

    println!("run: {:.1}s published={}", elapsed, published);
    println!(
        "populator: received={} admitted={} not_admitted={}",
        populated.received, populated.admitted, populated.not_admitted
    );
    println!(
        "dispatcher: processed={} failed={} ack_failures={} requeue_failures={} panics={}",
        dispatch.processed,
        dispatch.failed,
        dispatch.acknowledge_failures,
        dispatch.requeue_failures,
        dispatch.panics
    );
    println!(
        "source: acknowledged={} requeued={} expired={} outstanding={}",
        source.acknowledged_count(),
        source.requeued_count(),
        source.expired_count(),
        source.outstanding_len()
    );
    println!(
        "buffer: buffered={} active_tenants={} throughput={:.1} msg/s avg_queue_time_ms={:.3}",
        buffer_stats.buffered, buffer_stats.active_tenants, throughput, avg_queue_time_ms
    );

    if cli.metrics {
        print!("{}", prometheus::render_stats(&buffer_stats, "tenantq"));
    }
}

async fn wait_for_shutdown(run_for: Option<u64>) {
    let deadline = async {
        match run_for {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::pin!(deadline);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for Ctrl-C");
                deadline.await;
            }
        }
        _ = &mut deadline => {}
    }
}
