use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use tenantq_async::{MemorySource, Message, MessageProcessor, ProcessError, extract_tenant_id};

use crate::config::{ProcessorConfig, ProducerConfig};

#[derive(Serialize)]
struct SyntheticPayload {
    #[serde(rename = "Tenant_ID")]
    tenant_id: i32,
    sequence: u64,
}

/// Publishes messages for random tenants at a random pace.
pub struct SyntheticProducer {
    source: MemorySource,
    config: ProducerConfig,
}

impl SyntheticProducer {
    pub fn new(source: MemorySource, config: ProducerConfig) -> Self {
        Self { source, config }
    }

    /// Publishes until cancelled, until the configured message count is
    /// reached or until the source closes. Returns the number published.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let mut published = 0u64;

        loop {
            if self.config.messages.is_some_and(|limit| published >= limit) {
                break;
            }

            let (tenant_id, delay) = {
                let mut rng = rand::rng();
                (
                    rng.random_range(self.config.tenant_min..=self.config.tenant_max),
                    Duration::from_millis(
                        rng.random_range(self.config.delay_ms_min..=self.config.delay_ms_max),
                    ),
                )
            };

            let payload = SyntheticPayload {
                tenant_id,
                sequence: published,
            };
            let body = match serde_json::to_vec(&payload) {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "failed to encode synthetic payload, producer stopping");
                    break;
                }
            };
            let headers = HashMap::from([(
                "correlation_id".to_string(),
                Uuid::new_v4().to_string(),
            )]);

            match self.source.publish(body, headers) {
                Ok(message) => {
                    published += 1;
                    debug!(tenant = tenant_id, message_id = message.id(), "published");
                }
                Err(err) => {
                    warn!(error = %err, "source rejected synthetic message, producer stopping");
                    break;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        published
    }
}

/// Processor that sleeps for a random duration and fails at a configured
/// rate.
pub struct SimulatedProcessor {
    config: ProcessorConfig,
}

impl SimulatedProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MessageProcessor for SimulatedProcessor {
    async fn process(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<(), ProcessError> {
        let (work, fail) = {
            let mut rng = rand::rng();
            (
                Duration::from_millis(rng.random_range(self.config.min_ms..=self.config.max_ms)),
                rng.random_bool(self.config.failure_rate.clamp(0.0, 1.0)),
            )
        };
        let tenant = extract_tenant_id(message.payload());
        debug!(%tenant, message_id = message.id(), work_ms = work.as_millis() as u64, "working");

        tokio::select! {
            _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
            _ = tokio::time::sleep(work) => {}
        }

        if fail {
            return Err(ProcessError::failed(format!(
                "simulated failure for tenant {tenant}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tenantq_async::{MessageSource, TenantId};

    fn quick_processor(failure_rate: f64) -> SimulatedProcessor {
        SimulatedProcessor::new(ProcessorConfig {
            min_ms: 1,
            max_ms: 2,
            failure_rate,
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_publishes_requested_count_within_tenant_range() {
        let source = MemorySource::default();
        let producer = SyntheticProducer::new(
            source.clone(),
            ProducerConfig {
                messages: Some(5),
                tenant_min: 3,
                tenant_max: 4,
                delay_ms_min: 0,
                delay_ms_max: 1,
            },
        );

        let published = producer.run(CancellationToken::new()).await;
        assert_eq!(published, 5);

        let messages: Vec<Message> = source.messages().take(5).collect().await;
        for message in &messages {
            let tenant = extract_tenant_id(message.payload());
            assert!(tenant == TenantId::from(3) || tenant == TenantId::from(4));
            assert!(message.header("correlation_id").is_some());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processor_outcome_follows_failure_rate() {
        let source = MemorySource::default();
        let message = source
            .publish(br#"{"Tenant_ID": 1}"#.to_vec(), HashMap::new())
            .expect("publish");
        let cancel = CancellationToken::new();

        let always_ok = quick_processor(0.0);
        assert!(always_ok.process(&message, &cancel).await.is_ok());

        let always_fails = quick_processor(1.0);
        assert!(matches!(
            always_fails.process(&message, &cancel).await,
            Err(ProcessError::Failed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn processor_stops_on_cancellation() {
        let processor = SimulatedProcessor::new(ProcessorConfig {
            min_ms: 10_000,
            max_ms: 10_000,
            failure_rate: 0.0,
        });
        let message = Message::new("m", "t", br#"{"Tenant_ID": 2}"#.to_vec(), HashMap::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            processor.process(&message, &cancel).await,
            Err(ProcessError::Cancelled)
        ));
    }
}
