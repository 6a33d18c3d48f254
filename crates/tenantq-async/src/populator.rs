use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tenantq_core::{
    AdmitResult, BufferedEntry, Message, NotAdmittedReason, TenantId, extract_tenant_id,
};

use crate::buffer::FairBuffer;
use crate::error::Cancelled;
use crate::source::MessageSource;

/// What the populator does with a message the tenant capacity policy
/// refused to buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotAdmittedHandling {
    /// Do nothing; the source's visibility timeout redelivers the message.
    #[default]
    Leave,
    /// Acknowledge on `Accept`, requeue on `Skip`.
    Resolve,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulatorConfig {
    pub not_admitted: NotAdmittedHandling,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PopulatorStats {
    pub received: u64,
    pub admitted: u64,
    pub not_admitted: u64,
}

#[derive(Default)]
struct PopulatorCounters {
    received: AtomicU64,
    admitted: AtomicU64,
    not_admitted: AtomicU64,
}

/// Single sequential loop moving messages from a [`MessageSource`] into a
/// [`FairBuffer`], classified by tenant.
pub struct Populator<S> {
    buffer: FairBuffer<Message>,
    source: Arc<S>,
    config: PopulatorConfig,
    stats: PopulatorCounters,
}

impl<S: MessageSource> Populator<S> {
    pub fn new(buffer: FairBuffer<Message>, source: Arc<S>, config: PopulatorConfig) -> Self {
        Self {
            buffer,
            source,
            config,
            stats: PopulatorCounters::default(),
        }
    }

    /// Runs until `cancel` fires or the source stream ends.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("populator starting");
        let mut messages = self.source.messages();

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = messages.next() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            let tenant = extract_tenant_id(message.payload());
            let entry = BufferedEntry::new(tenant, message.clone());
            match self.buffer.admit(entry, &cancel).await {
                Ok(AdmitResult::Admitted) => {
                    self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                    debug!(%tenant, message_id = message.id(), "message buffered");
                }
                Ok(AdmitResult::NotAdmitted(reason)) => {
                    self.stats.not_admitted.fetch_add(1, Ordering::Relaxed);
                    self.handle_not_admitted(tenant, &message, reason).await;
                }
                Err(Cancelled) => break,
            }
        }

        info!("populator stopped");
    }

    async fn handle_not_admitted(
        &self,
        tenant: TenantId,
        message: &Message,
        reason: NotAdmittedReason,
    ) {
        match self.config.not_admitted {
            NotAdmittedHandling::Leave => {
                debug!(%tenant, message_id = message.id(), ?reason, "tenant queue full, message left for redelivery");
            }
            NotAdmittedHandling::Resolve => {
                let result = match reason {
                    NotAdmittedReason::Accept => self.source.acknowledge(message).await,
                    NotAdmittedReason::Skip => self.source.requeue(message).await,
                };
                match result {
                    Ok(()) => {
                        warn!(%tenant, message_id = message.id(), ?reason, "tenant queue full, message resolved upstream");
                    }
                    Err(err) => {
                        error!(%tenant, message_id = message.id(), ?reason, error = %err, "failed to resolve message refused by tenant capacity");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> PopulatorStats {
        PopulatorStats {
            received: self.stats.received.load(Ordering::Relaxed),
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            not_admitted: self.stats.not_admitted.load(Ordering::Relaxed),
        }
    }
}
