use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use tenantq_core::{
    AdmitAttempt, AdmitResult, BufferConfig, BufferStats, BufferedEntry, TenantBuffer,
    TenantCapacityPolicy, TenantId,
};

use crate::error::Cancelled;

struct Shared<T> {
    core: TenantBuffer<T>,
    space_released: Notify,
    item_available: Notify,
    eligibility_changed: Notify,
}

/// Blocking, cancellable facade over [`TenantBuffer`].
///
/// Waiters register for a signal before inspecting the buffer, so a state
/// change that lands between the check and the wait still wakes them.
pub struct FairBuffer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for FairBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> FairBuffer<T> {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: TenantBuffer::new(config),
                space_released: Notify::new(),
                item_available: Notify::new(),
                eligibility_changed: Notify::new(),
            }),
        }
    }

    /// Global capacity after clamping.
    pub fn max_total(&self) -> usize {
        self.shared.core.max_total()
    }

    /// Per-tenant capacity after clamping.
    pub fn max_per_tenant(&self) -> usize {
        self.shared.core.max_per_tenant()
    }

    pub fn policy(&self) -> TenantCapacityPolicy {
        self.shared.core.policy()
    }

    /// Admits `entry`, waiting for space when the buffer is full.
    ///
    /// Returns `NotAdmitted` without waiting only when the tenant's queue is
    /// full, global room remains and the policy is `Accept` or `Skip`.
    pub async fn admit(
        &self,
        mut entry: BufferedEntry<T>,
        cancel: &CancellationToken,
    ) -> Result<AdmitResult, Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let space_released = self.shared.space_released.notified();
            tokio::pin!(space_released);
            space_released.as_mut().enable();

            match self.shared.core.try_admit(entry) {
                AdmitAttempt::Admitted => {
                    self.shared.item_available.notify_waiters();
                    return Ok(AdmitResult::Admitted);
                }
                AdmitAttempt::NotAdmitted(reason) => {
                    return Ok(AdmitResult::NotAdmitted(reason));
                }
                AdmitAttempt::Full(returned, reason) => {
                    tracing::trace!(tenant = %returned.tenant, ?reason, "buffer full, waiting for space");
                    entry = returned;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled),
                        _ = &mut space_released => {}
                    }
                }
            }
        }
    }

    /// Takes the next entry whose tenant satisfies `is_eligible`, in
    /// round-robin tenant order, waiting for a new item or an eligibility
    /// change when nothing qualifies.
    ///
    /// `is_eligible` runs under the buffer lock; returning `true` commits to
    /// taking that tenant's head entry.
    pub async fn dequeue_next_eligible<F>(
        &self,
        mut is_eligible: F,
        cancel: &CancellationToken,
    ) -> Result<BufferedEntry<T>, Cancelled>
    where
        F: FnMut(TenantId) -> bool,
    {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            let item_available = self.shared.item_available.notified();
            let eligibility_changed = self.shared.eligibility_changed.notified();
            tokio::pin!(item_available, eligibility_changed);
            item_available.as_mut().enable();
            eligibility_changed.as_mut().enable();

            if let Some(entry) = self.shared.core.try_dequeue_eligible(&mut is_eligible) {
                self.shared.space_released.notify_waiters();
                return Ok(entry);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = &mut item_available => {}
                _ = &mut eligibility_changed => {}
            }
        }
    }

    /// Wakes consumers parked in [`FairBuffer::dequeue_next_eligible`] so they
    /// rescan tenants that were skipped as ineligible.
    pub fn notify_eligibility_changed(&self) {
        self.shared.eligibility_changed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.core.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.core.is_empty()
    }

    pub fn tenant_len(&self, tenant: TenantId) -> usize {
        self.shared.core.tenant_len(tenant)
    }

    pub fn stats(&self) -> BufferStats {
        self.shared.core.stats()
    }
}
