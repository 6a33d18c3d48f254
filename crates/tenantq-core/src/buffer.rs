use std::sync::atomic::Ordering;
use std::time::Instant;

use parking_lot::Mutex;

use crate::api::{
    AdmitAttempt, BufferConfig, BufferStats, BufferedEntry, FullReason, NotAdmittedReason,
    TenantCapacityPolicy, TenantDepth, TenantId,
};
use crate::state::{StatsCounters, TenantQueues};

/// Buffer multi-tenant acotado con entrega round-robin.
///
/// Todas las operaciones son no bloqueantes y toman un único lock exclusivo
/// solo durante la transición de estado. La espera (backpressure, "no hay
/// trabajo elegible") vive en el adaptador async.
pub struct TenantBuffer<T> {
    max_total: usize,
    max_per_tenant: usize,
    policy: TenantCapacityPolicy,
    state: Mutex<TenantQueues<T>>,
    stats: StatsCounters,
}

impl<T> TenantBuffer<T> {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            max_total: config.max_total.max(1),
            max_per_tenant: config.max_per_tenant.max(1),
            policy: config.on_tenant_capacity,
            state: Mutex::new(TenantQueues::new()),
            stats: StatsCounters::new(),
        }
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    pub fn max_per_tenant(&self) -> usize {
        self.max_per_tenant
    }

    pub fn policy(&self) -> TenantCapacityPolicy {
        self.policy
    }

    /// Intenta admitir la entrada.
    ///
    /// La política por tenant solo se evalúa cuando la cola del tenant está
    /// llena y todavía queda capacidad global. Con el buffer global lleno el
    /// resultado es siempre `Full(_, GlobalFull)`.
    pub fn try_admit(&self, entry: BufferedEntry<T>) -> AdmitAttempt<T> {
        let mut state = self.state.lock();

        if state.total >= self.max_total {
            return AdmitAttempt::Full(entry, FullReason::GlobalFull);
        }

        if state.tenant_len(entry.tenant) < self.max_per_tenant {
            state.push(entry);
            drop(state);
            StatsCounters::saturating_add(&self.stats.admitted, 1);
            return AdmitAttempt::Admitted;
        }

        drop(state);
        match self.policy {
            TenantCapacityPolicy::Accept => {
                StatsCounters::saturating_add(&self.stats.not_admitted_accept, 1);
                AdmitAttempt::NotAdmitted(NotAdmittedReason::Accept)
            }
            TenantCapacityPolicy::Skip => {
                StatsCounters::saturating_add(&self.stats.not_admitted_skip, 1);
                AdmitAttempt::NotAdmitted(NotAdmittedReason::Skip)
            }
            TenantCapacityPolicy::Wait => AdmitAttempt::Full(entry, FullReason::TenantFull),
        }
    }

    /// Saca la próxima entrada cuyo tenant cumpla `is_eligible`, en orden
    /// round-robin a partir del cursor persistente.
    ///
    /// `is_eligible` se invoca bajo el lock del buffer y solo para tenants con
    /// backlog; si devuelve `true` la entrada de ese tenant se entrega
    /// inmediatamente.
    pub fn try_dequeue_eligible<F>(&self, is_eligible: F) -> Option<BufferedEntry<T>>
    where
        F: FnMut(TenantId) -> bool,
    {
        let entry = self.state.lock().pop_next_eligible(is_eligible)?;

        StatsCounters::saturating_add(&self.stats.dequeued, 1);
        let queue_time_ns = Instant::now()
            .duration_since(entry.admitted_at)
            .as_nanos()
            .min(u128::from(u64::MAX)) as u64;
        StatsCounters::saturating_add(&self.stats.queue_time_sum_ns, queue_time_ns);
        StatsCounters::saturating_add(&self.stats.queue_time_samples, 1);

        Some(entry)
    }

    pub fn try_dequeue(&self) -> Option<BufferedEntry<T>> {
        self.try_dequeue_eligible(|_| true)
    }

    pub fn len(&self) -> usize {
        self.state.lock().total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tenant_len(&self, tenant: TenantId) -> usize {
        self.state.lock().tenant_len(tenant)
    }

    /// Tenants con backlog, en orden de rotación.
    pub fn active_tenants(&self) -> Vec<TenantId> {
        self.state.lock().active.as_slice().to_vec()
    }

    pub fn stats(&self) -> BufferStats {
        let (buffered, tenant_depths) = {
            let state = self.state.lock();
            let depths = state
                .active
                .as_slice()
                .iter()
                .map(|tenant| TenantDepth {
                    tenant: *tenant,
                    depth: state.tenant_len(*tenant) as u64,
                })
                .collect::<Vec<_>>();
            (state.total as u64, depths)
        };

        BufferStats {
            admitted: self.stats.admitted.load(Ordering::Relaxed),
            dequeued: self.stats.dequeued.load(Ordering::Relaxed),
            not_admitted_accept: self.stats.not_admitted_accept.load(Ordering::Relaxed),
            not_admitted_skip: self.stats.not_admitted_skip.load(Ordering::Relaxed),
            buffered,
            active_tenants: tenant_depths.len() as u64,
            queue_time_sum_ns: self.stats.queue_time_sum_ns.load(Ordering::Relaxed),
            queue_time_samples: self.stats.queue_time_samples.load(Ordering::Relaxed),
            tenant_depths,
        }
    }
}
