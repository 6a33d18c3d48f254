use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::{BufferedEntry, TenantId};

/// Ring de tenants activos con cursor persistente entre llamadas.
///
/// Un tenant está en el ring sii su cola no está vacía. El orden de inserción
/// define el orden de rotación.
#[derive(Debug, Default)]
pub(crate) struct ActiveRing {
    tenants: Vec<TenantId>,
    cursor: usize,
}

impl ActiveRing {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.tenants.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub(crate) fn push(&mut self, tenant: TenantId) {
        self.tenants.push(tenant);
    }

    pub(crate) fn as_slice(&self) -> &[TenantId] {
        &self.tenants
    }

    /// Tenant bajo el cursor, re-acotando el cursor al tamaño actual.
    fn current(&mut self) -> Option<TenantId> {
        if self.tenants.is_empty() {
            return None;
        }
        if self.cursor >= self.tenants.len() {
            self.cursor = 0;
        }
        Some(self.tenants[self.cursor])
    }

    fn advance(&mut self) {
        if self.tenants.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor = (self.cursor + 1) % self.tenants.len();
        }
    }

    fn remove_current(&mut self) {
        self.tenants.remove(self.cursor);
        if self.cursor >= self.tenants.len() {
            self.cursor = 0;
        }
    }
}

/// Estado protegido por el lock del buffer: colas por tenant, ring y total.
#[derive(Debug)]
pub(crate) struct TenantQueues<T> {
    pub(crate) queues: HashMap<TenantId, VecDeque<BufferedEntry<T>>>,
    pub(crate) active: ActiveRing,
    pub(crate) total: usize,
}

impl<T> TenantQueues<T> {
    pub(crate) fn new() -> Self {
        Self {
            queues: HashMap::new(),
            active: ActiveRing::new(),
            total: 0,
        }
    }

    pub(crate) fn tenant_len(&self, tenant: TenantId) -> usize {
        self.queues.get(&tenant).map(VecDeque::len).unwrap_or(0)
    }

    /// Agrega al final de la cola del tenant. El caller ya verificó capacidad.
    pub(crate) fn push(&mut self, entry: BufferedEntry<T>) {
        let tenant = entry.tenant;
        let queue = self.queues.entry(tenant).or_default();
        let was_empty = queue.is_empty();
        queue.push_back(entry);
        self.total += 1;
        if was_empty {
            self.active.push(tenant);
        }
    }

    /// Escaneo round-robin no bloqueante.
    ///
    /// Revisa como máximo una vuelta del ring (tamaño al inicio del escaneo).
    /// Un tenant no elegible se salta sin sacarlo del ring.
    pub(crate) fn pop_next_eligible<F>(&mut self, mut is_eligible: F) -> Option<BufferedEntry<T>>
    where
        F: FnMut(TenantId) -> bool,
    {
        let count = self.active.len();
        let mut scanned = 0;
        while scanned < count {
            let tenant = self.active.current()?;
            let has_backlog = self.queues.get(&tenant).is_some_and(|q| !q.is_empty());
            if has_backlog && is_eligible(tenant) {
                let queue = self.queues.get_mut(&tenant)?;
                let entry = queue.pop_front()?;
                self.total -= 1;
                if queue.is_empty() {
                    self.queues.remove(&tenant);
                    self.active.remove_current();
                } else {
                    self.active.advance();
                }
                return Some(entry);
            }
            self.active.advance();
            scanned += 1;
        }
        None
    }
}

#[derive(Debug)]
pub(crate) struct StatsCounters {
    pub(crate) admitted: AtomicU64,
    pub(crate) dequeued: AtomicU64,
    pub(crate) not_admitted_accept: AtomicU64,
    pub(crate) not_admitted_skip: AtomicU64,
    pub(crate) queue_time_sum_ns: AtomicU64,
    pub(crate) queue_time_samples: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            not_admitted_accept: AtomicU64::new(0),
            not_admitted_skip: AtomicU64::new(0),
            queue_time_sum_ns: AtomicU64::new(0),
            queue_time_samples: AtomicU64::new(0),
        }
    }

    pub(crate) fn saturating_add(counter: &AtomicU64, delta: u64) {
        if delta == 0 {
            return;
        }
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_add(delta);
            match counter.compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
