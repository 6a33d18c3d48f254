//! tenantq core: buffer multi-tenant acotado con entrega round-robin.
//!
//! Decisiones de arquitectura:
//! - Fairness: round-robin por tenant sobre un ring de tenants activos, con
//!   cursor persistente y predicado de elegibilidad re-evaluado en cada escaneo.
//! - Capacidad global: techo duro. Capacidad por tenant: techo blando según
//!   `TenantCapacityPolicy` (Wait / Accept / Skip).
//! - FIFO dentro de cada tenant; sin orden global entre tenants.
//!
//! El core es runtime-agnostic (sin Tokio) y no bloquea. La espera con
//! cancelación vive en `tenantq-async`.

mod api;
mod buffer;
pub mod prometheus;
mod state;
mod tenant;


pub use api::{
    AdmitAttempt, AdmitResult, BufferConfig, BufferStats, BufferedEntry, FullReason, Message,
    NotAdmittedReason, TenantCapacityPolicy, TenantDepth, TenantId,
};
pub use buffer::TenantBuffer;
pub use tenant::{TENANT_KEYS, extract_tenant_id};
