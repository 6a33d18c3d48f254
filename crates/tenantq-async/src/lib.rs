//! Tokio adapter for `tenantq-core`.
//!
//! This crate provides the pieces that wait and run concurrently:
//! - `FairBuffer`: cancellable blocking admit / dequeue over the core buffer
//! - `Dispatcher`: pool of consumer loops with per-tenant in-flight limits
//! - `Populator`: sequential loop feeding the buffer from a `MessageSource`
//! - `MessageSource` / `MessageProcessor` seams plus an in-memory source

mod buffer;
mod dispatcher;
mod error;
mod populator;
mod processor;
mod source;

pub use buffer::FairBuffer;
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats};
pub use error::{Cancelled, ProcessError, SourceError};
pub use populator::{NotAdmittedHandling, Populator, PopulatorConfig, PopulatorStats};
pub use processor::MessageProcessor;
pub use source::{DEFAULT_VISIBILITY_TIMEOUT, MemorySource, MessageSource};
pub use tenantq_core::{
    AdmitAttempt, AdmitResult, BufferConfig, BufferStats, BufferedEntry, FullReason, Message,
    NotAdmittedReason, TenantBuffer, TenantCapacityPolicy, TenantDepth, TenantId,
    extract_tenant_id, prometheus,
};
pub use tokio_util::sync::CancellationToken;
