//! TraceDB core: a multi-tenant, horizontally-scalable trace store backed by
//! object storage.
//!
//! Write path: spans enter through the [`distributor`], which routes each
//! trace to its owning [`ingester`] replicas via the consistent-hash
//! [`ring`]. Ingesters buffer per tenant and periodically cut and flush
//! immutable [`block`]s to the [`backend`] object store. The [`compactor`]
//! merges small blocks in the background. Read path: the [`frontend`] shards
//! queries across [`querier`]s, which consult live ingester buffers plus
//! bloom-pruned blocks and merge the results.

pub mod backend;
pub mod block;
pub mod compactor;
pub mod config;
pub mod distributor;
pub mod error;
pub mod frontend;
pub mod ingester;
pub mod model;
pub mod querier;
pub mod ring;

pub use config::Config;
pub use error::{Result, TraceError};
pub use model::{Span, SpanId, TenantId, Trace, TraceId, TraceSummary};
