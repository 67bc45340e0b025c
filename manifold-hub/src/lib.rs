//! Upstream supervision, the effective tool catalog, and scope resolution.
//!
//! One supervisor task per declared upstream drives a small state machine
//! (disconnected → connecting → ready → degraded → closed) with exponential
//! backoff, keep-alive pings, and settings reconciliation. Supervisors
//! project their tool lists into the [`catalog::ToolCatalog`], which versions
//! every set-level change; the [`resolver`] turns a routing scope plus a
//! principal into the set of reachable upstreams and allowed tools.

pub mod backoff;
pub mod catalog;
pub mod error;
pub mod resolver;
pub mod runtime;
pub mod supervisor;

pub use catalog::{CatalogChange, CatalogSnapshot, EffectiveTool, EmbeddingSeed, ToolCatalog};
pub use error::{HubError, HubResult};
pub use resolver::{Principal, ResolvedScope, RouteScope, ScopeEntry, ToolFilter};
pub use runtime::{UpstreamState, UpstreamStatus};
pub use supervisor::{ClientFactory, TransportClientFactory, UpstreamHandle, UpstreamSet};
