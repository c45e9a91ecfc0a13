// # rangesync-core
//
// Core library for keeping a security boundary's allow-list synchronized
// with an externally published set of IP ranges.
//
// ## Architecture Overview
//
// Two short-lived, triggered stages decoupled through a durable store:
// - **Ingestor**: change notification → fetch range document → upsert
//   range records tagged with a monotonically increasing sync token
// - **Reconciler**: stored ranges for one scope → minimal add/remove set
//   against the live security boundary
//
// External collaborators are traits:
// - **RangeFeed**: fetches the authoritative range document
// - **RangeStore**: durable keyed table of range records
// - **SecurityBoundary**: the live rule set being converged
// - **PluginRegistry**: builds collaborators from configuration
//
// ## Design Principles
//
// 1. **Idempotency**: every step can be rerun from scratch with no cleanup
// 2. **Convergence over atomicity**: no multi-record transactions; a rerun
//    finishes whatever a failed run left behind
// 3. **Scoped ownership**: only rules carrying this system's per-scope tag
//    are ever touched
// 4. **Library-First**: the daemon is a thin wrapper over this crate

pub mod config;
pub mod error;
pub mod events;
pub mod ingestor;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod traits;

// Re-export core types for convenience
pub use config::{BoundaryConfig, FeedConfig, StoreConfig, SyncConfig};
pub use error::{Error, Result};
pub use events::{EventSink, SyncEvent};
pub use ingestor::{Ingestor, SyncResult};
pub use model::{Cidr, RangeRecord, Scope, SyncToken};
pub use reconciler::{ReconcileResult, Reconciler};
pub use registry::PluginRegistry;
pub use store::{FileRangeStore, MemoryRangeStore};
pub use traits::{ChangeNotification, RangeFeed, RangeStore, SecurityBoundary};
