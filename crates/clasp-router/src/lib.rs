//! # CLASP Router
//!
//! The router core for CLASP (Creative Low-Latency Application Streaming
//! Protocol): terminates client sessions over multiple transports,
//! dispatches the five signal kinds through the hierarchical wildcard
//! address space, keeps authoritative per-address state with revisions and
//! conflict resolution, and streams late-joiner snapshots.
//!
//! ## Architecture
//!
//! ```text
//!   accept loops ──► session reader tasks ──► dispatcher task
//!                                                  │
//!                         ParamStore  ◄────────────┤
//!                         SubscriptionIndex ◄──────┤
//!                         per-session outboxes ◄── (fan-out)
//! ```
//!
//! One dispatcher task owns all mutable routing state, so per-address write
//! ordering, snapshot atomicity, and bundle atomicity need no locking.
//! Session I/O, the scheduler, the TTL sweeper, and the persistence worker
//! are separate tasks connected by bounded channels.
//!
//! ## Quick start
//!
//! ```no_run
//! use clasp_router::{Router, RouterConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = Router::new(RouterConfig::default())?;
//!     router.serve_ws().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod gesture;
pub mod hooks;
pub mod router;
pub mod schedule;
pub mod session;
pub mod store;
pub mod subscription;
pub mod trie;

pub use config::{AuthMode, EvictionStrategy, RouterConfig, RouterConfigBuilder};
pub use error::{Result, RouterError};
pub use hooks::{
    Action, Authorizer, BridgeAdapter, OpenAuthorizer, ParamRecord, Persistence, PersistenceHandle,
    Scope, ScopeSet, StaticTokenAuthorizer,
};
pub use router::Router;
pub use session::{DeliveryClass, Session, SessionId};
pub use store::{ParamEntry, ParamStore, WriteError, WritePreview, WriteRequest};
pub use subscription::{Subscription, SubscriptionIndex};
