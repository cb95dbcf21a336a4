//! # permgraph-core
//!
//! Permission dependency graph and tamper-evident activity log for an admin
//! backend.
//!
//! Two concerns live here:
//!
//! - **Authorization structure**: permissions form a DAG of "requires"
//!   edges ([`graph`]), roles form a parent hierarchy ([`role`]), and the
//!   effective grant of a role is computed from both.
//! - **Accountability**: every audited action becomes an [`audit::Activity`]
//!   that is sanitized, risk-scored, and HMAC-signed before it is stored. The
//!   [`audit::AuditGuard`] is the only write path and refuses to alter
//!   protected fields or delete records that must be retained.
//!
//! Storage sits behind the traits in [`store`]. [`store::SqliteStore`] is
//! the durable backend; [`store::MemoryStore`] serves tests and embedding.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use permgraph_core::cache::InMemoryClosureCache;
//! use permgraph_core::graph::{DependencyService, GraphError};
//! use permgraph_core::permission::{NewPermission, PermissionCatalog};
//! use permgraph_core::store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//! let cache = Arc::new(InMemoryClosureCache::new());
//! let catalog = PermissionCatalog::new(Arc::clone(&store), cache.clone());
//! let graph = DependencyService::new(Arc::clone(&store), cache);
//!
//! let edit = catalog.create(&NewPermission::new("users.edit")).unwrap();
//! let view = catalog.create(&NewPermission::new("users.view")).unwrap();
//! graph.add_dependency(edit.id, view.id).unwrap();
//!
//! assert!(graph.has_dependency_path(edit.id, view.id).unwrap());
//! assert!(matches!(
//!     graph.add_dependency(view.id, edit.id),
//!     Err(GraphError::CycleDetected { .. })
//! ));
//! ```

pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod graph;
pub mod permission;
pub mod role;
pub mod settings;
pub mod stats;
pub mod store;

pub use audit::{Activity, AuditError, AuditGuard, NewActivity};
pub use config::{ConfigError, PermgraphConfig};
pub use crypto::{IntegrityError, IntegritySigner, SigningPolicy};
pub use graph::{DependencyGraph, DependencyService, GraphError, IntegrityReport};
pub use permission::{Permission, PermissionCatalog, PermissionError, PermissionId};
pub use role::{Role, RoleError, RoleId, RoleService};
pub use stats::GraphStatistics;
pub use store::{MemoryStore, SqliteStore, StoreError};
