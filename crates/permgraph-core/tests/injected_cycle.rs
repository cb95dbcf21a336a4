//! Integrity audit over rows written behind the engine's back.
//!
//! The engine never writes a cycle, but an import script or a manual
//! `INSERT` can. `validate_integrity` must still find it.

use std::collections::BTreeSet;
use std::sync::Arc;

use permgraph_core::cache::InMemoryClosureCache;
use permgraph_core::graph::DependencyEdge;
use permgraph_core::permission::{NewPermission, PermissionId};
use permgraph_core::{DependencyService, GraphError, Permission, PermissionCatalog, SqliteStore};
use rusqlite::{Connection, params};
use tempfile::TempDir;

fn create(catalog: &PermissionCatalog<SqliteStore>, name: &str) -> Permission {
    catalog.create(&NewPermission::new(name)).unwrap()
}

#[test]
fn cycle_inserted_with_raw_sql_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("injected.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let cache = Arc::new(InMemoryClosureCache::new());
    let catalog = PermissionCatalog::new(Arc::clone(&store), cache.clone());
    let service = DependencyService::new(Arc::clone(&store), cache);

    let a = create(&catalog, "reports.export");
    let b = create(&catalog, "reports.view");
    let c = create(&catalog, "reports.schedule");
    service.add_dependency(a.id, b.id).unwrap();
    service.add_dependency(b.id, c.id).unwrap();

    // The engine refuses to close the loop.
    assert!(matches!(
        service.add_dependency(c.id, a.id),
        Err(GraphError::CycleDetected { .. })
    ));
    assert!(service.validate_integrity().unwrap().is_valid);

    // A second connection does it anyway, and with foreign keys switched off
    // also leaves an edge pointing at a permission that never existed.
    let raw = Connection::open(&path).unwrap();
    raw.pragma_update(None, "foreign_keys", false).unwrap();
    raw.execute(
        "INSERT INTO permission_dependencies (permission_id, depends_on_permission_id)
         VALUES (?1, ?2)",
        params![c.id.0, a.id.0],
    )
    .unwrap();
    raw.execute(
        "INSERT INTO permission_dependencies (permission_id, depends_on_permission_id)
         VALUES (?1, ?2)",
        params![a.id.0, 999_i64],
    )
    .unwrap();
    drop(raw);

    let report = service.validate_integrity().unwrap();
    assert!(!report.is_valid);
    assert_eq!(report.cycles.len(), 1);
    let members: BTreeSet<PermissionId> = report.cycles[0].iter().map(|p| p.id).collect();
    assert_eq!(members, BTreeSet::from([a.id, b.id, c.id]));
    assert_eq!(
        report.dangling_edges,
        vec![DependencyEdge::new(a.id, PermissionId(999))]
    );
}

#[test]
fn soft_deleted_endpoint_written_behind_the_engine_is_dangling() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dangling.db");
    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let cache = Arc::new(InMemoryClosureCache::new());
    let catalog = PermissionCatalog::new(Arc::clone(&store), cache.clone());
    let service = DependencyService::new(Arc::clone(&store), cache);

    let edit = create(&catalog, "posts.edit");
    let view = create(&catalog, "posts.view");
    catalog.soft_delete(view.id).unwrap();

    store
        .insert_edge_unchecked(DependencyEdge::new(edit.id, view.id))
        .unwrap();

    let report = service.validate_integrity().unwrap();
    assert!(!report.is_valid);
    assert!(report.cycles.is_empty());
    assert_eq!(report.dangling_edges, vec![DependencyEdge::new(edit.id, view.id)]);
}
