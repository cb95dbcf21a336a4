//! Tests for the dependency graph and engine.

use std::sync::Arc;

use super::*;
use crate::cache::{ClosureCache, InMemoryClosureCache, NoopClosureCache};
use crate::permission::NewPermission;
use crate::store::{EdgeStore, MemoryStore, PermissionStore};

fn ids(raw: &[u64]) -> Vec<PermissionId> {
    raw.iter().copied().map(PermissionId).collect()
}

fn edge(a: u64, b: u64) -> DependencyEdge {
    DependencyEdge::new(PermissionId(a), PermissionId(b))
}

struct Fixture {
    store: Arc<MemoryStore>,
    cache: Arc<InMemoryClosureCache>,
    service: DependencyService<MemoryStore>,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(InMemoryClosureCache::new());
        let service = DependencyService::new(Arc::clone(&store), cache.clone());
        Self {
            store,
            cache,
            service,
        }
    }

    fn create(&self, name: &str) -> Permission {
        self.store
            .insert_permission(&NewPermission::new(name))
            .unwrap()
    }

    /// `users.delete -> users.edit -> users.view -> dashboard.view`
    fn chain(&self) -> [Permission; 4] {
        let delete = self.create("users.delete");
        let edit = self.create("users.edit");
        let view = self.create("users.view");
        let dash = self.create("dashboard.view");
        self.service.add_dependency(delete.id, edit.id).unwrap();
        self.service.add_dependency(edit.id, view.id).unwrap();
        self.service.add_dependency(view.id, dash.id).unwrap();
        [delete, edit, view, dash]
    }
}

fn names(set: &BTreeSet<Permission>) -> Vec<&str> {
    set.iter().map(|p| p.name.as_str()).collect()
}

// =============================================================================
// DependencyGraph
// =============================================================================

#[test]
fn insert_rejects_self_loop() {
    let mut graph = DependencyGraph::new();
    assert!(matches!(
        graph.insert(edge(1, 1)),
        Err(GraphError::SelfDependency { .. })
    ));
    assert_eq!(graph.edge_count(), 0);
}

#[test]
fn insert_rejects_duplicate() {
    let mut graph = DependencyGraph::new();
    graph.insert(edge(1, 2)).unwrap();
    assert!(matches!(
        graph.insert(edge(1, 2)),
        Err(GraphError::DuplicateEdge { .. })
    ));
    // The reverse pair is a different edge and closes a cycle instead.
    assert!(matches!(
        graph.insert(edge(2, 1)),
        Err(GraphError::CycleDetected { .. })
    ));
}

#[test]
fn cycle_error_carries_existing_path() {
    let mut graph = DependencyGraph::new();
    graph.insert(edge(1, 2)).unwrap();
    graph.insert(edge(2, 3)).unwrap();
    graph.insert(edge(3, 4)).unwrap();

    match graph.insert(edge(4, 1)) {
        Err(GraphError::CycleDetected { path, .. }) => assert_eq!(path, ids(&[1, 2, 3, 4])),
        other => panic!("expected CycleDetected, got {other:?}"),
    }
}

#[test]
fn closures_exclude_start() {
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(2, 3), edge(1, 3)]);
    assert_eq!(graph.all_dependencies(PermissionId(1)), ids(&[2, 3]).into_iter().collect());
    assert_eq!(graph.all_dependents(PermissionId(3)), ids(&[1, 2]).into_iter().collect());
    assert!(graph.all_dependencies(PermissionId(3)).is_empty());
    assert!(graph.all_dependencies(PermissionId(42)).is_empty());
}

#[test]
fn closure_terminates_on_cyclic_input() {
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(2, 3), edge(3, 1)]);
    assert_eq!(graph.all_dependencies(PermissionId(1)), ids(&[2, 3]).into_iter().collect());
}

#[test]
fn shortest_path_prefers_first_discovered() {
    // Two equal-length routes 1 -> 2 -> 4 and 1 -> 3 -> 4; 2 was inserted first.
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(1, 3), edge(3, 4), edge(2, 4)]);
    assert_eq!(graph.shortest_path(PermissionId(1), PermissionId(4)), Some(ids(&[1, 2, 4])));

    // A direct edge beats any longer route.
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(2, 3), edge(1, 3)]);
    assert_eq!(graph.shortest_path(PermissionId(1), PermissionId(3)), Some(ids(&[1, 3])));
}

#[test]
fn shortest_path_edge_cases() {
    let graph = DependencyGraph::from_edges([edge(1, 2)]);
    assert_eq!(graph.shortest_path(PermissionId(1), PermissionId(1)), Some(ids(&[1])));
    assert_eq!(graph.shortest_path(PermissionId(2), PermissionId(1)), None);
    assert!(!graph.has_path(PermissionId(2), PermissionId(1)));
}

#[test]
fn find_cycles_reports_injected_cycles() {
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(2, 3), edge(3, 1), edge(5, 5)]);
    let cycles = graph.find_cycles();
    assert_eq!(cycles.len(), 2);
    assert!(cycles.contains(&ids(&[1, 2, 3])));
    assert!(cycles.contains(&ids(&[5])));
    assert!(!graph.is_acyclic());
}

#[test]
fn find_cycles_empty_for_dag() {
    let graph = DependencyGraph::from_edges([edge(1, 2), edge(1, 3), edge(2, 4), edge(3, 4)]);
    assert!(graph.find_cycles().is_empty());
    assert_eq!(graph.max_depth(), 2);
}

#[test]
fn remove_keeps_reverse_index_in_sync() {
    let mut graph = DependencyGraph::from_edges([edge(1, 2), edge(3, 2)]);
    assert!(graph.remove(edge(1, 2)));
    assert!(!graph.remove(edge(1, 2)));
    assert_eq!(graph.direct_dependents(PermissionId(2)), ids(&[3]).as_slice());
    assert_eq!(graph.edge_count(), 1);
}

// =============================================================================
// DependencyService
// =============================================================================

#[test]
fn end_to_end_chain() {
    let fx = Fixture::new();
    let [delete, edit, view, dash] = fx.chain();

    let deps = fx.service.all_dependencies(delete.id).unwrap();
    assert_eq!(names(&deps), vec!["users.edit", "users.view", "dashboard.view"]);

    let err = fx.service.add_dependency(dash.id, delete.id).unwrap_err();
    match err {
        GraphError::CycleDetected { path, .. } => {
            assert_eq!(path, vec![delete.id, edit.id, view.id, dash.id]);
        },
        other => panic!("expected CycleDetected, got {other:?}"),
    }
    assert_eq!(fx.store.edges().unwrap().len(), 3);
}

#[test]
fn add_dependency_errors() {
    let fx = Fixture::new();
    let a = fx.create("users.edit");
    let b = fx.create("users.view");

    assert!(matches!(
        fx.service.add_dependency(a.id, a.id),
        Err(GraphError::SelfDependency { .. })
    ));
    assert!(matches!(
        fx.service.add_dependency(a.id, PermissionId(999)),
        Err(GraphError::PermissionNotFound { id }) if id == PermissionId(999)
    ));
    fx.service.add_dependency(a.id, b.id).unwrap();
    assert!(matches!(
        fx.service.add_dependency(a.id, b.id),
        Err(GraphError::DuplicateEdge { .. })
    ));
}

#[test]
fn remove_dependency_is_idempotent() {
    let fx = Fixture::new();
    let a = fx.create("users.edit");
    let b = fx.create("users.view");
    fx.service.add_dependency(a.id, b.id).unwrap();

    fx.service.remove_dependency(a.id, b.id).unwrap();
    fx.service.remove_dependency(a.id, b.id).unwrap();
    assert!(fx.service.all_dependencies(a.id).unwrap().is_empty());
}

#[test]
fn direct_queries() {
    let fx = Fixture::new();
    let [delete, edit, view, _dash] = fx.chain();

    assert_eq!(names(&fx.service.direct_dependencies(edit.id).unwrap()), vec!["users.view"]);
    assert_eq!(names(&fx.service.direct_dependents(edit.id).unwrap()), vec!["users.delete"]);
    assert!(fx.service.direct_dependents(delete.id).unwrap().is_empty());
    assert_eq!(fx.service.all_dependents(view.id).unwrap().len(), 2);
}

#[test]
fn queries_reject_unknown_permission() {
    let fx = Fixture::new();
    let unknown = PermissionId(77);
    assert!(matches!(
        fx.service.all_dependencies(unknown),
        Err(GraphError::PermissionNotFound { .. })
    ));
    assert!(matches!(
        fx.service.dependency_path(unknown, unknown),
        Err(GraphError::PermissionNotFound { .. })
    ));
}

#[test]
fn dependency_path_resolves_names() {
    let fx = Fixture::new();
    let [delete, _edit, _view, dash] = fx.chain();

    let path = fx.service.dependency_path(delete.id, dash.id).unwrap().unwrap();
    let path: Vec<&str> = path.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(path, vec!["users.delete", "users.edit", "users.view", "dashboard.view"]);

    assert!(fx.service.has_dependency_path(delete.id, dash.id).unwrap());
    assert!(!fx.service.has_dependency_path(dash.id, delete.id).unwrap());
    assert!(fx.service.dependency_path(dash.id, delete.id).unwrap().is_none());
}

#[test]
fn closures_are_cached_and_invalidated() {
    let fx = Fixture::new();
    let [delete, edit, _view, _dash] = fx.chain();

    fx.service.all_dependencies(delete.id).unwrap();
    fx.service.all_dependencies(delete.id).unwrap();
    assert_eq!(fx.cache.metrics().hits, 1);
    assert_eq!(fx.cache.len(), 1);

    let extra = fx.create("audit.view");
    fx.service.add_dependency(edit.id, extra.id).unwrap();
    assert!(fx.cache.is_empty());

    let deps = fx.service.all_dependencies(delete.id).unwrap();
    assert!(names(&deps).contains(&"audit.view"));
}

#[test]
fn disabled_cache_still_answers() {
    let store = Arc::new(MemoryStore::new());
    let service = DependencyService::new(Arc::clone(&store), Arc::new(NoopClosureCache::new()));
    let a = store.insert_permission(&NewPermission::new("users.edit")).unwrap();
    let b = store.insert_permission(&NewPermission::new("users.view")).unwrap();
    service.add_dependency(a.id, b.id).unwrap();

    assert_eq!(service.all_dependencies(a.id).unwrap().len(), 1);
    assert_eq!(service.all_dependencies(a.id).unwrap().len(), 1);
    assert_eq!(service.cache_metrics().hits, 0);
}

#[test]
fn batch_load_matches_single_queries() {
    let fx = Fixture::new();
    let [delete, edit, view, dash] = fx.chain();
    let all = [delete.id, edit.id, view.id, dash.id];

    // Warm one entry so the batch mixes hits and misses.
    fx.service.all_dependencies(edit.id).unwrap();

    let deps = fx.service.batch_load_dependencies(&all).unwrap();
    let dependents = fx.service.batch_load_dependents(&all).unwrap();
    for id in all {
        assert_eq!(deps[&id], fx.service.all_dependencies(id).unwrap());
        assert_eq!(dependents[&id], fx.service.all_dependents(id).unwrap());
    }
    assert!(deps[&dash.id].is_empty());

    assert!(matches!(
        fx.service.batch_load_dependencies(&[delete.id, PermissionId(404)]),
        Err(GraphError::PermissionNotFound { id }) if id == PermissionId(404)
    ));
}

#[test]
fn validate_integrity_clean_graph() {
    let fx = Fixture::new();
    fx.chain();

    let report = fx.service.validate_integrity().unwrap();
    assert!(report.is_valid);
    assert!(report.cycles.is_empty());
    assert!(report.dangling_edges.is_empty());
    // users.view -> dashboard.view crosses modules.
    assert_eq!(report.cross_module.len(), 1);
    assert_eq!(report.cross_module[0].permission.name, "users.view");
}

#[test]
fn cross_module_lint_can_be_disabled() {
    let fx = Fixture::new();
    fx.chain();
    let service = DependencyService::new(Arc::clone(&fx.store), fx.service.cache())
        .with_cross_module_lint(CrossModuleLint::disabled());
    assert!(service.validate_integrity().unwrap().cross_module.is_empty());
}

#[test]
fn soft_deleted_permission_cascades_edges() {
    let fx = Fixture::new();
    let [delete, edit, _view, _dash] = fx.chain();

    assert!(fx.store.soft_delete_permission(edit.id, chrono::Utc::now()).unwrap());
    fx.cache.invalidate_all();

    assert!(fx.service.all_dependencies(delete.id).unwrap().is_empty());
    let report = fx.service.validate_integrity().unwrap();
    assert!(report.is_valid);
    assert_eq!(fx.store.edges().unwrap().len(), 1);
}
