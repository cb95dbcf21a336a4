//! Property-based tests for the graph invariants.

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::{DependencyEdge, DependencyGraph, GraphError};
use crate::permission::PermissionId;

const NODES: u64 = 12;

fn arb_edges() -> impl Strategy<Value = Vec<DependencyEdge>> {
    prop::collection::vec((0..NODES, 0..NODES), 0..48).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(a, b)| DependencyEdge::new(PermissionId(a), PermissionId(b)))
            .collect()
    })
}

/// Inserts every edge through the checked path and returns the accepted graph.
fn build(edges: &[DependencyEdge]) -> DependencyGraph {
    let mut graph = DependencyGraph::new();
    for &edge in edges {
        let _ = graph.insert(edge);
    }
    graph
}

fn fixed_point(graph: &DependencyGraph, start: PermissionId) -> BTreeSet<PermissionId> {
    let mut reached: BTreeSet<PermissionId> =
        graph.direct_dependencies(start).iter().copied().collect();
    loop {
        let next: BTreeSet<PermissionId> = reached
            .iter()
            .flat_map(|&n| graph.direct_dependencies(n).iter().copied())
            .chain(reached.iter().copied())
            .collect();
        if next == reached {
            break;
        }
        reached = next;
    }
    reached.remove(&start);
    reached
}

proptest! {
    #[test]
    fn accepted_inserts_keep_graph_acyclic(edges in arb_edges()) {
        let mut graph = DependencyGraph::new();
        for edge in edges {
            let before = graph.edge_count();
            match graph.insert(edge) {
                Ok(()) => prop_assert_eq!(graph.edge_count(), before + 1),
                Err(GraphError::CycleDetected { path, .. }) => {
                    prop_assert_eq!(path.first(), Some(&edge.depends_on));
                    prop_assert_eq!(path.last(), Some(&edge.permission));
                    prop_assert_eq!(graph.edge_count(), before);
                },
                Err(GraphError::SelfDependency { .. }) => prop_assert!(edge.is_self_loop()),
                Err(GraphError::DuplicateEdge { .. }) => prop_assert!(graph.contains_edge(edge)),
                Err(other) => prop_assert!(false, "unexpected error: {other}"),
            }
            prop_assert!(graph.is_acyclic());
        }
    }

    #[test]
    fn shuffled_dag_insertion_never_rejects(
        pairs in prop::collection::vec((0..NODES, 0..NODES), 0..48),
        seed in any::<u64>(),
    ) {
        // Orient every pair low -> high so the full set is a DAG, then
        // insert in a shuffled order: no acyclic edge may be rejected.
        let mut edges: Vec<DependencyEdge> = pairs
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| DependencyEdge::new(PermissionId(a.min(b)), PermissionId(a.max(b))))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let len = edges.len();
        if len > 1 {
            let mut state = seed;
            for i in (1..len).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let j = usize::try_from(state >> 33).unwrap_or(0) % (i + 1);
                edges.swap(i, j);
            }
        }

        let mut graph = DependencyGraph::new();
        for edge in edges {
            prop_assert!(graph.insert(edge).is_ok());
        }
        prop_assert_eq!(graph.edge_count(), len);
    }

    #[test]
    fn closure_is_fixed_point(edges in arb_edges()) {
        let graph = build(&edges);
        for n in 0..NODES {
            let id = PermissionId(n);
            prop_assert_eq!(graph.all_dependencies(id), fixed_point(&graph, id));
        }
    }

    #[test]
    fn closures_are_symmetric(edges in arb_edges()) {
        let graph = build(&edges);
        for a in 0..NODES {
            let deps = graph.all_dependencies(PermissionId(a));
            for b in 0..NODES {
                let dependents = graph.all_dependents(PermissionId(b));
                prop_assert_eq!(
                    deps.contains(&PermissionId(b)),
                    dependents.contains(&PermissionId(a))
                );
            }
        }
    }

    #[test]
    fn path_agrees_with_reachability(edges in arb_edges(), a in 0..NODES, b in 0..NODES) {
        let graph = build(&edges);
        let (from, to) = (PermissionId(a), PermissionId(b));
        match graph.shortest_path(from, to) {
            Some(path) => {
                prop_assert!(graph.has_path(from, to));
                prop_assert_eq!(path.first(), Some(&from));
                prop_assert_eq!(path.last(), Some(&to));
                for pair in path.windows(2) {
                    prop_assert!(graph.contains_edge(DependencyEdge::new(pair[0], pair[1])));
                }
                if from != to {
                    prop_assert!(graph.all_dependencies(from).contains(&to));
                }
            },
            None => {
                prop_assert!(!graph.has_path(from, to));
                prop_assert!(!graph.all_dependencies(from).contains(&to));
            },
        }
    }
}
