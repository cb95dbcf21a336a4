//! In-memory adjacency structure and traversal algorithms.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::GraphError;
use crate::permission::PermissionId;

/// "`permission` cannot be granted unless `depends_on` is also granted."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The dependent permission.
    pub permission: PermissionId,
    /// The permission it requires.
    pub depends_on: PermissionId,
}

impl DependencyEdge {
    /// Creates an edge `permission -> depends_on`.
    #[must_use]
    pub const fn new(permission: PermissionId, depends_on: PermissionId) -> Self {
        Self {
            permission,
            depends_on,
        }
    }

    /// Returns `true` for `p -> p`.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.permission == self.depends_on
    }
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.permission, self.depends_on)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Directed dependency graph over permission ids.
///
/// Adjacency lists keep insertion order, and nodes iterate in id order, so
/// every traversal is deterministic for a given edge sequence.
///
/// [`from_edges`](Self::from_edges) accepts any edge set, including cyclic
/// ones loaded from a tampered database; [`insert`](Self::insert) enforces
/// the invariants (no self-loops, no duplicates, no cycles).
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: BTreeMap<PermissionId, Vec<PermissionId>>,
    reverse: BTreeMap<PermissionId, Vec<PermissionId>>,
    edge_count: usize,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from stored edges without validating them.
    ///
    /// Exact duplicates are collapsed; self-loops and cycles are kept so that
    /// [`find_cycles`](Self::find_cycles) can report them.
    pub fn from_edges(edges: impl IntoIterator<Item = DependencyEdge>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.push(edge);
        }
        graph
    }

    fn push(&mut self, edge: DependencyEdge) -> bool {
        if self.contains_edge(edge) {
            return false;
        }
        self.forward
            .entry(edge.permission)
            .or_default()
            .push(edge.depends_on);
        self.reverse
            .entry(edge.depends_on)
            .or_default()
            .push(edge.permission);
        self.edge_count += 1;
        true
    }

    /// Number of edges.
    #[must_use]
    pub const fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Every node that appears in at least one edge.
    #[must_use]
    pub fn nodes(&self) -> BTreeSet<PermissionId> {
        self.forward
            .keys()
            .chain(self.reverse.keys())
            .copied()
            .collect()
    }

    /// Every edge, grouped by dependent in id order, then insertion order.
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.forward.iter().flat_map(|(&permission, targets)| {
            targets
                .iter()
                .map(move |&depends_on| DependencyEdge::new(permission, depends_on))
        })
    }

    /// Returns `true` if the exact edge exists.
    #[must_use]
    pub fn contains_edge(&self, edge: DependencyEdge) -> bool {
        self.direct_dependencies(edge.permission)
            .contains(&edge.depends_on)
    }

    /// Checks whether `edge` may be inserted without breaking an invariant.
    ///
    /// # Errors
    ///
    /// - [`GraphError::SelfDependency`] for `p -> p`
    /// - [`GraphError::DuplicateEdge`] if the edge exists
    /// - [`GraphError::CycleDetected`] if `depends_on` already reaches
    ///   `permission`; the error carries that existing path
    pub fn check_insert(&self, edge: DependencyEdge) -> Result<(), GraphError> {
        if edge.is_self_loop() {
            return Err(GraphError::SelfDependency {
                permission: edge.permission,
            });
        }
        if self.contains_edge(edge) {
            return Err(GraphError::DuplicateEdge {
                permission: edge.permission,
                depends_on: edge.depends_on,
            });
        }
        if let Some(path) = self.shortest_path(edge.depends_on, edge.permission) {
            return Err(GraphError::CycleDetected {
                permission: edge.permission,
                depends_on: edge.depends_on,
                path,
            });
        }
        Ok(())
    }

    /// Inserts `edge` after [`check_insert`](Self::check_insert).
    ///
    /// # Errors
    ///
    /// See [`check_insert`](Self::check_insert); the graph is unchanged on
    /// error.
    pub fn insert(&mut self, edge: DependencyEdge) -> Result<(), GraphError> {
        self.check_insert(edge)?;
        self.push(edge);
        Ok(())
    }

    /// Removes `edge`. Returns `false` if it was absent.
    pub fn remove(&mut self, edge: DependencyEdge) -> bool {
        let removed = remove_from(&mut self.forward, edge.permission, edge.depends_on);
        if removed {
            remove_from(&mut self.reverse, edge.depends_on, edge.permission);
            self.edge_count -= 1;
        }
        removed
    }

    /// Permissions `id` requires directly, in insertion order.
    #[must_use]
    pub fn direct_dependencies(&self, id: PermissionId) -> &[PermissionId] {
        self.forward.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Permissions that directly require `id`, in insertion order.
    #[must_use]
    pub fn direct_dependents(&self, id: PermissionId) -> &[PermissionId] {
        self.reverse.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Everything that must also be granted with `id`, excluding `id`.
    #[must_use]
    pub fn all_dependencies(&self, id: PermissionId) -> BTreeSet<PermissionId> {
        closure(&self.forward, id)
    }

    /// Everything that would lose a requirement if `id` were revoked,
    /// excluding `id`.
    #[must_use]
    pub fn all_dependents(&self, id: PermissionId) -> BTreeSet<PermissionId> {
        closure(&self.reverse, id)
    }

    /// Shortest dependency path `from -> ... -> to` (BFS).
    ///
    /// Among equal-length paths the first one discovered in adjacency order
    /// wins. `from == to` yields the zero-length path `[from]`.
    #[must_use]
    pub fn shortest_path(&self, from: PermissionId, to: PermissionId) -> Option<Vec<PermissionId>> {
        if from == to {
            return Some(vec![from]);
        }

        let mut parent: HashMap<PermissionId, PermissionId> = HashMap::new();
        let mut visited = HashSet::from([from]);
        let mut queue = VecDeque::from([from]);

        while let Some(node) = queue.pop_front() {
            for &next in self.direct_dependencies(node) {
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, node);
                if next == to {
                    let mut path = vec![to];
                    let mut cursor = to;
                    while let Some(&prev) = parent.get(&cursor) {
                        path.push(prev);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Returns `true` if `to` is reachable from `from`.
    #[must_use]
    pub fn has_path(&self, from: PermissionId, to: PermissionId) -> bool {
        self.shortest_path(from, to).is_some()
    }

    /// Full-graph cycle scan (DFS with white/gray/black colouring).
    ///
    /// Each back edge yields one cycle, listed from the re-entered node along
    /// the DFS stack; `[a, b, c]` means `a -> b -> c -> a`. A self-loop is
    /// reported as `[a]`. Runs in O(V + E).
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<PermissionId>> {
        let mut color: HashMap<PermissionId, Color> = HashMap::new();
        let mut cycles = Vec::new();

        for &root in self.forward.keys() {
            if color.get(&root).copied().unwrap_or(Color::White) != Color::White {
                continue;
            }
            color.insert(root, Color::Gray);
            let mut stack: Vec<(PermissionId, usize)> = vec![(root, 0)];

            while let Some(&(node, next_index)) = stack.last() {
                let Some(&next) = self.direct_dependencies(node).get(next_index) else {
                    color.insert(node, Color::Black);
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                match color.get(&next).copied().unwrap_or(Color::White) {
                    Color::White => {
                        color.insert(next, Color::Gray);
                        stack.push((next, 0));
                    },
                    Color::Gray => {
                        if let Some(start) = stack.iter().position(|&(n, _)| n == next) {
                            cycles.push(stack[start..].iter().map(|&(n, _)| n).collect());
                        }
                    },
                    Color::Black => {},
                }
            }
        }
        cycles
    }

    /// Returns `true` if the graph has no directed cycle.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        self.find_cycles().is_empty()
    }

    /// Length in edges of the longest dependency chain.
    ///
    /// Nodes on a cycle have no defined depth and are skipped.
    #[must_use]
    pub fn max_depth(&self) -> usize {
        let nodes = self.nodes();
        let mut remaining: HashMap<PermissionId, usize> = nodes
            .iter()
            .map(|&n| (n, self.direct_dependencies(n).len()))
            .collect();
        let mut depth: HashMap<PermissionId, usize> = HashMap::new();
        let mut ready: VecDeque<PermissionId> = nodes
            .iter()
            .copied()
            .filter(|n| self.direct_dependencies(*n).is_empty())
            .collect();
        let mut deepest = 0;

        while let Some(node) = ready.pop_front() {
            let node_depth = depth.get(&node).copied().unwrap_or(0);
            deepest = deepest.max(node_depth);
            for &dependent in self.direct_dependents(node) {
                let entry = depth.entry(dependent).or_insert(0);
                *entry = (*entry).max(node_depth + 1);
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
        deepest
    }
}

fn closure(
    adjacency: &BTreeMap<PermissionId, Vec<PermissionId>>,
    start: PermissionId,
) -> BTreeSet<PermissionId> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<PermissionId> = adjacency
        .get(&start)
        .map(|v| v.iter().copied().collect())
        .unwrap_or_default();

    while let Some(node) = queue.pop_front() {
        if node == start || !seen.insert(node) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            queue.extend(next.iter().copied());
        }
    }
    seen
}

fn remove_from(
    adjacency: &mut BTreeMap<PermissionId, Vec<PermissionId>>,
    from: PermissionId,
    to: PermissionId,
) -> bool {
    let Some(targets) = adjacency.get_mut(&from) else {
        return false;
    };
    let Some(pos) = targets.iter().position(|&t| t == to) else {
        return false;
    };
    targets.remove(pos);
    if targets.is_empty() {
        adjacency.remove(&from);
    }
    true
}
