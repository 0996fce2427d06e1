// Copyright (c) Ponder, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Handler dependency graph.
//!
//! Nodes are indexing functions; an edge `A → B` exists when A's writes
//! intersect B's reads or writes (A registered before B, which makes the
//! direction deterministic). A handler that reads a table it also writes
//! gets a self-loop: its instances must run serially, though still in
//! parallel with unrelated handlers. The layering drives the scheduler.

use std::collections::{BTreeMap, BTreeSet};

/// Degree of cross-handler concurrency. `Serial` degenerates the graph into
/// a single chain in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    #[default]
    Dag,
    Serial,
}

/// Read/write footprint of one indexing function, as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub name: String,
    pub reads: BTreeSet<String>,
    pub writes: BTreeSet<String>,
}

impl HandlerSpec {
    pub fn new(
        name: impl Into<String>,
        reads: impl IntoIterator<Item = impl Into<String>>,
        writes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            reads: reads.into_iter().map(Into::into).collect(),
            writes: writes.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Registration order.
    order: Vec<String>,
    /// Edges A → B: B depends on A.
    edges: BTreeMap<String, BTreeSet<String>>,
    self_loops: BTreeSet<String>,
}

impl DependencyGraph {
    pub fn build(specs: &[HandlerSpec], mode: ConcurrencyMode) -> Self {
        let order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut self_loops = BTreeSet::new();

        match mode {
            ConcurrencyMode::Serial => {
                // One chain in registration order; every handler also
                // serializes with itself.
                for pair in specs.windows(2) {
                    edges
                        .entry(pair[0].name.clone())
                        .or_default()
                        .insert(pair[1].name.clone());
                }
                self_loops.extend(order.iter().cloned());
            }
            ConcurrencyMode::Dag => {
                for (i, a) in specs.iter().enumerate() {
                    if !a.reads.is_disjoint(&a.writes) {
                        self_loops.insert(a.name.clone());
                    }
                    for b in specs.iter().skip(i + 1) {
                        let conflict = !a.writes.is_disjoint(&b.reads)
                            || !a.writes.is_disjoint(&b.writes)
                            || !a.reads.is_disjoint(&b.writes);
                        if conflict {
                            edges
                                .entry(a.name.clone())
                                .or_default()
                                .insert(b.name.clone());
                        }
                    }
                }
            }
        }

        Self {
            order,
            edges,
            self_loops,
        }
    }

    pub fn has_self_loop(&self, name: &str) -> bool {
        self.self_loops.contains(name)
    }

    pub fn dependents(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(name)
    }

    /// Topological layers: every handler appears after all handlers with an
    /// edge into it. Within a layer there are no edges, so layer members may
    /// run concurrently.
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> =
            self.order.iter().map(|n| (n.as_str(), 0)).collect();
        for targets in self.edges.values() {
            for target in targets {
                *indegree.entry(target.as_str()).or_insert(0) += 1;
            }
        }

        let mut layers = Vec::new();
        let mut remaining: Vec<&str> = self.order.iter().map(String::as_str).collect();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|n| indegree.get(n).copied().unwrap_or(0) == 0)
                .collect();
            debug_assert!(!ready.is_empty(), "dependency graph has a cycle");
            if ready.is_empty() {
                // Defensive: surface remaining nodes as one final layer
                // rather than looping forever.
                layers.push(remaining.iter().map(|n| n.to_string()).collect());
                break;
            }
            for name in &ready {
                if let Some(targets) = self.edges.get(*name) {
                    for target in targets {
                        if let Some(d) = indegree.get_mut(target.as_str()) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
            remaining.retain(|n| !ready.contains(n));
            layers.push(ready.into_iter().map(|n| n.to_string()).collect());
        }
        layers
    }
}
