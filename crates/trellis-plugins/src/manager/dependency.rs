//! Plugin dependency graph

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::descriptor::PluginDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Edge {
    to: String,
    optional: bool,
}

/// Directed graph of plugin ids; an edge `a -> b` means `a` depends on `b`
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<Edge>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors<'a>(descriptors: impl IntoIterator<Item = &'a PluginDescriptor>) -> Self {
        let mut graph = Self::new();
        for descriptor in descriptors {
            graph.add(descriptor);
        }
        graph
    }

    /// Add or replace a node and its outgoing edges
    pub fn add(&mut self, descriptor: &PluginDescriptor) {
        let edges = descriptor
            .dependencies
            .iter()
            .map(|d| Edge {
                to: d.id.clone(),
                optional: d.optional,
            })
            .collect();
        self.edges.insert(descriptor.id.clone(), edges);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// A cycle through `start`, as a path that begins and ends with `start`.
    ///
    /// With `allow_optional` only required edges are followed, so cycles that
    /// include an optional edge are not reported.
    pub fn find_cycle(&self, start: &str, allow_optional: bool) -> Option<Vec<String>> {
        let mut path = vec![start.to_string()];
        let mut visited = BTreeSet::new();
        if self.walk(start, start, allow_optional, &mut path, &mut visited) {
            Some(path)
        } else {
            None
        }
    }

    fn walk(
        &self,
        node: &str,
        target: &str,
        allow_optional: bool,
        path: &mut Vec<String>,
        visited: &mut BTreeSet<String>,
    ) -> bool {
        let Some(edges) = self.edges.get(node) else {
            return false;
        };
        for edge in edges.iter().filter(|e| !(allow_optional && e.optional)) {
            if edge.to == target {
                path.push(edge.to.clone());
                return true;
            }
            if visited.insert(edge.to.clone()) {
                path.push(edge.to.clone());
                if self.walk(&edge.to, target, allow_optional, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// Registered plugins with an edge to `id`
    pub fn dependents_of(&self, id: &str, include_optional: bool) -> Vec<String> {
        self.edges
            .iter()
            .filter(|(_, edges)| {
                edges
                    .iter()
                    .any(|e| e.to == id && (include_optional || !e.optional))
            })
            .map(|(from, _)| from.clone())
            .collect()
    }

    /// Every node ordered so that dependents come before their dependencies.
    ///
    /// Edges to unknown nodes are ignored. Nodes caught in a cycle are
    /// appended in id order after everything else.
    pub fn teardown_order(&self) -> Vec<String> {
        // Count, for each node, how many known nodes depend on it
        let mut dependents: BTreeMap<&str, usize> =
            self.edges.keys().map(|k| (k.as_str(), 0)).collect();
        for edges in self.edges.values() {
            for edge in edges {
                if let Some(count) = dependents.get_mut(edge.to.as_str()) {
                    *count += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = dependents
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(id) = ready.pop_front() {
            order.push(id.to_string());
            for edge in self.edges.get(id).into_iter().flatten() {
                if let Some(count) = dependents.get_mut(edge.to.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(edge.to.as_str());
                    }
                }
            }
        }

        if order.len() < self.edges.len() {
            let placed: BTreeSet<String> = order.iter().cloned().collect();
            order.extend(self.edges.keys().filter(|k| !placed.contains(*k)).cloned());
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{PluginCategory, PluginDependency};

    fn plugin(id: &str, deps: &[(&str, bool)]) -> PluginDescriptor {
        deps.iter().fold(
            PluginDescriptor::new(id, id, "1.0.0", PluginCategory::Utility, "did:example:dev"),
            |d, (dep, optional)| {
                d.with_dependency(if *optional {
                    PluginDependency::optional(*dep, "*")
                } else {
                    PluginDependency::required(*dep, "*")
                })
            },
        )
    }

    #[test]
    fn test_no_cycle() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("a", &[]),
            plugin("b", &[("a", false)]),
            plugin("c", &[("a", false), ("b", false)]),
        ]);
        assert!(graph.find_cycle("c", true).is_none());
        assert!(graph.find_cycle("c", false).is_none());
    }

    #[test]
    fn test_required_cycle_always_found() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("a", &[("c", false)]),
            plugin("b", &[("a", false)]),
            plugin("c", &[("b", false)]),
        ]);
        assert_eq!(
            graph.find_cycle("a", true),
            Some(vec!["a".to_string(), "c".to_string(), "b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn test_optional_cycle_allowed_when_configured() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("a", &[("b", true)]),
            plugin("b", &[("a", false)]),
        ]);
        assert!(graph.find_cycle("b", true).is_none());
        assert!(graph.find_cycle("b", false).is_some());
    }

    #[test]
    fn test_dependents() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("a", &[]),
            plugin("b", &[("a", false)]),
            plugin("c", &[("a", true)]),
        ]);
        assert_eq!(graph.dependents_of("a", false), vec!["b".to_string()]);
        assert_eq!(graph.dependents_of("a", true), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_teardown_order_puts_dependents_first() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("crypto", &[]),
            plugin("did-key", &[("crypto", false)]),
            plugin("vc", &[("did-key", false), ("crypto", false)]),
            plugin("missing-dep", &[("ghost", false)]),
        ]);
        let order = graph.teardown_order();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();

        assert_eq!(order.len(), 4);
        assert!(pos("vc") < pos("did-key"));
        assert!(pos("did-key") < pos("crypto"));
    }

    #[test]
    fn test_teardown_order_survives_cycles() {
        let graph = DependencyGraph::from_descriptors(&[
            plugin("a", &[("b", true)]),
            plugin("b", &[("a", false)]),
            plugin("c", &[]),
        ]);
        assert_eq!(graph.teardown_order().len(), 3);
    }
}
