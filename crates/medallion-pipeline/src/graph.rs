//! Dependency graph between pipeline nodes.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use medallion_types::{MedallionError, Result};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Node names in declaration order.
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// Upstream node names per node, restricted to declared nodes.
    upstream: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build from `(node, dependencies)` pairs in declaration order.
    /// Dependencies on undeclared nodes are ignored.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<String>)>,
        S: Into<String>,
    {
        let pairs: Vec<(String, Vec<String>)> =
            nodes.into_iter().map(|(n, deps)| (n.into(), deps)).collect();
        let mut index = HashMap::new();
        for (i, (name, _)) in pairs.iter().enumerate() {
            index.entry(name.clone()).or_insert(i);
        }
        let upstream = pairs
            .iter()
            .map(|(_, deps)| {
                let mut out: Vec<String> = Vec::new();
                for d in deps {
                    if index.contains_key(d) && !out.contains(d) {
                        out.push(d.clone());
                    }
                }
                out
            })
            .collect();
        Self {
            names: pairs.into_iter().map(|(n, _)| n).collect(),
            index,
            upstream,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn upstream(&self, name: &str) -> &[String] {
        self.index
            .get(name)
            .map(|&i| self.upstream[i].as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependents, in declaration order.
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.names
            .iter()
            .zip(&self.upstream)
            .filter(|(_, ups)| ups.iter().any(|u| u == name))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Transitive dependents, in declaration order.
    pub fn descendants(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        while let Some(current) = queue.pop_front() {
            for d in self.downstream(current) {
                if seen.insert(d) {
                    queue.push_back(d);
                }
            }
        }
        self.names
            .iter()
            .filter(|n| seen.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: Vec<usize> = self.upstream.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(i) = ready.pop_first() {
            let name = &self.names[i];
            order.push(name.clone());
            for (j, ups) in self.upstream.iter().enumerate() {
                if ups.contains(name) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
        }

        if order.len() < self.names.len() {
            let cycle = self.find_cycle().unwrap_or_default();
            return Err(MedallionError::ConfigError(format!(
                "dependency cycle detected: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(order)
    }

    /// Nodes grouped by depth: a node's depth is one more than its deepest
    /// dependency. Nodes of equal depth do not depend on each other.
    pub fn levels(&self) -> Result<Vec<Vec<String>>> {
        let order = self.topological_order()?;
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();
        for name in &order {
            let d = self
                .upstream(name)
                .iter()
                .filter_map(|u| depth.get(u.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name, d);
            if levels.len() <= d {
                levels.resize_with(d + 1, Vec::new);
            }
            levels[d].push(name.clone());
        }
        Ok(levels)
    }

    /// A cycle as a closed path (`a -> b -> a`), if any.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            i: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[i] = Mark::Active;
            stack.push(i);
            for up in &graph.upstream[i] {
                let j = graph.index[up];
                match marks[j] {
                    Mark::Active => {
                        let start = stack.iter().position(|&s| s == j).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|&s| graph.names[s].clone()).collect();
                        path.push(graph.names[j].clone());
                        return Some(path);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(graph, j, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.names.len()];
        let mut stack = Vec::new();
        for i in 0..self.names.len() {
            if marks[i] == Mark::New {
                if let Some(cycle) = visit(self, i, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        DependencyGraph::new(
            edges
                .iter()
                .map(|(n, deps)| (*n, deps.iter().map(|d| d.to_string()).collect())),
        )
    }

    #[test]
    fn topological_order_prefers_declaration_order() {
        let g = graph(&[
            ("gld", &["slv"]),
            ("slv", &["brz"]),
            ("meta", &[]),
            ("brz", &[]),
        ]);
        assert_eq!(g.topological_order().unwrap(), vec!["meta", "brz", "slv", "gld"]);
    }

    #[test]
    fn downstream_and_descendants() {
        let g = graph(&[
            ("brz", &[]),
            ("slv", &["brz"]),
            ("gld", &["slv"]),
            ("other", &[]),
        ]);
        assert_eq!(g.downstream("brz"), vec!["slv"]);
        assert_eq!(g.descendants("brz"), vec!["slv", "gld"]);
        assert!(g.descendants("other").is_empty());
        assert_eq!(g.upstream("gld"), &["slv".to_string()]);
    }

    #[test]
    fn levels_group_independent_nodes() {
        let g = graph(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &["a", "b"]),
            ("d", &["a"]),
            ("e", &["c"]),
        ]);
        assert_eq!(
            g.levels().unwrap(),
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
    }

    #[test]
    fn cycle_is_a_config_error() {
        let g = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);

        let err = g.topological_order().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_dependencies_are_ignored() {
        let g = graph(&[("slv", &["missing"])]);
        assert!(g.upstream("slv").is_empty());
        assert_eq!(g.topological_order().unwrap(), vec!["slv"]);
    }
}
