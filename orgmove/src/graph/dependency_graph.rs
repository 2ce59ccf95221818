//! Dependency graph over entities
//!
//! Edge A → B means "A has a lookup to B", so B must run first. Cycles are
//! allowed: strongly connected components are collapsed, the condensation is
//! sorted with Kahn's algorithm (ties broken by declaration order) and the
//! members of a component keep their declaration order. The record-type
//! entity is pinned first unconditionally.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Entity always scheduled first
pub const PINNED_ENTITY: &str = "RecordType";

/// Dependency graph for a set of entities
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Entity names in declaration order
    nodes: Vec<String>,
    index: HashMap<String, usize>,
    /// node -> nodes it depends on (self-references excluded)
    dependencies: Vec<BTreeSet<usize>>,
    self_references: HashSet<usize>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity; re-adding keeps its original declaration position
    pub fn add_entity(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        self.dependencies.push(BTreeSet::new());
        idx
    }

    /// Record that `from` has a lookup to `to` (both are added if missing)
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        let from_idx = self.add_entity(from);
        let to_idx = self.add_entity(to);
        if from_idx == to_idx {
            self.self_references.insert(from_idx);
        } else {
            self.dependencies[from_idx].insert(to_idx);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Entities in declaration order
    pub fn entities(&self) -> &[String] {
        &self.nodes
    }

    /// Entities `name` has lookups to
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&idx| {
                self.dependencies[idx]
                    .iter()
                    .map(|&d| self.nodes[d].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entities with lookups to `name`
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.index.get(name) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&target))
            .map(|(idx, _)| self.nodes[idx].as_str())
            .collect()
    }

    pub fn has_self_reference(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|idx| self.self_references.contains(idx))
    }

    /// Groups of two or more entities that depend on each other
    pub fn cycles(&self) -> Vec<Vec<String>> {
        self.components(None)
            .into_iter()
            .filter(|c| c.len() > 1)
            .map(|c| c.into_iter().map(|i| self.nodes[i].clone()).collect())
            .collect()
    }

    /// Total execution order (dependencies before dependents)
    pub fn execution_order(&self) -> Vec<String> {
        let pinned = self.index.get(PINNED_ENTITY).copied();
        let components = self.components(pinned);

        let mut component_of = vec![usize::MAX; self.nodes.len()];
        for (c, members) in components.iter().enumerate() {
            for &node in members {
                component_of[node] = c;
            }
        }

        // Component dependency counts and reverse edges
        let mut pending = vec![0usize; components.len()];
        let mut dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        for (c, members) in components.iter().enumerate() {
            let deps: BTreeSet<usize> = members
                .iter()
                .flat_map(|&node| self.dependencies[node].iter())
                .filter(|&&dep| Some(dep) != pinned)
                .map(|&dep| component_of[dep])
                .filter(|&dc| dc != c)
                .collect();
            pending[c] = deps.len();
            for dc in deps {
                dependents[dc].insert(c);
            }
        }

        // Ready components keyed by their earliest declaration index
        let key = |c: usize| components[c][0];
        let mut ready: BTreeSet<(usize, usize)> = (0..components.len())
            .filter(|&c| pending[c] == 0)
            .map(|c| (key(c), c))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        if let Some(p) = pinned {
            order.push(self.nodes[p].clone());
        }
        while let Some((_, c)) = ready.pop_first() {
            order.extend(components[c].iter().map(|&n| self.nodes[n].clone()));
            for &dependent in &dependents[c] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.insert((key(dependent), dependent));
                }
            }
        }
        order
    }

    /// Reverse of the execution order (dependents deleted first)
    pub fn delete_order(&self) -> Vec<String> {
        let mut order = self.execution_order();
        order.reverse();
        order
    }

    /// Strongly connected components (Tarjan), members sorted by declaration
    /// index, `skip` left out of the graph entirely
    fn components(&self, skip: Option<usize>) -> Vec<Vec<usize>> {
        struct Tarjan<'g> {
            graph: &'g DependencyGraph,
            skip: Option<usize>,
            counter: usize,
            index: Vec<Option<usize>>,
            low: Vec<usize>,
            on_stack: Vec<bool>,
            stack: Vec<usize>,
            components: Vec<Vec<usize>>,
        }

        impl Tarjan<'_> {
            fn visit(&mut self, v: usize) {
                self.index[v] = Some(self.counter);
                self.low[v] = self.counter;
                self.counter += 1;
                self.stack.push(v);
                self.on_stack[v] = true;

                for &w in &self.graph.dependencies[v] {
                    if Some(w) == self.skip {
                        continue;
                    }
                    match self.index[w] {
                        None => {
                            self.visit(w);
                            self.low[v] = self.low[v].min(self.low[w]);
                        }
                        Some(wi) if self.on_stack[w] => {
                            self.low[v] = self.low[v].min(wi);
                        }
                        _ => {}
                    }
                }

                if Some(self.low[v]) == self.index[v] {
                    let mut component = Vec::new();
                    while let Some(w) = self.stack.pop() {
                        self.on_stack[w] = false;
                        component.push(w);
                        if w == v {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }

        let n = self.nodes.len();
        let mut tarjan = Tarjan {
            graph: self,
            skip,
            counter: 0,
            index: vec![None; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        };
        for v in 0..n {
            if Some(v) != skip && tarjan.index[v].is_none() {
                tarjan.visit(v);
            }
        }
        tarjan.components
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(entities: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for entity in entities {
            graph.add_entity(entity);
        }
        for (from, to) in edges {
            graph.add_dependency(from, to);
        }
        graph
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|e| e == name).unwrap()
    }

    #[test]
    fn test_dependencies_first() {
        let g = graph(
            &["Contact", "Account", "RecordType"],
            &[("Contact", "Account"), ("Account", "RecordType")],
        );
        assert_eq!(g.execution_order(), vec!["RecordType", "Account", "Contact"]);
        assert_eq!(g.delete_order(), vec!["Contact", "Account", "RecordType"]);
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let g = graph(&["Product2", "Account", "Pricebook2"], &[]);
        assert_eq!(g.execution_order(), vec!["Product2", "Account", "Pricebook2"]);
    }

    #[test]
    fn test_record_type_pinned_first_even_when_declared_last() {
        let g = graph(
            &["Account", "Case", "RecordType"],
            &[("Case", "Account")],
        );
        assert_eq!(g.execution_order()[0], "RecordType");
    }

    #[test]
    fn test_every_edge_respected() {
        let edges = [
            ("OpportunityLineItem", "Opportunity"),
            ("OpportunityLineItem", "PricebookEntry"),
            ("PricebookEntry", "Product2"),
            ("PricebookEntry", "Pricebook2"),
            ("Opportunity", "Account"),
            ("Contact", "Account"),
            ("Case", "Contact"),
            ("Case", "Account"),
        ];
        let g = graph(
            &[
                "OpportunityLineItem",
                "Case",
                "Contact",
                "Opportunity",
                "PricebookEntry",
                "Pricebook2",
                "Product2",
                "Account",
            ],
            &edges,
        );
        let order = g.execution_order();
        assert_eq!(order.len(), 8);
        for (from, to) in edges {
            assert!(
                position(&order, to) < position(&order, from),
                "{} must run before {}",
                to,
                from
            );
        }
    }

    #[test]
    fn test_cycle_members_keep_declaration_order() {
        let g = graph(
            &["Contact", "Account", "Lead"],
            &[("Account", "Contact"), ("Contact", "Account"), ("Lead", "Account")],
        );
        assert_eq!(g.execution_order(), vec!["Contact", "Account", "Lead"]);
        assert_eq!(g.cycles(), vec![vec!["Contact".to_string(), "Account".to_string()]]);
    }

    #[test]
    fn test_self_reference_is_not_a_dependency() {
        let g = graph(&["Account"], &[("Account", "Account")]);
        assert!(g.has_self_reference("Account"));
        assert!(g.dependencies_of("Account").is_empty());
        assert_eq!(g.execution_order(), vec!["Account"]);
    }

    #[test]
    fn test_dependents_of() {
        let g = graph(
            &["Account", "Contact", "Case"],
            &[("Contact", "Account"), ("Case", "Account")],
        );
        assert_eq!(g.dependents_of("Account"), vec!["Contact", "Case"]);
        assert_eq!(g.dependencies_of("Case"), vec!["Account"]);
    }
}
