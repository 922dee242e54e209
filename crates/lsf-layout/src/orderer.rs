//! Deterministic ordering of a call graph.
//!
//! Links are emitted breadth-first starting from the source components
//! (in-degree 0, alphabetical). A component is only expanded once every
//! link entering it has been emitted, so an acyclic graph always comes out
//! in topological order. Links that can never be reached this way sit on
//! or behind a cycle; they are appended sorted by `(from, to)`.
//!
//! Ordering is total: it never fails, and the same input always produces
//! the same output regardless of the order links were declared in.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use lsf_core::{Component, ComponentLink, ScenarioLink};

/// A directed call-graph edge.
pub trait CallEdge {
    fn from(&self) -> &str;
    fn to(&self) -> &str;
}

impl CallEdge for ComponentLink {
    fn from(&self) -> &str {
        &self.from
    }

    fn to(&self) -> &str {
        &self.to
    }
}

impl CallEdge for ScenarioLink {
    fn from(&self) -> &str {
        &self.from
    }

    fn to(&self) -> &str {
        &self.to
    }
}

/// Result of ordering a set of links.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallGraphOrder {
    /// Indices into the input link slice, in emission order.
    pub link_order: Vec<usize>,
    /// Component names by first appearance in the link order.
    pub node_order: Vec<String>,
}

impl CallGraphOrder {
    /// Clone `links` into the computed order.
    pub fn apply<L: Clone>(&self, links: &[L]) -> Vec<L> {
        self.link_order.iter().map(|&i| links[i].clone()).collect()
    }
}

/// Order `links` deterministically.
pub fn order_call_graph<L: CallEdge>(links: &[L]) -> CallGraphOrder {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, link) in links.iter().enumerate() {
        in_degree.entry(link.from()).or_insert(0);
        *in_degree.entry(link.to()).or_insert(0) += 1;
        outgoing.entry(link.from()).or_default().push(i);
    }
    for edges in outgoing.values_mut() {
        edges.sort_by(|&a, &b| links[a].to().cmp(links[b].to()).then(a.cmp(&b)));
    }

    let mut remaining = in_degree.clone();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut order = CallGraphOrder::default();
    let mut seen_nodes: HashSet<&str> = HashSet::new();
    let mut visited = vec![false; links.len()];

    while let Some(node) = queue.pop_front() {
        if seen_nodes.insert(node) {
            order.node_order.push(node.to_string());
        }
        let Some(edges) = outgoing.get(node) else {
            continue;
        };
        for &i in edges {
            visited[i] = true;
            order.link_order.push(i);
            let target = links[i].to();
            if let Some(deg) = remaining.get_mut(target) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(target);
                }
            }
        }
    }

    // Whatever is left is part of, or downstream of, a cycle.
    let mut leftover: Vec<usize> = (0..links.len()).filter(|&i| !visited[i]).collect();
    leftover.sort_by(|&a, &b| {
        (links[a].from(), links[a].to(), a).cmp(&(links[b].from(), links[b].to(), b))
    });
    for i in leftover {
        order.link_order.push(i);
        for name in [links[i].from(), links[i].to()] {
            if seen_nodes.insert(name) {
                order.node_order.push(name.to_string());
            }
        }
    }

    order
}

/// Components in call-graph order, isolated ones appended alphabetically.
///
/// Names that appear in links but were never declared are skipped.
pub fn order_components<'a>(
    components: &'a [Component],
    order: &CallGraphOrder,
) -> Vec<&'a Component> {
    let by_name: BTreeMap<&str, &Component> =
        components.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(components.len());
    for name in &order.node_order {
        if let Some((&key, &component)) = by_name.get_key_value(name.as_str()) {
            if placed.insert(key) {
                ordered.push(component);
            }
        }
    }
    // BTreeMap iteration is already alphabetical.
    for (name, component) in &by_name {
        if !placed.contains(name) {
            ordered.push(*component);
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use lsf_core::InvocationRate;

    use super::*;

    fn link(from: &str, to: &str) -> ComponentLink {
        ComponentLink {
            from: from.to_string(),
            to: to.to_string(),
            invocation_rate: InvocationRate { min: 1.0, max: 1.0 },
            data_delay_ms: 0,
        }
    }

    fn component(name: &str) -> Component {
        Component {
            name: name.to_string(),
            memory_mb: 128,
            runtime_ms: 100,
            files: Vec::new(),
        }
    }

    fn pairs(links: &[ComponentLink], order: &CallGraphOrder) -> Vec<(String, String)> {
        order
            .apply(links)
            .into_iter()
            .map(|l| (l.from, l.to))
            .collect()
    }

    fn pair(from: &str, to: &str) -> (String, String) {
        (from.to_string(), to.to_string())
    }

    fn assert_topological(links: &[ComponentLink], order: &CallGraphOrder) {
        let position = |name: &str| order.node_order.iter().position(|n| n == name).unwrap();
        for l in links {
            assert!(
                position(&l.from) < position(&l.to),
                "{} must precede {}",
                l.from,
                l.to
            );
        }
        // Every link leaving a component comes after every link entering it.
        let emitted = order.apply(links);
        for (i, a) in emitted.iter().enumerate() {
            for b in &emitted[..i] {
                assert!(b.from != a.to, "{}→{} emitted after {}→{}", b.from, b.to, a.from, a.to);
            }
        }
    }

    #[test]
    fn chain_keeps_call_order() {
        let links = vec![link("c", "d"), link("a", "b"), link("b", "c")];
        let order = order_call_graph(&links);

        assert_eq!(
            pairs(&links, &order),
            vec![pair("a", "b"), pair("b", "c"), pair("c", "d")]
        );
        assert_eq!(order.node_order, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn diamond_is_topological() {
        let links = vec![
            link("c", "d"),
            link("a", "c"),
            link("b", "d"),
            link("a", "b"),
        ];
        let order = order_call_graph(&links);

        assert_eq!(
            pairs(&links, &order),
            vec![pair("a", "b"), pair("a", "c"), pair("b", "d"), pair("c", "d")]
        );
        assert_eq!(order.node_order, vec!["a", "b", "c", "d"]);
        assert_topological(&links, &order);
    }

    #[test]
    fn join_waits_for_all_predecessors() {
        // `z` is reached from `a` early but also from the longer `a→m→n` chain.
        let links = vec![
            link("a", "z"),
            link("a", "m"),
            link("m", "n"),
            link("n", "z"),
            link("z", "out"),
        ];
        let order = order_call_graph(&links);
        assert_topological(&links, &order);
        assert_eq!(order.node_order, vec!["a", "m", "n", "z", "out"]);
    }

    #[test]
    fn multiple_sources_are_alphabetical() {
        let links = vec![link("y", "sink"), link("x", "sink")];
        let order = order_call_graph(&links);
        assert_eq!(order.node_order, vec!["x", "y", "sink"]);
    }

    #[test]
    fn cycle_degrades_to_sorted_tail() {
        let links = vec![link("c", "b"), link("b", "c"), link("a", "b")];
        let order = order_call_graph(&links);

        // `a→b` is reachable; the b↔c cycle never frees up and is sorted.
        assert_eq!(
            pairs(&links, &order),
            vec![pair("a", "b"), pair("b", "c"), pair("c", "b")]
        );
        assert_eq!(order.node_order, vec!["a", "b", "c"]);
    }

    #[test]
    fn pure_cycle_has_no_sources() {
        let links = vec![link("b", "a"), link("a", "b")];
        let order = order_call_graph(&links);
        assert_eq!(pairs(&links, &order), vec![pair("a", "b"), pair("b", "a")]);
        assert_eq!(order.node_order, vec!["a", "b"]);
    }

    #[test]
    fn ordering_ignores_declaration_order() {
        let mut links = vec![
            link("gateway", "auth"),
            link("gateway", "catalog"),
            link("catalog", "pricing"),
            link("auth", "users"),
            link("pricing", "catalog"),
        ];
        let first = pairs(&links, &order_call_graph(&links));
        links.reverse();
        let second = pairs(&links, &order_call_graph(&links));
        links.swap(0, 3);
        let third = pairs(&links, &order_call_graph(&links));

        assert_eq!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn empty_input() {
        let order = order_call_graph::<ComponentLink>(&[]);
        assert!(order.link_order.is_empty());
        assert!(order.node_order.is_empty());
    }

    #[test]
    fn isolated_components_appended_alphabetically() {
        let components = vec![
            component("zeta"),
            component("b"),
            component("alpha"),
            component("a"),
        ];
        let links = vec![link("b", "a")];
        let order = order_call_graph(&links);

        let names: Vec<&str> = order_components(&components, &order)
            .into_iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a", "alpha", "zeta"]);
    }

    #[test]
    fn undeclared_link_endpoints_are_skipped() {
        let components = vec![component("a")];
        let links = vec![link("a", "ghost")];
        let order = order_call_graph(&links);

        let names: Vec<&str> = order_components(&components, &order)
            .into_iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a"]);
    }
}
