use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::actions::{ActionDef, ActionRegistry};
use crate::error::{Result, TransitionError};
use crate::models::{AssetKind, Transition};

/// Action name → names of the actions that must run after it.
pub type ActionGraph = BTreeMap<String, Vec<String>>;

/// Build the `run_after` graph of `actions`.
///
/// Requirements naming actions outside `actions` are dropped.
pub fn create_graph_from_actions(
    actions: &[String],
    registry: &ActionRegistry,
    kind: AssetKind,
) -> Result<ActionGraph> {
    let names: BTreeSet<&str> = actions.iter().map(String::as_str).collect();
    let mut graph = ActionGraph::new();
    for name in actions {
        let action = registry.get(kind, name)?;
        graph.entry(name.clone()).or_default();
        for requirement in &action.run_after {
            graph
                .entry(requirement.clone())
                .or_default()
                .push(name.clone());
        }
    }
    graph.retain(|name, _| names.contains(name.as_str()));
    Ok(graph)
}

/// Kahn's algorithm; among ready nodes the smallest name goes first.
pub fn sort_graph_topologically(graph: &ActionGraph) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
    for dependents in graph.values() {
        for dependent in dependents {
            *in_degree.entry(dependent.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(current) = ready.pop_first() {
        order.push(current.to_string());
        if let Some(dependents) = graph.get(current) {
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(dependent.as_str());
                    }
                }
            }
        }
    }

    if order.len() != in_degree.len() {
        let stuck = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(TransitionError::CyclicActions(stuck));
    }
    Ok(order)
}

/// The transition's actions in an order satisfying every `run_after`.
pub fn order_actions_by_requirements<'r>(
    transition: &Transition,
    registry: &'r ActionRegistry,
) -> Result<Vec<&'r ActionDef>> {
    let kind = transition.model.kind;
    let graph = create_graph_from_actions(&transition.actions, registry, kind)?;
    let order = sort_graph_topologically(&graph)?;
    debug!(transition = %transition, order = ?order, "Ordered actions");
    order.iter().map(|name| registry.get(kind, name)).collect()
}
