//! Node graph over a project definition.
//!
//! The orchestrator walks nodes, where a node is either a free step or a
//! block group. Edges whose endpoints live inside a group collapse onto the
//! enclosing group node at that scope; a group's interior is walked as its
//! own sub-orchestration with the same machinery.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{ProjectDefinition, StepType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeId {
    Step(Uuid),
    Group(Uuid),
}

#[derive(Debug, Clone)]
pub struct NodeEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub source_port: Option<String>,
    pub condition: Option<String>,
}

#[derive(Debug)]
pub struct NodeGraph {
    /// Nodes in definition order; ties in the ready set break on this.
    pub nodes: Vec<NodeId>,
    pub edges: Vec<NodeEdge>,
    pub in_edges: HashMap<NodeId, Vec<usize>>,
    pub out_edges: HashMap<NodeId, Vec<usize>>,
    /// Topological rank, used to order fan-in merges deterministically.
    pub rank: HashMap<NodeId, usize>,
}

/// Scope of a walk: the whole definition, or one group's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    TopLevel,
    Body(Uuid),
}

impl NodeGraph {
    pub fn build(def: &ProjectDefinition, scope: Scope) -> Result<Self, EngineError> {
        let membership: HashMap<Uuid, Uuid> = def
            .steps
            .iter()
            .filter_map(|s| s.block_group_id.map(|g| (s.id, g)))
            .collect();
        let parents: HashMap<Uuid, Option<Uuid>> = def
            .groups
            .iter()
            .map(|g| (g.id, g.parent_group_id))
            .collect();

        let mut nodes: Vec<NodeId> = Vec::new();
        for step in &def.steps {
            let in_scope = match scope {
                Scope::TopLevel => step.block_group_id.is_none(),
                Scope::Body(group_id) => step.block_group_id == Some(group_id),
            };
            if in_scope {
                nodes.push(NodeId::Step(step.id));
            }
        }
        for group in &def.groups {
            let in_scope = match scope {
                Scope::TopLevel => group.parent_group_id.is_none(),
                Scope::Body(group_id) => group.parent_group_id == Some(group_id),
            };
            if in_scope {
                nodes.push(NodeId::Group(group.id));
            }
        }
        let node_set: HashSet<NodeId> = nodes.iter().copied().collect();

        // Collapse each edge endpoint onto the node representing it at this
        // scope; edges with an endpoint outside the scope are not ours.
        let mut edges: Vec<NodeEdge> = Vec::new();
        for edge in &def.edges {
            let source = resolve_endpoint(
                edge.source_step_id,
                edge.source_group_id,
                &membership,
                &parents,
                &node_set,
            );
            let target = resolve_endpoint(
                edge.target_step_id,
                edge.target_group_id,
                &membership,
                &parents,
                &node_set,
            );
            let (Some(source), Some(target)) = (source, target) else {
                continue;
            };
            if source == target {
                // Interior edge of a collapsed group.
                continue;
            }
            edges.push(NodeEdge {
                source,
                target,
                source_port: edge.source_port.clone(),
                condition: edge.condition.clone(),
            });
        }

        let mut in_edges: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut out_edges: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for node in &nodes {
            in_edges.entry(*node).or_default();
            out_edges.entry(*node).or_default();
        }
        for (idx, edge) in edges.iter().enumerate() {
            out_edges.entry(edge.source).or_default().push(idx);
            in_edges.entry(edge.target).or_default().push(idx);
        }

        let rank = topological_rank(&nodes, &edges)?;

        Ok(Self {
            nodes,
            edges,
            in_edges,
            out_edges,
            rank,
        })
    }

    /// Nodes with no incoming edges at this scope.
    pub fn entries(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .copied()
            .filter(|node| self.in_edges.get(node).map(|e| e.is_empty()).unwrap_or(true))
            .collect()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.rank.contains_key(&node)
    }

    /// Sub-graph induced by `keep`, used to run one connected component of a
    /// parallel group body in isolation.
    pub fn restrict(&self, keep: &HashSet<NodeId>) -> Self {
        let nodes: Vec<NodeId> = self.nodes.iter().copied().filter(|n| keep.contains(n)).collect();
        let edges: Vec<NodeEdge> = self
            .edges
            .iter()
            .filter(|e| keep.contains(&e.source) && keep.contains(&e.target))
            .cloned()
            .collect();

        let mut in_edges: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut out_edges: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for node in &nodes {
            in_edges.entry(*node).or_default();
            out_edges.entry(*node).or_default();
        }
        for (idx, edge) in edges.iter().enumerate() {
            out_edges.entry(edge.source).or_default().push(idx);
            in_edges.entry(edge.target).or_default().push(idx);
        }
        let rank = nodes
            .iter()
            .map(|n| (*n, self.rank[n]))
            .collect();

        Self {
            nodes,
            edges,
            in_edges,
            out_edges,
            rank,
        }
    }

    /// Weakly connected components, each returned as its node set.
    pub fn components(&self) -> Vec<HashSet<NodeId>> {
        let mut remaining: HashSet<NodeId> = self.nodes.iter().copied().collect();
        let mut components = Vec::new();
        // Seed from nodes in definition order for a stable result.
        for seed in &self.nodes {
            if !remaining.contains(seed) {
                continue;
            }
            let mut component = HashSet::new();
            let mut frontier = vec![*seed];
            while let Some(node) = frontier.pop() {
                if !remaining.remove(&node) {
                    continue;
                }
                component.insert(node);
                for edge in &self.edges {
                    if edge.source == node && remaining.contains(&edge.target) {
                        frontier.push(edge.target);
                    }
                    if edge.target == node && remaining.contains(&edge.source) {
                        frontier.push(edge.source);
                    }
                }
            }
            components.push(component);
        }
        components
    }
}

fn resolve_endpoint(
    step_id: Option<Uuid>,
    group_id: Option<Uuid>,
    membership: &HashMap<Uuid, Uuid>,
    parents: &HashMap<Uuid, Option<Uuid>>,
    node_set: &HashSet<NodeId>,
) -> Option<NodeId> {
    // Walk outward from the endpoint until we hit a node of this scope.
    let mut candidate = match (step_id, group_id) {
        (Some(step), _) => {
            if node_set.contains(&NodeId::Step(step)) {
                return Some(NodeId::Step(step));
            }
            NodeId::Group(*membership.get(&step)?)
        }
        (None, Some(group)) => NodeId::Group(group),
        (None, None) => return None,
    };
    for _ in 0..parents.len() + 1 {
        if node_set.contains(&candidate) {
            return Some(candidate);
        }
        let NodeId::Group(group) = candidate else {
            return None;
        };
        candidate = NodeId::Group((*parents.get(&group)?)?);
    }
    None
}

fn topological_rank(
    nodes: &[NodeId],
    edges: &[NodeEdge],
) -> Result<HashMap<NodeId, usize>, EngineError> {
    let mut graph = DiGraph::<NodeId, ()>::with_capacity(nodes.len(), edges.len());
    let mut indices: HashMap<NodeId, petgraph::graph::NodeIndex> =
        HashMap::with_capacity(nodes.len());
    for node in nodes {
        indices.insert(*node, graph.add_node(*node));
    }
    for edge in edges {
        graph.add_edge(indices[&edge.source], indices[&edge.target], ());
    }

    let order = toposort(&graph, None).map_err(|_| EngineError::CycleDetected)?;
    Ok(order
        .into_iter()
        .enumerate()
        .map(|(rank, idx)| (graph[idx], rank))
        .collect())
}

/// Structural validation of a definition: step invariants, edge endpoints,
/// acyclic top level and group bodies, tree-shaped group nesting, no start
/// steps inside groups.
pub fn validate_definition(def: &ProjectDefinition) -> Result<(), EngineError> {
    for step in &def.steps {
        step.validate()
            .map_err(|reason| EngineError::InvalidState(format!("step '{}': {reason}", step.name)))?;
    }

    for edge in &def.edges {
        edge.validate()
            .map_err(EngineError::InvalidState)?;
        if let Some(step_id) = edge.source_step_id {
            if def.step(step_id).is_none() {
                return Err(EngineError::StepNotFound(step_id));
            }
        }
        if let Some(step_id) = edge.target_step_id {
            if def.step(step_id).is_none() {
                return Err(EngineError::StepNotFound(step_id));
            }
        }
        for group_id in [edge.source_group_id, edge.target_group_id].into_iter().flatten() {
            if def.group(group_id).is_none() {
                return Err(EngineError::InvalidState(format!("unknown group {group_id}")));
            }
        }
    }

    // Group nesting must form a tree.
    for group in &def.groups {
        let mut seen = HashSet::from([group.id]);
        let mut current = group.parent_group_id;
        while let Some(parent_id) = current {
            if !seen.insert(parent_id) {
                return Err(EngineError::InvalidState(format!(
                    "group nesting cycle involving '{}'",
                    group.name
                )));
            }
            current = def
                .group(parent_id)
                .ok_or_else(|| EngineError::InvalidState(format!("unknown parent group {parent_id}")))?
                .parent_group_id;
        }
    }

    for step in &def.steps {
        if step.step_type == StepType::Start && step.block_group_id.is_some() {
            return Err(EngineError::InvalidState(format!(
                "start step '{}' may not be inside a group",
                step.name
            )));
        }
    }

    NodeGraph::build(def, Scope::TopLevel)?;
    for group in &def.groups {
        NodeGraph::build(def, Scope::Body(group.id))?;
    }
    Ok(())
}

/// Which node an edge set would activate for an edge, given the branch (or
/// port) the source selected. The unified rule: an unlabelled edge is
/// always active; a labelled edge is active iff its label equals the
/// selected branch.
pub(crate) fn edge_active(edge: &NodeEdge, branch: Option<&str>) -> bool {
    match (&edge.source_port, branch) {
        (None, _) => true,
        (Some(port), Some(branch)) => port == branch,
        (Some(_), None) => false,
    }
}
