//! Dependency resolution for agent tasks.
//!
//! Converts a flat list of [`AgentNode`]s into an [`ExecutionGraph`]: a
//! deterministic topological order, the critical path by estimated duration,
//! and the wave partition ([`ParallelGroup`]s) the executor runs group by group.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::duration_ms;

/// Errors raised while building an execution graph.
///
/// All of these are configuration errors: retrying the same input fails the same way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("agent id must not be empty")]
    EmptyId,

    #[error("duplicate agent id: {0}")]
    DuplicateId(String),

    #[error("agent {0} depends on itself")]
    SelfDependency(String),

    #[error("agent {agent} depends on unknown agent {dependency}")]
    MissingDependency { agent: String, dependency: String },

    #[error("dependency cycle detected among: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("no eligible agents for group {group}; unassigned: {}", .remaining.join(", "))]
    StalledGroup { group: usize, remaining: Vec<String> },
}

/// One unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    /// Unique agent identifier.
    pub id: String,
    /// Phase the agent belongs to.
    #[serde(default)]
    pub phase_id: String,
    /// Agents that must terminate before this one starts.
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<String>,
    /// Agents that depend on this one. Derived on every build; input values are ignored.
    #[serde(default, skip_deserializing)]
    pub dependents: Vec<String>,
    /// Estimated wall-clock duration.
    #[serde(default, rename = "estimated_duration_ms", with = "duration_ms")]
    pub estimated_duration: Duration,
    /// Estimated resource cost.
    #[serde(default)]
    pub estimated_cost: f64,
    /// Higher runs first among simultaneously ready agents.
    #[serde(default)]
    pub priority: i32,
    /// Set when the agent lies on the critical path.
    #[serde(default, skip_deserializing)]
    pub is_critical: bool,
    /// Opaque configuration handed to the agent executor.
    #[serde(default)]
    pub config: Value,
}

impl AgentNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase_id: String::new(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            estimated_duration: Duration::ZERO,
            estimated_cost: 0.0,
            priority: 0,
            is_critical: false,
            config: Value::Null,
        }
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = phase_id.into();
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A wave of mutually independent agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelGroup {
    /// Position of the group in execution order.
    pub index: usize,
    /// Member agent ids, in ready order.
    pub agents: Vec<String>,
    /// Agents from earlier groups whose completion unblocked these members.
    pub dependencies: Vec<String>,
    /// Longest member estimate; members run concurrently.
    #[serde(rename = "estimated_duration_ms", with = "duration_ms")]
    pub estimated_duration: Duration,
}

impl ParallelGroup {
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// A validated, wave-partitioned execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub nodes: HashMap<String, AgentNode>,
    pub execution_order: Vec<String>,
    pub parallel_groups: Vec<ParallelGroup>,
    pub critical_path: Vec<String>,
    #[serde(rename = "critical_path_duration_ms", with = "duration_ms")]
    pub critical_path_duration: Duration,
    /// Sum of group durations.
    #[serde(rename = "estimated_total_duration_ms", with = "duration_ms")]
    pub estimated_total_duration: Duration,
    pub estimated_total_cost: f64,
}

impl ExecutionGraph {
    pub fn node(&self, id: &str) -> Option<&AgentNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index of the group containing `id`.
    pub fn group_of(&self, id: &str) -> Option<usize> {
        self.parallel_groups
            .iter()
            .find(|group| group.agents.iter().any(|agent| agent == id))
            .map(|group| group.index)
    }

    /// Nodes in execution order.
    pub fn ordered_nodes(&self) -> impl Iterator<Item = &AgentNode> {
        self.execution_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Check that `execution_order` places every node after all of its dependencies.
    pub fn is_valid_linear_extension(&self) -> bool {
        if self.execution_order.len() != self.nodes.len() {
            return false;
        }
        let position: HashMap<&str, usize> = self
            .execution_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        self.nodes.values().all(|node| {
            let Some(own) = position.get(node.id.as_str()) else {
                return false;
            };
            node.dependencies
                .iter()
                .all(|dep| position.get(dep.as_str()).is_some_and(|p| p < own))
        })
    }
}

/// Builds [`ExecutionGraph`]s from agent descriptors.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraphBuilder;

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Validate the nodes and produce the execution plan.
    pub fn build(&self, nodes: Vec<AgentNode>) -> Result<ExecutionGraph, GraphError> {
        let mut nodes = validate(nodes)?;
        derive_dependents(&mut nodes);

        let execution_order = topological_order(&nodes)?;
        let (critical_path, critical_path_duration) = critical_path(&nodes, &execution_order);
        for id in &critical_path {
            if let Some(node) = nodes.iter_mut().find(|n| &n.id == id) {
                node.is_critical = true;
            }
        }

        let parallel_groups = parallel_groups(&nodes, &execution_order)?;
        let estimated_total_duration = parallel_groups
            .iter()
            .map(|group| group.estimated_duration)
            .sum();
        let estimated_total_cost = nodes.iter().map(|node| node.estimated_cost).sum();

        Ok(ExecutionGraph {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            execution_order,
            parallel_groups,
            critical_path,
            critical_path_duration,
            estimated_total_duration,
            estimated_total_cost,
        })
    }
}

fn validate(mut nodes: Vec<AgentNode>) -> Result<Vec<AgentNode>, GraphError> {
    let all: HashSet<String> = nodes.iter().map(|n| n.id.clone()).collect();
    let mut seen = HashSet::new();

    for node in &mut nodes {
        if node.id.trim().is_empty() {
            return Err(GraphError::EmptyId);
        }
        if !seen.insert(node.id.clone()) {
            return Err(GraphError::DuplicateId(node.id.clone()));
        }

        let mut unique = HashSet::new();
        node.dependencies.retain(|dep| unique.insert(dep.clone()));

        for dep in &node.dependencies {
            if dep == &node.id {
                return Err(GraphError::SelfDependency(node.id.clone()));
            }
            if !all.contains(dep) {
                return Err(GraphError::MissingDependency {
                    agent: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    Ok(nodes)
}

fn derive_dependents(nodes: &mut [AgentNode]) {
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for node in nodes.iter() {
        for dep in &node.dependencies {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(node.id.clone());
        }
    }
    for node in nodes.iter_mut() {
        node.dependents = dependents.remove(&node.id).unwrap_or_default();
    }
}

/// Kahn's algorithm. The ready queue is kept sorted by descending priority;
/// equal priorities keep insertion order.
fn topological_order(nodes: &[AgentNode]) -> Result<Vec<String>, GraphError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();

    let mut ready: VecDeque<usize> = VecDeque::new();
    for (i, degree) in in_degree.iter().enumerate() {
        if *degree == 0 {
            insert_by_priority(&mut ready, nodes, i);
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        order.push(nodes[i].id.clone());
        for dependent in &nodes[i].dependents {
            let Some(&j) = index.get(dependent.as_str()) else {
                continue;
            };
            in_degree[j] = in_degree[j].saturating_sub(1);
            if in_degree[j] == 0 {
                insert_by_priority(&mut ready, nodes, j);
            }
        }
    }

    if order.len() < nodes.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        return Err(GraphError::CycleDetected(cycle_members(nodes, &ordered)));
    }

    Ok(order)
}

fn insert_by_priority(ready: &mut VecDeque<usize>, nodes: &[AgentNode], i: usize) {
    let priority = nodes[i].priority;
    let position = ready
        .iter()
        .position(|&j| nodes[j].priority < priority)
        .unwrap_or(ready.len());
    ready.insert(position, i);
}

/// Nodes that sit on a cycle, as opposed to nodes merely downstream of one.
fn cycle_members(nodes: &[AgentNode], ordered: &HashSet<&str>) -> Vec<String> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes.iter().filter(|n| !ordered.contains(n.id.as_str())) {
        graph.add_node(node.id.as_str());
        for dep in &node.dependencies {
            if !ordered.contains(dep.as_str()) {
                graph.add_edge(dep.as_str(), node.id.as_str(), ());
            }
        }
    }

    let mut members: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| component.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect();

    if members.is_empty() {
        members = graph.nodes().map(str::to_string).collect();
    }
    members.sort();
    members
}

/// Forward pass over estimated durations, then backtrack from the latest finish.
fn critical_path(nodes: &[AgentNode], order: &[String]) -> (Vec<String>, Duration) {
    let by_id: HashMap<&str, &AgentNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut earliest_start: HashMap<&str, Duration> = HashMap::new();
    let mut parent: HashMap<&str, &str> = HashMap::new();

    for id in order {
        let Some(node) = by_id.get(id.as_str()) else {
            continue;
        };
        let mut start = Duration::ZERO;
        let mut latest: Option<&str> = None;
        for dep in &node.dependencies {
            let Some(dep_node) = by_id.get(dep.as_str()) else {
                continue;
            };
            let dep_finish = earliest_start
                .get(dep.as_str())
                .copied()
                .unwrap_or_default()
                + dep_node.estimated_duration;
            // First dependency wins ties.
            if latest.is_none() || dep_finish > start {
                start = dep_finish;
                latest = Some(dep_node.id.as_str());
            }
        }
        if let Some(dep) = latest {
            parent.insert(node.id.as_str(), dep);
        }
        earliest_start.insert(node.id.as_str(), start);
    }

    let mut end: Option<(&str, Duration)> = None;
    for id in order {
        let Some(node) = by_id.get(id.as_str()) else {
            continue;
        };
        let finish = earliest_start
            .get(id.as_str())
            .copied()
            .unwrap_or_default()
            + node.estimated_duration;
        if end.map_or(true, |(_, best)| finish > best) {
            end = Some((node.id.as_str(), finish));
        }
    }

    let Some((last, total)) = end else {
        return (Vec::new(), Duration::ZERO);
    };

    let mut path = vec![last.to_string()];
    let mut current = last;
    while let Some(&previous) = parent.get(current) {
        path.push(previous.to_string());
        current = previous;
    }
    path.reverse();
    (path, total)
}

fn parallel_groups(nodes: &[AgentNode], order: &[String]) -> Result<Vec<ParallelGroup>, GraphError> {
    let by_id: HashMap<&str, &AgentNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut planned: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&str> = order.iter().map(String::as_str).collect();
    let mut groups = Vec::new();

    while !remaining.is_empty() {
        let eligible: Vec<&str> = remaining
            .iter()
            .copied()
            .filter(|id| {
                by_id.get(id).is_some_and(|node| {
                    node.dependencies
                        .iter()
                        .all(|dep| planned.contains(dep.as_str()))
                })
            })
            .collect();

        if eligible.is_empty() {
            return Err(GraphError::StalledGroup {
                group: groups.len(),
                remaining: remaining.iter().map(|id| id.to_string()).collect(),
            });
        }

        let mut unblocked_by: Vec<String> = eligible
            .iter()
            .filter_map(|id| by_id.get(id))
            .flat_map(|node| node.dependencies.iter().cloned())
            .collect();
        unblocked_by.sort();
        unblocked_by.dedup();

        let estimated_duration = eligible
            .iter()
            .filter_map(|id| by_id.get(id))
            .map(|node| node.estimated_duration)
            .max()
            .unwrap_or_default();

        groups.push(ParallelGroup {
            index: groups.len(),
            agents: eligible.iter().map(|id| id.to_string()).collect(),
            dependencies: unblocked_by,
            estimated_duration,
        });

        planned.extend(eligible.iter().copied());
        remaining.retain(|id| !planned.contains(id));
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn build(nodes: Vec<AgentNode>) -> ExecutionGraph {
        DependencyGraphBuilder::new().build(nodes).expect("graph")
    }

    // ============================================================================
    // Topological order
    // ============================================================================

    #[test]
    fn test_two_roots_one_join_scenario() {
        let graph = build(vec![
            AgentNode::new("C").depends_on(["A", "B"]),
            AgentNode::new("B").with_priority(1),
            AgentNode::new("A").with_priority(2),
        ]);

        let groups: Vec<Vec<String>> = graph
            .parallel_groups
            .iter()
            .map(|g| g.agents.clone())
            .collect();
        assert_eq!(groups, vec![vec!["A", "B"], vec!["C"]]);
        assert_eq!(graph.execution_order, vec!["A", "B", "C"]);
        assert_eq!(graph.parallel_groups[1].dependencies, vec!["A", "B"]);
    }

    #[test]
    fn test_order_is_linear_extension_for_layered_graph() {
        let graph = build(vec![
            AgentNode::new("deploy").depends_on(["test", "docs"]),
            AgentNode::new("test").depends_on(["build"]),
            AgentNode::new("docs").depends_on(["design"]),
            AgentNode::new("build").depends_on(["design"]),
            AgentNode::new("design"),
            AgentNode::new("lint"),
        ]);

        assert!(graph.is_valid_linear_extension());
        assert_eq!(graph.execution_order.len(), 6);
    }

    #[test]
    fn test_newly_unblocked_nodes_are_ordered_by_priority() {
        let graph = build(vec![
            AgentNode::new("root"),
            AgentNode::new("low").depends_on(["root"]).with_priority(1),
            AgentNode::new("high").depends_on(["root"]).with_priority(9),
            AgentNode::new("mid").depends_on(["root"]).with_priority(5),
        ]);

        assert_eq!(graph.execution_order, vec!["root", "high", "mid", "low"]);
        assert_eq!(graph.parallel_groups[1].agents, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_equal_priorities_keep_input_order() {
        let graph = build(vec![
            AgentNode::new("x"),
            AgentNode::new("y"),
            AgentNode::new("z"),
        ]);
        assert_eq!(graph.execution_order, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_dependents_are_derived() {
        let mut stale = AgentNode::new("a");
        stale.dependents = vec!["ghost".to_string()];
        let graph = build(vec![
            stale,
            AgentNode::new("b").depends_on(["a"]),
            AgentNode::new("c").depends_on(["a"]),
        ]);

        assert_eq!(graph.node("a").expect("a").dependents, vec!["b", "c"]);
        assert!(graph.node("b").expect("b").dependents.is_empty());
    }

    // ============================================================================
    // Validation and cycles
    // ============================================================================

    #[test]
    fn test_cycle_is_rejected_with_members() {
        let result = DependencyGraphBuilder::new().build(vec![
            AgentNode::new("a").depends_on(["c"]),
            AgentNode::new("b").depends_on(["a"]),
            AgentNode::new("c").depends_on(["b"]),
            AgentNode::new("d").depends_on(["c"]),
            AgentNode::new("e"),
        ]);

        assert_eq!(
            result.unwrap_err(),
            GraphError::CycleDetected(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_self_dependency_is_rejected() {
        let result = DependencyGraphBuilder::new().build(vec![AgentNode::new("a").depends_on(["a"])]);
        assert_eq!(result.unwrap_err(), GraphError::SelfDependency("a".into()));
    }

    #[test]
    fn test_missing_dependency_is_rejected() {
        let result = DependencyGraphBuilder::new().build(vec![AgentNode::new("a").depends_on(["nope"])]);
        assert!(matches!(
            result.unwrap_err(),
            GraphError::MissingDependency { ref agent, ref dependency } if agent == "a" && dependency == "nope"
        ));
    }

    #[test]
    fn test_duplicate_and_empty_ids_are_rejected() {
        let duplicate = DependencyGraphBuilder::new().build(vec![AgentNode::new("a"), AgentNode::new("a")]);
        assert_eq!(duplicate.unwrap_err(), GraphError::DuplicateId("a".into()));

        let empty = DependencyGraphBuilder::new().build(vec![AgentNode::new("  ")]);
        assert_eq!(empty.unwrap_err(), GraphError::EmptyId);
    }

    #[test]
    fn test_repeated_dependency_entries_count_once() {
        let graph = build(vec![
            AgentNode::new("a"),
            AgentNode::new("b").depends_on(["a", "a"]),
        ]);
        assert_eq!(graph.execution_order, vec!["a", "b"]);
        assert_eq!(graph.node("b").expect("b").dependencies, vec!["a"]);
    }

    // ============================================================================
    // Groups and critical path
    // ============================================================================

    #[test]
    fn test_groups_cover_every_node_exactly_once() {
        let graph = build(vec![
            AgentNode::new("a"),
            AgentNode::new("b").depends_on(["a"]),
            AgentNode::new("c").depends_on(["a"]),
            AgentNode::new("d").depends_on(["b", "c"]),
            AgentNode::new("e").depends_on(["b"]),
            AgentNode::new("f"),
        ]);

        let mut members: Vec<&String> = graph
            .parallel_groups
            .iter()
            .flat_map(|g| g.agents.iter())
            .collect();
        let total = members.len();
        members.sort();
        members.dedup();
        assert_eq!(total, graph.len());
        assert_eq!(members.len(), graph.len());

        for node in graph.nodes.values() {
            let own = graph.group_of(&node.id).expect("grouped");
            for dep in &node.dependencies {
                assert!(graph.group_of(dep).expect("grouped") < own);
            }
        }
    }

    #[test]
    fn test_critical_path_follows_longest_chain() {
        let graph = build(vec![
            AgentNode::new("start").with_duration(ms(10)),
            AgentNode::new("fast").depends_on(["start"]).with_duration(ms(5)),
            AgentNode::new("slow").depends_on(["start"]).with_duration(ms(50)),
            AgentNode::new("finish").depends_on(["fast", "slow"]).with_duration(ms(10)),
            AgentNode::new("side").with_duration(ms(20)),
        ]);

        assert_eq!(graph.critical_path, vec!["start", "slow", "finish"]);
        assert_eq!(graph.critical_path_duration, ms(70));
        assert!(graph.node("slow").expect("slow").is_critical);
        assert!(!graph.node("fast").expect("fast").is_critical);
        assert!(!graph.node("side").expect("side").is_critical);
    }

    #[test]
    fn test_group_duration_is_max_of_members() {
        let graph = build(vec![
            AgentNode::new("a").with_duration(ms(30)).with_cost(1.5),
            AgentNode::new("b").with_duration(ms(80)).with_cost(2.5),
            AgentNode::new("c").depends_on(["a"]).with_duration(ms(10)),
        ]);

        assert_eq!(graph.parallel_groups[0].estimated_duration, ms(80));
        assert_eq!(graph.estimated_total_duration, ms(90));
        assert!((graph.estimated_total_cost - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_input_builds_empty_graph() {
        let graph = build(Vec::new());
        assert!(graph.is_empty());
        assert!(graph.parallel_groups.is_empty());
        assert!(graph.critical_path.is_empty());
    }

    #[test]
    fn test_node_deserializes_from_plan_json() {
        let node: AgentNode = serde_json::from_value(serde_json::json!({
            "id": "copy",
            "phase_id": "content",
            "depends_on": ["research"],
            "estimated_duration_ms": 1500,
            "priority": 3,
            "config": {"prompt": "write"}
        }))
        .expect("node");

        assert_eq!(node.dependencies, vec!["research"]);
        assert_eq!(node.estimated_duration, ms(1500));
        assert_eq!(node.priority, 3);
        assert!(!node.is_critical);
    }
}
