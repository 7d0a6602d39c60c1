//! DAG builder, cycle detection, and the flattened execution plan.
//!
//! Uses `petgraph` to model step dependencies as a directed graph. Topological
//! sort detects cycles, and depth-based grouping produces waves where all
//! steps in a wave can run concurrently. The plan flattens the waves into a
//! single step order; a step's position in that order is its step index.

use std::collections::HashMap;
use std::ops::Range;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rewind_types::workflow::{StepDefinition, WorkflowDefinition};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the dependency graph (edge from dependency to dependent) and sort it.
fn sorted_graph(
    steps: &[StepDefinition],
) -> Result<(DiGraph<&str, ()>, Vec<NodeIndex>), WorkflowError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for (to_idx, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                WorkflowError::UnknownDependency(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{}'", node_id))
    })?;

    Ok((graph, sorted))
}

/// Validate that steps form a valid DAG (no cycles, all references exist).
pub fn validate_dag(steps: &[StepDefinition]) -> Result<(), WorkflowError> {
    sorted_graph(steps).map(|_| ())
}

/// Group steps into waves by dependency depth.
///
/// Index 0 is the first wave to execute. Within a wave, steps keep their
/// definition order.
pub fn build_execution_plan<'a>(
    steps: &'a [StepDefinition],
) -> Result<Vec<Vec<&'a StepDefinition>>, WorkflowError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let (graph, sorted) = sorted_graph(steps)?;
    let id_to_step: HashMap<&str, &StepDefinition> =
        steps.iter().map(|s| (s.id.as_str(), s)).collect();

    // Root nodes have depth 0
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for &node_idx in &sorted {
        let step_id = graph[node_idx];
        let step = id_to_step[step_id];
        let depth = step
            .depends_on
            .iter()
            .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(step_id, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&StepDefinition>> = vec![vec![]; max_depth + 1];
    for step in steps {
        waves[depths[step.id.as_str()]].push(step);
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// ExecutionPlan
// ---------------------------------------------------------------------------

/// Owned, flattened execution order for one workflow.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    steps: Vec<StepDefinition>,
    waves: Vec<Range<usize>>,
}

impl ExecutionPlan {
    /// Plan a workflow: waves by dependency depth, flattened in wave order.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let waves_refs = build_execution_plan(&definition.steps)?;

        let mut steps = Vec::with_capacity(definition.steps.len());
        let mut waves = Vec::with_capacity(waves_refs.len());
        for wave in waves_refs {
            let start = steps.len();
            steps.extend(wave.into_iter().cloned());
            waves.push(start..steps.len());
        }

        Ok(Self { steps, waves })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&StepDefinition> {
        self.steps.get(index)
    }

    /// Step index of a step ID.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn waves(&self) -> &[Range<usize>] {
        &self.waves
    }

    /// The wave containing `index`, or `None` past the end of the plan.
    pub fn wave_containing(&self, index: usize) -> Option<Range<usize>> {
        self.waves.iter().find(|w| w.contains(&index)).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_types::workflow::{StepKind, WorkflowStatus};
    use uuid::Uuid;

    fn step(id: &str, depends_on: Vec<&str>) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Task,
            input: Default::default(),
            depends_on: depends_on.into_iter().map(String::from).collect(),
            retry: None,
            timeout_secs: None,
            checkpoint: false,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "plan-test".to_string(),
            description: None,
            status: WorkflowStatus::Active,
            steps,
            config: Default::default(),
        }
    }

    #[test]
    fn test_no_dependencies_single_wave() {
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec![])];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 1, "all independent steps -> single wave");
        assert_eq!(waves[0].len(), 3);
    }

    #[test]
    fn test_linear_chain() {
        let steps = vec![step("a", vec![]), step("b", vec!["a"]), step("c", vec!["b"])];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[2][0].id, "c");
    }

    #[test]
    fn test_diamond() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["a"]),
            step("d", vec!["b", "c"]),
        ];
        let waves = build_execution_plan(&steps).unwrap();
        let ids: Vec<Vec<&str>> = waves
            .iter()
            .map(|w| w.iter().map(|s| s.id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_depth_uses_longest_path() {
        // d depends on a (depth 0) and c (depth 2) -> depth 3
        let steps = vec![
            step("d", vec!["a", "c"]),
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
        ];
        let waves = build_execution_plan(&steps).unwrap();
        assert_eq!(waves.len(), 4);
        assert_eq!(waves[3][0].id, "d");
    }

    #[test]
    fn test_cycle_detected() {
        let steps = vec![step("a", vec!["c"]), step("b", vec!["a"]), step("c", vec!["b"])];
        assert!(matches!(
            build_execution_plan(&steps),
            Err(WorkflowError::CycleDetected(_))
        ));
        assert!(validate_dag(&steps).is_err());
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let steps = vec![step("a", vec!["a"])];
        assert!(matches!(validate_dag(&steps), Err(WorkflowError::CycleDetected(_))));
    }

    #[test]
    fn test_plan_flattens_waves_into_step_indices() {
        let def = workflow(vec![
            step("join", vec!["left", "right"]),
            step("left", vec!["root"]),
            step("root", vec![]),
            step("right", vec!["root"]),
        ]);
        let plan = ExecutionPlan::build(&def).unwrap();
        let order: Vec<&str> = plan.steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["root", "left", "right", "join"]);
        assert_eq!(plan.waves(), &[0..1, 1..3, 3..4]);
        assert_eq!(plan.index_of("right"), Some(2));
        assert_eq!(plan.wave_containing(2), Some(1..3));
        assert_eq!(plan.wave_containing(4), None);
        assert_eq!(plan.len(), 4);
    }
}
