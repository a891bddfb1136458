//! Run orchestration: topological execution with branch pruning.
//!
//! The walk operates on a node graph (free steps + collapsed groups),
//! seeding the chosen start node and scheduling each node once every active
//! incoming edge has deposited its payload. Branch labels (`__branch` or a
//! group's out/error port) select among port-labelled edges; targets whose
//! incoming edges are all pruned become skipped, transitively. Fan-in
//! deep-merges deposits in predecessor topological-rank order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::graph::{edge_active, NodeGraph, NodeId, Scope};
use super::group_executor::GroupExecutor;
use super::step_executor::{StepExecutor, StepOutcome};
use super::RunContext;
use crate::blocks::deep_merge;
use crate::error::{EngineError, StepError};
use crate::expr::evaluate_bool;
use crate::model::{Run, RunStatus, StepRun, StepRunStatus};
use crate::storage::RunStore;

/// How a run left the orchestrator.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Value),
    /// A long wait suspended the walk; re-enqueue the job after `delay`.
    Suspended { delay: Duration },
}

/// Result of walking one scope (top level or a group body).
#[derive(Debug)]
pub(crate) enum WalkResult {
    Completed(WalkOutput),
    Suspended { delay: Duration },
}

#[derive(Debug)]
pub(crate) struct WalkOutput {
    /// Terminal node name -> output, in topological-rank order.
    pub terminals: Vec<(String, Value)>,
}

impl WalkOutput {
    /// Group bodies collapse a single terminal to its bare value.
    pub fn collapsed(self) -> Value {
        match self.terminals.len() {
            0 => Value::Object(Map::new()),
            1 => self.terminals.into_iter().next().expect("one terminal").1,
            _ => self.to_map(),
        }
    }

    pub fn to_map(&self) -> Value {
        Value::Object(
            self.terminals
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }
}

pub struct RunOrchestrator {
    step_executor: Arc<StepExecutor>,
    group_executor: Arc<GroupExecutor>,
    run_store: Arc<dyn RunStore>,
}

impl RunOrchestrator {
    pub fn new(
        step_executor: Arc<StepExecutor>,
        group_executor: Arc<GroupExecutor>,
        run_store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            step_executor,
            group_executor,
            run_store,
        }
    }

    /// Drive a run from its start step to a terminal state, updating the Run
    /// row as it goes. Outputs of steps completed by a prior worker attempt
    /// are honored without re-execution.
    pub async fn execute_run(&self, ctx: &RunContext, mut run: Run) -> Result<RunOutcome, EngineError> {
        run.start();
        self.run_store.update_run(run.clone()).await?;
        info!(run_id = %ctx.run_id, project_id = %ctx.project_id, "run started");

        let prior = Arc::new(self.completed_outputs(ctx.run_id).await?);
        let graph = NodeGraph::build(&ctx.definition, Scope::TopLevel)?;

        let start_node = NodeId::Step(run.start_step_id);
        if !graph.contains(start_node) {
            let err = EngineError::NoStartStep(format!(
                "step {} is not a top-level step of the project",
                run.start_step_id
            ));
            run.fail(err.to_string());
            self.run_store.update_run(run).await?;
            return Err(err);
        }

        let result = self
            .walk(ctx, graph, vec![start_node], run.input.clone(), true, false, prior)
            .await;

        match result {
            Ok(WalkResult::Completed(output)) => {
                let output = output.to_map();
                run.complete(output.clone());
                self.run_store.update_run(run).await?;
                info!(run_id = %ctx.run_id, "run completed");
                Ok(RunOutcome::Completed(output))
            }
            Ok(WalkResult::Suspended { delay }) => {
                // Back to pending; the delayed job picks it up again.
                run.status = RunStatus::Pending;
                self.run_store.update_run(run).await?;
                info!(run_id = %ctx.run_id, delay_ms = delay.as_millis() as u64, "run suspended");
                Ok(RunOutcome::Suspended { delay })
            }
            Err(EngineError::Cancelled) => {
                run.cancel();
                self.run_store.update_run(run).await?;
                info!(run_id = %ctx.run_id, "run cancelled");
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "run failed");
                run.fail(err.to_string());
                self.run_store.update_run(run).await?;
                Err(err)
            }
        }
    }

    /// Execute exactly one step for an ephemeral test run; no successors are
    /// scheduled.
    pub async fn execute_single_step(
        &self,
        ctx: &RunContext,
        step_id: Uuid,
        input: Value,
        mut run: Run,
    ) -> Result<Value, EngineError> {
        run.start();
        self.run_store.update_run(run.clone()).await?;

        let step = ctx
            .definition
            .step(step_id)
            .ok_or(EngineError::StepNotFound(step_id))?
            .clone();

        match self
            .step_executor
            .execute(ctx, &step, input, None, false, false)
            .await
        {
            Ok(StepOutcome::Completed { output, .. }) => {
                run.complete(output.clone());
                self.run_store.update_run(run).await?;
                Ok(output)
            }
            Ok(StepOutcome::Suspended { .. }) => {
                Err(EngineError::Internal("single-step run cannot suspend".into()))
            }
            Err(StepError::Cancelled) => {
                run.cancel();
                self.run_store.update_run(run).await?;
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                run.fail(err.to_string());
                self.run_store.update_run(run).await?;
                Err(EngineError::StepFailed {
                    step_id,
                    source: err,
                })
            }
        }
    }

    async fn completed_outputs(&self, run_id: Uuid) -> Result<HashMap<Uuid, Value>, EngineError> {
        let mut outputs: HashMap<Uuid, (u32, Value)> = HashMap::new();
        for step_run in self.run_store.list_step_runs(run_id).await? {
            if step_run.status != StepRunStatus::Completed {
                continue;
            }
            let Some(output) = step_run.output else { continue };
            let keep = outputs
                .get(&step_run.step_id)
                .map(|(attempt, _)| step_run.attempt > *attempt)
                .unwrap_or(true);
            if keep {
                outputs.insert(step_run.step_id, (step_run.attempt, output));
            }
        }
        Ok(outputs.into_iter().map(|(id, (_, output))| (id, output)).collect())
    }

    /// Boxed entry point so group bodies can recurse through the group
    /// executor without an infinitely-sized future type.
    pub(crate) fn walk<'a>(
        &'a self,
        ctx: &'a RunContext,
        graph: NodeGraph,
        entries: Vec<NodeId>,
        input: Value,
        allow_suspend: bool,
        fresh_attempts: bool,
        prior: Arc<HashMap<Uuid, Value>>,
    ) -> BoxFuture<'a, Result<WalkResult, EngineError>> {
        Box::pin(self.walk_inner(ctx, graph, entries, input, allow_suspend, fresh_attempts, prior))
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk_inner(
        &self,
        ctx: &RunContext,
        graph: NodeGraph,
        entries: Vec<NodeId>,
        input: Value,
        allow_suspend: bool,
        fresh_attempts: bool,
        prior: Arc<HashMap<Uuid, Value>>,
    ) -> Result<WalkResult, EngineError> {
        let mut deposits: HashMap<NodeId, Vec<(usize, Value)>> = HashMap::new();
        let mut pruned_in: HashMap<NodeId, usize> = HashMap::new();
        let mut done: HashMap<NodeId, Value> = HashMap::new();
        let mut skipped: HashSet<NodeId> = HashSet::new();
        let mut fed_forward: HashSet<NodeId> = HashSet::new();
        let mut ready: VecDeque<(NodeId, Value)> = VecDeque::new();

        for entry in entries {
            ready.push_back((entry, input.clone()));
        }

        while let Some((node, node_input)) = ready.pop_front() {
            if done.contains_key(&node) || skipped.contains(&node) {
                continue;
            }

            if ctx.cancel.is_cancelled() || self.run_store.cancel_requested(ctx.run_id).await? {
                ctx.cancel.cancel();
                self.mark_remaining_skipped(ctx, &graph, &done, &skipped).await?;
                return Err(EngineError::Cancelled);
            }

            let (output, branch) = match node {
                NodeId::Step(step_id) => {
                    if let Some(output) = prior.get(&step_id) {
                        let branch = output
                            .get("__branch")
                            .and_then(|v| v.as_str())
                            .map(String::from);
                        (output.clone(), branch)
                    } else {
                        let step = ctx
                            .definition
                            .step(step_id)
                            .ok_or(EngineError::StepNotFound(step_id))?
                            .clone();
                        match self
                            .step_executor
                            .execute(ctx, &step, node_input, None, allow_suspend, fresh_attempts)
                            .await
                        {
                            Ok(StepOutcome::Completed { output, branch }) => (output, branch),
                            Ok(StepOutcome::Suspended { delay }) => {
                                return Ok(WalkResult::Suspended { delay });
                            }
                            Err(StepError::Cancelled) => {
                                ctx.cancel.cancel();
                                self.mark_remaining_skipped(ctx, &graph, &done, &skipped).await?;
                                return Err(EngineError::Cancelled);
                            }
                            Err(err) => {
                                return Err(EngineError::StepFailed {
                                    step_id,
                                    source: err,
                                });
                            }
                        }
                    }
                }
                NodeId::Group(group_id) => {
                    let group = ctx
                        .definition
                        .group(group_id)
                        .ok_or_else(|| EngineError::InvalidState(format!("unknown group {group_id}")))?
                        .clone();
                    let (output, port) = self
                        .group_executor
                        .execute(ctx, self, &group, node_input)
                        .await?;

                    if port == "error" {
                        let has_error_edge = graph
                            .out_edges
                            .get(&node)
                            .into_iter()
                            .flatten()
                            .any(|&idx| graph.edges[idx].source_port.as_deref() == Some("error"));
                        if !has_error_edge {
                            // Unconnected error port fails the enclosing scope.
                            return Err(EngineError::GroupFailed {
                                group: group.name.clone(),
                                message: output
                                    .get("error")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("group routed to error port")
                                    .to_string(),
                            });
                        }
                    }
                    (output, Some(port))
                }
            };

            done.insert(node, output.clone());

            // Activate outgoing edges under the unified branch rule, then
            // apply per-edge conditions.
            let out_edge_ids: Vec<usize> = graph
                .out_edges
                .get(&node)
                .cloned()
                .unwrap_or_default();
            for edge_idx in out_edge_ids {
                let edge = graph.edges[edge_idx].clone();
                let mut active = edge_active(&edge, branch.as_deref());
                if active {
                    if let Some(condition) = &edge.condition {
                        active = evaluate_bool(condition, &output)
                            .map_err(|e| EngineError::Internal(e.to_string()))?;
                    }
                }

                if active {
                    fed_forward.insert(node);
                    deposits
                        .entry(edge.target)
                        .or_default()
                        .push((graph.rank[&node], output.clone()));
                } else {
                    *pruned_in.entry(edge.target).or_default() += 1;
                }

                self.settle_target(
                    ctx,
                    &graph,
                    edge.target,
                    &mut deposits,
                    &mut pruned_in,
                    &mut ready,
                    &mut skipped,
                    &done,
                )
                .await?;
            }
        }

        // Terminal outputs: done nodes that fed nothing forward, in rank
        // order for determinism.
        let mut terminals: Vec<(NodeId, Value)> = done
            .into_iter()
            .filter(|(node, _)| !fed_forward.contains(node))
            .collect();
        terminals.sort_by_key(|(node, _)| graph.rank.get(node).copied().unwrap_or(usize::MAX));

        let named = terminals
            .into_iter()
            .map(|(node, value)| (self.node_name(ctx, node), value))
            .collect();
        Ok(WalkResult::Completed(WalkOutput { terminals: named }))
    }

    /// Check whether `target` has heard from every incoming edge; enqueue it
    /// or skip it (transitively) accordingly.
    #[allow(clippy::too_many_arguments)]
    fn settle_target<'a>(
        &'a self,
        ctx: &'a RunContext,
        graph: &'a NodeGraph,
        target: NodeId,
        deposits: &'a mut HashMap<NodeId, Vec<(usize, Value)>>,
        pruned_in: &'a mut HashMap<NodeId, usize>,
        ready: &'a mut VecDeque<(NodeId, Value)>,
        skipped: &'a mut HashSet<NodeId>,
        done: &'a HashMap<NodeId, Value>,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            if skipped.contains(&target) || done.contains_key(&target) {
                return Ok(());
            }
            let total_in = graph.in_edges.get(&target).map(|e| e.len()).unwrap_or(0);
            let deposited = deposits.get(&target).map(|d| d.len()).unwrap_or(0);
            let pruned = pruned_in.get(&target).copied().unwrap_or(0);
            if deposited + pruned < total_in {
                return Ok(());
            }

            if deposited == 0 {
                // Every predecessor was pruned away: the node is skipped and
                // its own targets may become skipped in turn.
                skipped.insert(target);
                self.record_skipped(ctx, target).await?;
                let out_edge_ids: Vec<usize> =
                    graph.out_edges.get(&target).cloned().unwrap_or_default();
                for edge_idx in out_edge_ids {
                    let next = graph.edges[edge_idx].target;
                    *pruned_in.entry(next).or_default() += 1;
                    self.settle_target(ctx, graph, next, deposits, pruned_in, ready, skipped, done)
                        .await?;
                }
                return Ok(());
            }

            let mut payloads = deposits.remove(&target).unwrap_or_default();
            payloads.sort_by_key(|(rank, _)| *rank);
            let merged = if payloads.len() == 1 {
                payloads.into_iter().next().expect("one payload").1
            } else {
                let mut merged = Value::Object(Map::new());
                for (_, payload) in payloads {
                    deep_merge(&mut merged, &payload);
                }
                merged
            };
            ready.push_back((target, merged));
            Ok(())
        })
    }

    async fn mark_remaining_skipped(
        &self,
        ctx: &RunContext,
        graph: &NodeGraph,
        done: &HashMap<NodeId, Value>,
        skipped: &HashSet<NodeId>,
    ) -> Result<(), EngineError> {
        for node in &graph.nodes {
            if !done.contains_key(node) && !skipped.contains(node) {
                self.record_skipped(ctx, *node).await?;
            }
        }
        Ok(())
    }

    async fn record_skipped(&self, ctx: &RunContext, node: NodeId) -> Result<(), EngineError> {
        let NodeId::Step(step_id) = node else {
            return Ok(());
        };
        let Some(step) = ctx.definition.step(step_id) else {
            return Ok(());
        };
        let attempt = self.run_store.next_attempt(ctx.run_id, step_id).await?;
        let mut step_run = StepRun::new(ctx.run_id, step_id, &step.name, attempt);
        step_run.skip();
        self.run_store.insert_step_run(step_run).await?;
        Ok(())
    }

    fn node_name(&self, ctx: &RunContext, node: NodeId) -> String {
        match node {
            NodeId::Step(id) => ctx
                .definition
                .step(id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| id.to_string()),
            NodeId::Group(id) => ctx
                .definition
                .group(id)
                .map(|g| g.name.clone())
                .unwrap_or_else(|| id.to_string()),
        }
    }
}
