//! Block group execution: parallel, try_catch, foreach and while.
//!
//! A group's body is a sub-orchestration: it gets its own node graph, ready
//! set and (for parallel variants) cancellation token. All variants share
//! the group-level pre/post transform wrapping and resolve to an `out` or
//! `error` port.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::graph::{NodeGraph, NodeId, Scope};
use super::orchestrator::{RunOrchestrator, WalkResult};
use super::RunContext;
use crate::error::EngineError;
use crate::expr::{evaluate_bool, get_path};
use crate::model::{
    BlockGroup, ForeachConfig, GroupType, ParallelConfig, TryCatchConfig, WhileConfig,
};
use crate::sandbox::{Sandbox, SandboxServices, SnippetKind};

pub struct GroupExecutor {
    sandbox: Arc<Sandbox>,
    services: SandboxServices,
}

impl GroupExecutor {
    pub fn new(sandbox: Arc<Sandbox>, services: SandboxServices) -> Self {
        Self { sandbox, services }
    }

    /// Execute a group with the given fan-in input. Returns the external
    /// output and the port it resolves to (`out` or `error`).
    pub async fn execute(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
    ) -> Result<(Value, String), EngineError> {
        debug!(run_id = %ctx.run_id, group = %group.name, kind = ?group.group_type, "executing group");

        let input = self
            .run_transform(ctx, group.pre_process.as_deref(), input, &group.config)
            .await?;

        let (output, port) = match group.group_type {
            GroupType::Parallel => self.execute_parallel(ctx, orchestrator, group, input).await?,
            GroupType::TryCatch => self.execute_try_catch(ctx, orchestrator, group, input).await?,
            GroupType::Foreach => self.execute_foreach(ctx, orchestrator, group, input).await?,
            GroupType::While => self.execute_while(ctx, orchestrator, group, input).await?,
        };

        let output = self
            .run_transform(ctx, group.post_process.as_deref(), output, &group.config)
            .await?;
        Ok((output, port))
    }

    /// Group pre/post snippets share the step transform convention:
    /// returning nothing keeps the value unchanged.
    async fn run_transform(
        &self,
        ctx: &RunContext,
        snippet: Option<&str>,
        value: Value,
        config: &Value,
    ) -> Result<Value, EngineError> {
        let Some(snippet) = snippet.filter(|s| !s.trim().is_empty()) else {
            return Ok(value);
        };
        let logs = Arc::new(Mutex::new(Vec::new()));
        self.sandbox
            .execute(
                SnippetKind::Transform,
                snippet,
                value,
                config.clone(),
                self.services.clone(),
                None,
                ctx.cancel.child_token(),
                logs,
            )
            .await
            .map_err(|e| EngineError::GroupFailed {
                group: "transform".into(),
                message: e.to_string(),
            })
    }

    /// Run the whole body once and collapse its terminals to one value.
    /// `fresh_attempts` marks iteration-style bodies whose step runs start
    /// at attempt 1 each time; retry-style bodies keep contiguous numbering.
    async fn run_body(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
        fresh_attempts: bool,
    ) -> Result<Value, EngineError> {
        let graph = NodeGraph::build(&ctx.definition, Scope::Body(group.id))?;
        let entries = graph.entries();
        if entries.is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        match orchestrator
            .walk(ctx, graph, entries, input, false, fresh_attempts, Arc::new(HashMap::new()))
            .await?
        {
            WalkResult::Completed(output) => Ok(output.collapsed()),
            WalkResult::Suspended { .. } => Err(EngineError::Internal(
                "group body cannot suspend".into(),
            )),
        }
    }

    async fn execute_parallel(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
    ) -> Result<(Value, String), EngineError> {
        let config: ParallelConfig =
            serde_json::from_value(group.config.clone()).unwrap_or_default();

        let graph = NodeGraph::build(&ctx.definition, Scope::Body(group.id))?;
        let components = graph.components();
        if components.is_empty() {
            return Ok((json!({"results": {}, "completed": true, "count": 0}), "out".into()));
        }

        let permits = if config.max_concurrent == 0 {
            components.len()
        } else {
            config.max_concurrent
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        // fail_fast cancels the siblings of the first failing component
        // through a group-scoped token.
        let group_cancel = ctx.cancel.child_token();
        let fail_fast = config.fail_fast;

        let tasks = components.into_iter().map(|component| {
            let sub_graph = graph.restrict(&component);
            let entries = sub_graph.entries();
            let name = component_name(ctx, &entries);
            let component_ctx = ctx.clone().with_cancel(group_cancel.child_token());
            let semaphore = semaphore.clone();
            let group_cancel = group_cancel.clone();
            let input = input.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let result = match orchestrator
                    .walk(&component_ctx, sub_graph, entries, input, false, false, Arc::new(HashMap::new()))
                    .await
                {
                    Ok(WalkResult::Completed(output)) => Ok(output.collapsed()),
                    Ok(WalkResult::Suspended { .. }) => {
                        Err(EngineError::Internal("group body cannot suspend".into()))
                    }
                    Err(err) => Err(err),
                };
                if result.is_err() && fail_fast {
                    group_cancel.cancel();
                }
                (name, result)
            }
        });

        let settled = join_all(tasks).await;

        if ctx.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut results = Map::new();
        let mut first_error: Option<String> = None;
        let mut cancelled = 0usize;
        let count = settled.len();
        for (name, result) in settled {
            match result {
                Ok(output) => {
                    results.insert(name, output);
                }
                Err(EngineError::Cancelled) => cancelled += 1,
                Err(err) => {
                    warn!(run_id = %ctx.run_id, group = %group.name, component = %name, error = %err, "parallel component failed");
                    if first_error.is_none() {
                        first_error = Some(err.to_string());
                    }
                }
            }
        }

        match first_error {
            None if cancelled == 0 => Ok((
                json!({"results": results, "completed": true, "count": count}),
                "out".into(),
            )),
            None => Err(EngineError::Cancelled),
            Some(error) => Ok((
                json!({
                    "error": error,
                    "results": results,
                    "input": input,
                }),
                "error".into(),
            )),
        }
    }

    async fn execute_try_catch(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
    ) -> Result<(Value, String), EngineError> {
        let config: TryCatchConfig =
            serde_json::from_value(group.config.clone()).unwrap_or_default();

        let mut last_error = String::new();
        for attempt in 0..=config.retry_count {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if attempt > 0 {
                debug!(run_id = %ctx.run_id, group = %group.name, attempt, "retrying try_catch body");
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
            match self.run_body(ctx, orchestrator, group, input.clone(), false).await {
                Ok(output) => return Ok((output, "out".into())),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => last_error = err.to_string(),
            }
        }

        warn!(run_id = %ctx.run_id, group = %group.name, retries = config.retry_count, error = %last_error, "try_catch exhausted retries");
        Ok((
            json!({"error": last_error, "input": input}),
            "error".into(),
        ))
    }

    async fn execute_foreach(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
    ) -> Result<(Value, String), EngineError> {
        let config: ForeachConfig =
            serde_json::from_value(group.config.clone()).unwrap_or_default();

        let items = match get_path(&input, &config.input_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Ok((
                    json!({
                        "error": format!("input path {} does not resolve to an array", config.input_path),
                        "input": input,
                    }),
                    "error".into(),
                ))
            }
            None => Vec::new(),
        };

        let iteration_input = |index: usize, item: &Value| {
            json!({"item": item, "index": index, "context": input})
        };

        let mut results: Vec<Value> = Vec::with_capacity(items.len());
        let mut first_error: Option<(usize, String)> = None;

        if config.parallel && !items.is_empty() {
            let permits = if config.max_workers == 0 {
                items.len()
            } else {
                config.max_workers
            };
            let semaphore = Arc::new(Semaphore::new(permits));
            let tasks = items.iter().enumerate().map(|(index, item)| {
                let semaphore = semaphore.clone();
                let input = iteration_input(index, item);
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore open");
                    (index, self.run_body(ctx, orchestrator, group, input, true).await)
                }
            });
            let mut settled = join_all(tasks).await;
            settled.sort_by_key(|(index, _)| *index);
            for (index, result) in settled {
                match result {
                    Ok(output) => results.push(output),
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some((index, err.to_string()));
                        }
                        results.push(Value::Null);
                    }
                }
            }
        } else {
            for (index, item) in items.iter().enumerate() {
                if ctx.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                match self
                    .run_body(ctx, orchestrator, group, iteration_input(index, item), true)
                    .await
                {
                    Ok(output) => results.push(output),
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(err) => {
                        first_error = Some((index, err.to_string()));
                        break;
                    }
                }
            }
        }

        if let Some((index, error)) = first_error {
            return Ok((
                json!({"error": error, "index": index, "input": input}),
                "error".into(),
            ));
        }

        Ok((
            json!({
                "results": results,
                "_meta": {
                    "iterations": items.len(),
                    "completedAt": Utc::now().to_rfc3339(),
                }
            }),
            "out".into(),
        ))
    }

    async fn execute_while(
        &self,
        ctx: &RunContext,
        orchestrator: &RunOrchestrator,
        group: &BlockGroup,
        input: Value,
    ) -> Result<(Value, String), EngineError> {
        let config: WhileConfig = serde_json::from_value(group.config.clone()).unwrap_or_default();

        let condition = |value: &Value| -> Result<bool, EngineError> {
            evaluate_bool(&config.condition, value)
                .map_err(|e| EngineError::Internal(format!("while condition: {e}")))
        };

        let mut current = input;
        let mut last_output = Value::Null;
        let mut iterations: u64 = 0;

        // An unhandled body failure routes to the error port like any other
        // group failure.
        macro_rules! body_or_error {
            ($input:expr) => {
                match self.run_body(ctx, orchestrator, group, $input, true).await {
                    Ok(output) => output,
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(err) => {
                        return Ok((
                            json!({"error": err.to_string(), "input": current}),
                            "error".into(),
                        ))
                    }
                }
            };
        }

        if config.do_while {
            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                last_output = body_or_error!(current.clone());
                current = last_output.clone();
                iterations += 1;
                if !condition(&current)? {
                    break;
                }
                if iterations >= config.max_iterations {
                    return Ok((max_iterations_payload(iterations, &current), "error".into()));
                }
            }
        } else {
            loop {
                if ctx.cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                if !condition(&current)? {
                    break;
                }
                if iterations >= config.max_iterations {
                    if iterations == 0 {
                        // A zero cap with nothing executed is vacuously done.
                        break;
                    }
                    return Ok((max_iterations_payload(iterations, &current), "error".into()));
                }
                last_output = body_or_error!(current.clone());
                current = last_output.clone();
                iterations += 1;
            }
        }

        Ok((
            json!({
                "result": last_output,
                "_meta": {
                    "iterations": iterations,
                    "completedAt": Utc::now().to_rfc3339(),
                }
            }),
            "out".into(),
        ))
    }
}

fn max_iterations_payload(iterations: u64, current: &Value) -> Value {
    json!({
        "error": format!("MAX_ITERATIONS: loop exceeded {iterations} iterations"),
        "iterations": iterations,
        "input": current,
    })
}

fn component_name(ctx: &RunContext, entries: &[NodeId]) -> String {
    let names: Vec<String> = entries
        .iter()
        .map(|node| match node {
            NodeId::Step(id) => ctx
                .definition
                .step(*id)
                .map(|s| s.name.clone())
                .unwrap_or_else(|| id.to_string()),
            NodeId::Group(id) => ctx
                .definition
                .group(*id)
                .map(|g| g.name.clone())
                .unwrap_or_else(|| id.to_string()),
        })
        .collect();
    names.join("+")
}
