//! Single-step execution: block resolution, config layering, schema
//! validation, pre/code/post chain, retry classification.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::metered::{MeteredHttp, MeteredLlm, UsageScope};
use super::RunContext;
use crate::blocks::{deep_merge, BlockRegistry, ResolvedBlock};
use crate::error::StepError;
use crate::expr::expand_templates;
use crate::model::{Step, StepRun};
use crate::sandbox::{Sandbox, SandboxError, SandboxServices, SnippetKind};
use crate::storage::{RunStore, UsageSink};

/// Result of executing one step.
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        output: Value,
        /// Label consumed by the orchestrator to select port-labelled edges.
        branch: Option<String>,
    },
    /// A wait longer than the inline threshold: the step run is already
    /// recorded completed, the walk should stop and the job re-enqueue
    /// after `delay`.
    Suspended { delay: Duration },
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    delay_ms: u64,
}

impl RetryPolicy {
    fn from_config(config: &Value) -> Self {
        let retry = config.get("retry");
        Self {
            max_attempts: retry
                .and_then(|r| r.get("max_attempts"))
                .and_then(|v| v.as_u64())
                .map(|v| v.max(1) as u32)
                .unwrap_or(1),
            delay_ms: retry
                .and_then(|r| r.get("delay_ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(500),
        }
    }

    /// Exponential backoff with jitter, bounded by `delay_ms * 2^(attempt-1)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let jittered = rand::thread_rng().gen_range(ceiling / 2..=ceiling.max(1));
        Duration::from_millis(jittered)
    }
}

pub struct StepExecutor {
    registry: Arc<BlockRegistry>,
    run_store: Arc<dyn RunStore>,
    usage: Arc<dyn UsageSink>,
    sandbox: Arc<Sandbox>,
    base_services: SandboxServices,
    default_step_timeout: Duration,
    wait_inline_threshold: Duration,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<BlockRegistry>,
        run_store: Arc<dyn RunStore>,
        usage: Arc<dyn UsageSink>,
        sandbox: Arc<Sandbox>,
        base_services: SandboxServices,
    ) -> Self {
        Self {
            registry,
            run_store,
            usage,
            sandbox,
            base_services,
            default_step_timeout: Duration::from_secs(30),
            wait_inline_threshold: Duration::from_secs(30),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_wait_inline_threshold(mut self, threshold: Duration) -> Self {
        self.wait_inline_threshold = threshold;
        self
    }

    /// Execute one step with retries, recording one StepRun per attempt.
    /// `allow_suspend` is true only at the top level of a run; inside group
    /// bodies long waits sleep inline instead. `fresh_attempts` numbers
    /// attempts from 1 within this call (loop iterations are new logical
    /// executions); otherwise numbering continues from the run's history
    /// (explicit re-executes and try_catch retries stay contiguous).
    pub async fn execute(
        &self,
        ctx: &RunContext,
        step: &Step,
        input: Value,
        overrides: Option<&Value>,
        allow_suspend: bool,
        fresh_attempts: bool,
    ) -> Result<StepOutcome, StepError> {
        let block = self.resolve_block(step)?;
        let config = self.effective_config(ctx, &block, step, &input, overrides)?;
        self.validate_config(&block, &config)?;

        let policy = RetryPolicy::from_config(&config);
        let timeout = config
            .get("step_timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis)
            .unwrap_or(self.default_step_timeout);

        let services = self.step_services(ctx, step);

        let mut attempt_in_call = 0;
        loop {
            attempt_in_call += 1;
            let attempt = if fresh_attempts {
                attempt_in_call
            } else {
                self.run_store
                    .next_attempt(ctx.run_id, step.id)
                    .await
                    .map_err(|e| StepError::Internal(e.to_string()))?
            };

            let mut step_run = StepRun::new(ctx.run_id, step.id, &step.name, attempt);
            step_run.start(input.clone());
            self.run_store
                .insert_step_run(step_run.clone())
                .await
                .map_err(|e| StepError::Internal(e.to_string()))?;

            // Wait steps are served host-side.
            if block.definition.slug == "wait" {
                return self
                    .execute_wait(ctx, &config, input, step_run, allow_suspend)
                    .await;
            }

            let logs = Arc::new(Mutex::new(Vec::new()));
            let result = self
                .run_chain(ctx, &block, step, &config, input.clone(), services.clone(), timeout, logs.clone())
                .await;

            step_run.logs = std::mem::take(&mut *logs.lock());
            match result {
                Ok(output) => {
                    let branch = extract_branch(step, &output);
                    step_run.complete(output.clone());
                    self.persist(step_run).await?;
                    return Ok(StepOutcome::Completed { output, branch });
                }
                Err(StepError::Cancelled) => {
                    step_run.cancel();
                    self.persist(step_run).await?;
                    return Err(StepError::Cancelled);
                }
                Err(err) => {
                    step_run.fail(err.code(), err.to_string());
                    self.persist(step_run).await?;

                    if err.retryable() && attempt_in_call < policy.max_attempts {
                        let delay = policy.backoff(attempt_in_call);
                        warn!(
                            run_id = %ctx.run_id,
                            step_id = %step.id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "step failed, retrying"
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(StepError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn resolve_block(&self, step: &Step) -> Result<Arc<ResolvedBlock>, StepError> {
        if let Some(block_id) = step.block_definition_id {
            return self
                .registry
                .get_by_id(block_id)
                .ok_or_else(|| StepError::BlockNotFound(format!("id {block_id}")));
        }
        let slug = step.step_type.slug();
        self.registry
            .get_by_slug(slug)
            .ok_or_else(|| StepError::BlockNotFound(slug.to_string()))
    }

    /// Layer resolved defaults <- step config <- runtime overrides, then
    /// expand `{{input.*}}` / `{{ctx.variables.*}}` templates.
    fn effective_config(
        &self,
        ctx: &RunContext,
        block: &ResolvedBlock,
        step: &Step,
        input: &Value,
        overrides: Option<&Value>,
    ) -> Result<Value, StepError> {
        let mut config = block.resolved_config_defaults.clone();
        if !config.is_object() {
            config = Value::Object(Default::default());
        }
        deep_merge(&mut config, &step.config);
        if let Some(overrides) = overrides {
            deep_merge(&mut config, overrides);
        }

        let template_data = json!({
            "input": input,
            "ctx": { "variables": ctx.variables },
        });
        Ok(expand_templates(&config, &template_data))
    }

    fn validate_config(&self, block: &ResolvedBlock, config: &Value) -> Result<(), StepError> {
        let schema = &block.definition.config_schema;
        if schema.is_null() || schema.as_object().map(|m| m.is_empty()).unwrap_or(false) {
            return Ok(());
        }
        let compiled = jsonschema::JSONSchema::compile(schema).map_err(|e| {
            StepError::SchemaValidation(format!(
                "block '{}' config_schema does not compile: {e}",
                block.definition.slug
            ))
        })?;
        let validation = compiled.validate(config);
        match validation {
            Ok(()) => Ok(()),
            Err(errs) => {
                let errors: Vec<String> = errs
                    .map(|e| format!("{}: {e}", e.instance_path))
                    .collect();
                Err(StepError::SchemaValidation(errors.join("; ")))
            }
        }
    }

    fn step_services(&self, ctx: &RunContext, step: &Step) -> SandboxServices {
        let scope = UsageScope {
            tenant_id: ctx.tenant_id,
            run_id: ctx.run_id,
            step_id: step.id,
        };
        let mut services = self.base_services.clone();
        services.llm = Arc::new(MeteredLlm {
            inner: services.llm.clone(),
            sink: self.usage.clone(),
            scope,
        });
        services.http = Arc::new(MeteredHttp {
            inner: services.http.clone(),
            sink: self.usage.clone(),
            scope,
        });
        services
    }

    /// Pre chain (child-first) -> resolved code -> post chain (root-first).
    #[allow(clippy::too_many_arguments)]
    async fn run_chain(
        &self,
        ctx: &RunContext,
        block: &ResolvedBlock,
        step: &Step,
        config: &Value,
        input: Value,
        services: SandboxServices,
        timeout: Duration,
        logs: Arc<Mutex<Vec<crate::model::StepLogEntry>>>,
    ) -> Result<Value, StepError> {
        let mut current = input;
        for snippet in &block.pre_process_chain {
            current = self
                .run_snippet(ctx, block, snippet, current, config, services.clone(), timeout, logs.clone())
                .await?;
        }

        // The `code` block executes the snippet carried in the step config.
        let inline_code;
        let code: &str = if block.definition.slug == "code" {
            match config.get("code").and_then(|v| v.as_str()) {
                Some(snippet) if !snippet.trim().is_empty() => {
                    inline_code = snippet.to_string();
                    &inline_code
                }
                _ => &block.resolved_code,
            }
        } else {
            &block.resolved_code
        };
        if code.trim().is_empty() {
            return Err(StepError::BlockNotFound(format!(
                "block '{}' resolves to no executable code",
                block.definition.slug
            )));
        }

        debug!(run_id = %ctx.run_id, step_id = %step.id, slug = %block.definition.slug, "executing block code");
        let mut output = self
            .run_snippet(ctx, block, code, current, config, services.clone(), timeout, logs.clone())
            .await?;

        for snippet in &block.post_process_chain {
            output = self
                .run_snippet(ctx, block, snippet, output, config, services.clone(), timeout, logs.clone())
                .await?;
        }
        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_snippet(
        &self,
        ctx: &RunContext,
        block: &ResolvedBlock,
        snippet: &str,
        input: Value,
        config: &Value,
        services: SandboxServices,
        timeout: Duration,
        logs: Arc<Mutex<Vec<crate::model::StepLogEntry>>>,
    ) -> Result<Value, StepError> {
        self.sandbox
            .execute(
                SnippetKind::Transform,
                snippet,
                input,
                config.clone(),
                services,
                Some(timeout),
                ctx.cancel.child_token(),
                logs,
            )
            .await
            .map_err(|err| classify_sandbox_error(err, block))
    }

    async fn execute_wait(
        &self,
        ctx: &RunContext,
        config: &Value,
        input: Value,
        mut step_run: StepRun,
        allow_suspend: bool,
    ) -> Result<StepOutcome, StepError> {
        let duration = Duration::from_millis(
            config.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
        );

        if duration > self.wait_inline_threshold && allow_suspend {
            // The queue delay serves the wait; record the step as done now
            // so the resumed walk continues past it.
            step_run.complete(input.clone());
            self.persist(step_run).await?;
            return Ok(StepOutcome::Suspended { delay: duration });
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                step_run.cancel();
                self.persist(step_run).await?;
                return Err(StepError::Cancelled);
            }
            _ = tokio::time::sleep(duration) => {}
        }
        step_run.complete(input.clone());
        self.persist(step_run).await?;
        Ok(StepOutcome::Completed {
            output: input,
            branch: None,
        })
    }

    async fn persist(&self, step_run: StepRun) -> Result<(), StepError> {
        self.run_store
            .update_step_run(step_run)
            .await
            .map_err(|e| StepError::Internal(e.to_string()))
    }
}

fn classify_sandbox_error(err: SandboxError, block: &ResolvedBlock) -> StepError {
    match err {
        SandboxError::Timeout(ms) => StepError::Timeout(ms),
        SandboxError::Cancelled => StepError::Cancelled,
        ref execution @ SandboxError::Execution(_) => {
            let message = execution.thrown_message().unwrap_or_default().to_string();
            StepError::classify_thrown(&message, &block.error_codes)
        }
        other => StepError::Sandbox(other),
    }
}

fn extract_branch(step: &Step, output: &Value) -> Option<String> {
    let branch = output.get("__branch").and_then(|v| v.as_str());
    match branch {
        Some(label) => Some(label.to_string()),
        None if step.step_type.is_branching() => None,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockRegistry;
    use crate::model::{
        BlockCategory, BlockDefinition, ProjectDefinition, StepType, TriggeredBy,
    };
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    fn harness() -> (Arc<MemoryStore>, StepExecutor, RunContext) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(BlockRegistry::with_system_blocks(50).unwrap());
        let executor = StepExecutor::new(
            registry,
            store.clone(),
            store.clone(),
            Arc::new(Sandbox::default()),
            SandboxServices::noop(),
        );
        let ctx = RunContext::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            TriggeredBy::Manual,
            Arc::new(ProjectDefinition::default()),
        );
        (store, executor, ctx)
    }

    fn code_step(ctx: &RunContext, snippet: &str) -> Step {
        Step::new(ctx.project_id, "work", StepType::Code)
            .with_config(json!({"code": snippet}))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_code_step_executes_config_snippet() {
        let (store, executor, ctx) = harness();
        let step = code_step(&ctx, "return { doubled: input.v * 2 };");

        let outcome = executor
            .execute(&ctx, &step, json!({"v": 21}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Completed { output, branch } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output, json!({"doubled": 42}));
        assert!(branch.is_none());

        let step_runs = store.list_step_runs(ctx.run_id).await.unwrap();
        assert_eq!(step_runs.len(), 1);
        assert_eq!(step_runs[0].attempt, 1);
        assert_eq!(step_runs[0].output, Some(json!({"doubled": 42})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_condition_step_sets_branch() {
        let (_store, executor, ctx) = harness();
        let step = Step::new(ctx.project_id, "check", StepType::Condition)
            .with_config(json!({"expression": "$.x > 10"}));

        let outcome = executor
            .execute(&ctx, &step, json!({"x": 11}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Completed { branch, output } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(branch.as_deref(), Some("then"));
        assert_eq!(output["x"], json!(11));

        let outcome = executor
            .execute(&ctx, &step, json!({"x": 3}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Completed { branch, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(branch.as_deref(), Some("else"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_schema_validation_failure() {
        let (store, executor, ctx) = harness();
        // http requires `url`.
        let step = Step::new(ctx.project_id, "fetch", StepType::Custom("http".into()));

        let err = executor
            .execute(&ctx, &step, json!({}), None, true, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::SchemaValidation(_)));
        assert!(store.list_step_runs(ctx.run_id).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_config_template_expansion() {
        let (_store, executor, ctx) = harness();
        let mut ctx = ctx;
        ctx.variables.insert("region".into(), json!("eu-west-1"));
        let step = code_step(&ctx, "return { url: config.url, region: config.region };")
            .with_config(json!({
                "code": "return { url: config.url, region: config.region };",
                "url": "https://{{input.host}}/v1",
                "region": "{{ctx.variables.region}}"
            }));

        let outcome = executor
            .execute(&ctx, &step, json!({"host": "api.example.com"}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Completed { output, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output["url"], json!("https://api.example.com/v1"));
        assert_eq!(output["region"], json!("eu-west-1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_until_success() {
        let (store, executor, ctx) = harness();
        // Fails with a retryable code until the third attempt; attempts are
        // tracked through the step-run history.
        let registry = BlockRegistry::with_system_blocks(50).unwrap();
        registry
            .register(
                BlockDefinition::system("flaky", "Flaky", BlockCategory::Utility)
                    .with_code(
                        r#"if (config.fail_under > input.attempt) {
                            throw new Error('[FLAKY_1] not yet');
                        }
                        return { ok: true };"#,
                    )
                    .with_error_codes(vec![crate::model::ErrorCodeDef {
                        code: "FLAKY_1".into(),
                        name: "TRANSIENT".into(),
                        description: String::new(),
                        retryable: true,
                    }]),
            )
            .unwrap();
        let executor = StepExecutor::new(
            Arc::new(registry),
            store.clone(),
            store.clone(),
            Arc::new(Sandbox::default()),
            SandboxServices::noop(),
        );

        // attempt counter lives host-side in this test: the block reads it
        // from input, so seed with a value that succeeds on attempt 3.
        let step = Step::new(ctx.project_id, "flaky", StepType::Custom("flaky".into()))
            .with_config(json!({
                "fail_under": 0,
                "retry": {"max_attempts": 3, "delay_ms": 5}
            }));

        // First: always succeeds (fail_under 0).
        let outcome = executor
            .execute(&ctx, &step, json!({"attempt": 1}), None, true, false)
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));

        // Now: never succeeds; three attempts recorded, error surfaces.
        let always_failing = Step::new(ctx.project_id, "flaky2", StepType::Custom("flaky".into()))
            .with_config(json!({
                "fail_under": 100,
                "retry": {"max_attempts": 3, "delay_ms": 5}
            }));
        let err = executor
            .execute(&ctx, &always_failing, json!({"attempt": 1}), None, true, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FLAKY_1");

        let attempts: Vec<u32> = store
            .list_step_runs(ctx.run_id)
            .await
            .unwrap()
            .iter()
            .filter(|sr| sr.step_id == always_failing.id)
            .map(|sr| sr.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_nonretryable_error_fails_once() {
        let (store, executor, ctx) = harness();
        let step = code_step(&ctx, "throw new Error('[FATAL_1] no retry');")
            .with_config(json!({
                "code": "throw new Error('[FATAL_1] no retry');",
                "retry": {"max_attempts": 3, "delay_ms": 5}
            }));

        let err = executor
            .execute(&ctx, &step, json!({}), None, true, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FATAL_1");
        assert!(!err.retryable());
        assert_eq!(store.list_step_runs(ctx.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_short_wait_sleeps_inline() {
        let (store, executor, ctx) = harness();
        let step = Step::new(ctx.project_id, "pause", StepType::Wait)
            .with_config(json!({"duration_ms": 20}));

        let outcome = executor
            .execute(&ctx, &step, json!({"carried": 1}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Completed { output, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(output, json!({"carried": 1}));
        assert_eq!(store.list_step_runs(ctx.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_long_wait_suspends() {
        let (store, executor, ctx) = harness();
        let executor = executor.with_wait_inline_threshold(Duration::from_millis(10));
        let step = Step::new(ctx.project_id, "pause", StepType::Wait)
            .with_config(json!({"duration_ms": 60_000}));

        let outcome = executor
            .execute(&ctx, &step, json!({}), None, true, false)
            .await
            .unwrap();
        let StepOutcome::Suspended { delay } = outcome else {
            panic!("expected suspension");
        };
        assert_eq!(delay, Duration::from_secs(60));

        // The step run is already recorded done so the resumed walk skips it.
        let step_runs = store.list_step_runs(ctx.run_id).await.unwrap();
        assert_eq!(step_runs.len(), 1);
        assert_eq!(step_runs[0].status, crate::model::StepRunStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_logs_attached_to_step_run() {
        let (store, executor, ctx) = harness();
        let step = code_step(&ctx, "ctx.log('info', 'working'); return {};");

        executor
            .execute(&ctx, &step, json!({}), None, true, false)
            .await
            .unwrap();
        let step_runs = store.list_step_runs(ctx.run_id).await.unwrap();
        assert_eq!(step_runs[0].logs.len(), 1);
        assert_eq!(step_runs[0].logs[0].message, "working");
    }
}
