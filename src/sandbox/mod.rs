//! JavaScript sandbox built on boa_engine.
//!
//! One fresh interpreter context per snippet, torn down on return. Block
//! code runs as `function main(input, config, ctx)`; pre/post transform
//! snippets are bare bodies wrapped in a transformer closure. All host power
//! is reachable only through the `ctx` capability object; `ctx.*` calls look
//! synchronous to JS while the host blocks the interpreter thread on the
//! async capability (see [`bridge`]).

mod bridge;
mod context;
mod error;
mod http;

pub use context::{
    AdapterCapability, CapabilityError, EmbeddingCapability, HttpCapability, HttpRequest,
    HttpResponse, HumanCapability, LlmCapability, LlmResponse, SandboxServices, VectorCapability,
    WorkflowCapability,
};
pub use error::SandboxError;
pub use http::{HttpClientConfig, PooledHttpClient};

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsValue, Source};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::model::StepLogEntry;
use bridge::{install_ctx, with_installed_bridge, CapabilityBridge, Interrupt};

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Max snippet size in bytes.
    pub max_code_length: usize,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    /// Hard cap on loop iterations per evaluation; runaway loops error out
    /// even when they never touch a capability.
    pub loop_iteration_limit: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_code_length: 1_000_000,
            default_timeout: Duration::from_secs(30),
            max_output_bytes: 4 * 1024 * 1024,
            loop_iteration_limit: 10_000_000,
        }
    }
}

/// How a snippet receives control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetKind {
    /// Snippet defines `function main(input, config, ctx)`.
    Main,
    /// Bare transform body; `return` produces the new value, returning
    /// nothing keeps the input unchanged.
    Transform,
}

#[derive(Debug)]
pub struct SandboxOutcome {
    pub output: Value,
    pub logs: Vec<StepLogEntry>,
    pub duration: Duration,
}

/// The sandbox runtime. Cheap to clone via `Arc`; owns no interpreter state
/// between calls.
pub struct Sandbox {
    config: SandboxConfig,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Statically validate a snippet: size and forbidden constructs. The
    /// interpreter cannot honor `await`, and `eval`/`Function` would escape
    /// the capability boundary.
    pub fn validate(&self, code: &str) -> Result<(), SandboxError> {
        if code.len() > self.config.max_code_length {
            return Err(SandboxError::CodeTooLarge {
                max: self.config.max_code_length,
                actual: code.len(),
            });
        }
        for (pattern, label) in forbidden_patterns() {
            if pattern.is_match(code) {
                return Err(SandboxError::ForbiddenSyntax(label.to_string()));
            }
        }
        Ok(())
    }

    /// Execute a snippet with the given capability services. Logs emitted via
    /// `ctx.log` are appended to `logs`, which the caller keeps on timeout so
    /// partial logs survive.
    pub async fn execute(
        &self,
        kind: SnippetKind,
        code: &str,
        input: Value,
        config: Value,
        services: SandboxServices,
        timeout: Option<Duration>,
        cancel: CancellationToken,
        logs: Arc<Mutex<Vec<StepLogEntry>>>,
    ) -> Result<Value, SandboxError> {
        self.validate(code)?;

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let handle = Handle::current();
        let deadline = Instant::now() + timeout;
        let code = code.to_string();
        let sandbox_config = self.config.clone();
        let bridge_logs = logs.clone();
        let task_cancel = cancel.clone();

        let task = tokio::task::spawn_blocking(move || {
            let bridge = CapabilityBridge {
                handle,
                services,
                logs: bridge_logs,
                deadline,
                cancel: task_cancel,
                interrupt: std::cell::RefCell::new(None),
            };
            let (result, interrupt) = with_installed_bridge(bridge, || {
                evaluate_snippet(&sandbox_config, kind, &code, &input, &config)
            });
            match interrupt {
                Some(Interrupt::Timeout) => Err(SandboxError::Timeout(timeout.as_millis() as u64)),
                Some(Interrupt::Cancelled) => Err(SandboxError::Cancelled),
                None => result,
            }
        });

        let started = Instant::now();
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => {
                let result = joined
                    .map_err(|e| SandboxError::Internal(format!("sandbox task failed: {e}")))?;
                // A snippet that computed past the deadline without touching
                // a capability still counts as timed out.
                if result.is_ok() && started.elapsed() > timeout {
                    return Err(SandboxError::Timeout(timeout.as_millis() as u64));
                }
                result
            }
            // The blocking thread is abandoned; its next capability call
            // observes the deadline and unwinds.
            Err(_) => Err(SandboxError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Convenience wrapper collecting logs into the outcome.
    pub async fn execute_collect(
        &self,
        kind: SnippetKind,
        code: &str,
        input: Value,
        config: Value,
        services: SandboxServices,
    ) -> Result<SandboxOutcome, SandboxError> {
        let logs = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();
        let output = self
            .execute(
                kind,
                code,
                input,
                config,
                services,
                None,
                CancellationToken::new(),
                logs.clone(),
            )
            .await?;
        let taken_logs = std::mem::take(&mut *logs.lock());
        Ok(SandboxOutcome {
            output,
            logs: taken_logs,
            duration: started.elapsed(),
        })
    }
}

/// Static validation with default limits, for callers (seeder, block
/// registration) that have no sandbox instance at hand.
pub fn validate_snippet(code: &str) -> Result<(), SandboxError> {
    Sandbox::default().validate(code)
}

fn forbidden_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"\basync\s+function\b", "async function is not supported"),
            (r"\bawait\b", "await is not supported"),
            (r"\beval\s*\(", "eval is not allowed"),
            (r"\bnew\s+Function\b", "Function constructor is not allowed"),
            (r"\bFunction\s*\(", "Function constructor is not allowed"),
            (r"\brequire\s*\(", "require is not allowed"),
            (r"(?m)^\s*import\s", "import is not allowed"),
            (r"\b__proto__\b", "__proto__ access is not allowed"),
        ]
        .iter()
        .map(|(pattern, label)| (Regex::new(pattern).expect("static regex"), *label))
        .collect()
    })
}

/// Runs entirely on the blocking thread with the bridge installed.
fn evaluate_snippet(
    config: &SandboxConfig,
    kind: SnippetKind,
    code: &str,
    input: &Value,
    effective_config: &Value,
) -> Result<Value, SandboxError> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(config.loop_iteration_limit);

    let services = bridge::current_services()
        .ok_or_else(|| SandboxError::Internal("capability bridge not installed".into()))?;
    install_ctx(&mut context, &services)
        .map_err(|e| SandboxError::Internal(format!("failed to install ctx: {e}")))?;

    let input_js = JsValue::from_json(input, &mut context)
        .map_err(|e| SandboxError::Serialization(format!("input: {e}")))?;
    let config_js = JsValue::from_json(effective_config, &mut context)
        .map_err(|e| SandboxError::Serialization(format!("config: {e}")))?;
    context
        .register_global_property(js_string!("input"), input_js, Attribute::all())
        .map_err(|e| SandboxError::Internal(e.to_string()))?;
    context
        .register_global_property(js_string!("config"), config_js, Attribute::all())
        .map_err(|e| SandboxError::Internal(e.to_string()))?;

    context
        .eval(Source::from_bytes(HELPER_PREAMBLE))
        .map_err(|e| SandboxError::Internal(format!("preamble failed: {e}")))?;
    context
        .eval(Source::from_bytes(TEARDOWN))
        .map_err(|e| SandboxError::Internal(format!("teardown failed: {e}")))?;

    let call_script = match kind {
        SnippetKind::Main => {
            context
                .eval(Source::from_bytes(code))
                .map_err(|e| SandboxError::Execution(e.to_string()))?;
            r#"(function () {
    var __result = main(input, config, ctx);
    return JSON.stringify({ "output": __result === undefined ? null : __result });
})()"#
                .to_string()
        }
        SnippetKind::Transform => format!(
            r#"(function () {{
    var __result = (function (input, config, ctx) {{
{code}
    }})(input, config, ctx);
    if (__result === undefined) {{ __result = input; }}
    return JSON.stringify({{ "output": __result }});
}})()"#
        ),
    };

    let result = context
        .eval(Source::from_bytes(&call_script))
        .map_err(|e| SandboxError::Execution(e.to_string()))?;

    let raw = result
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| SandboxError::Execution("snippet result is not serializable".into()))?;

    if raw.len() > config.max_output_bytes {
        return Err(SandboxError::OutputTooLarge {
            max: config.max_output_bytes,
            actual: raw.len(),
        });
    }

    let wrapper: Value = serde_json::from_str(&raw)
        .map_err(|e| SandboxError::Serialization(format!("failed to parse result: {e}")))?;
    Ok(wrapper.get("output").cloned().unwrap_or(Value::Null))
}

/// Pure helpers available to every snippet, mirroring the host-side
/// expression module semantics.
const HELPER_PREAMBLE: &str = r#"
function getPath(obj, path) {
    if (path === undefined || path === null) return undefined;
    var p = String(path).trim();
    if (p.charAt(0) === '$') p = p.slice(1);
    var parts = p.split('.');
    var cur = obj;
    for (var i = 0; i < parts.length; i++) {
        var part = parts[i];
        if (part === '') continue;
        var key = part;
        var idxs = [];
        var bracket = part.indexOf('[');
        if (bracket >= 0) {
            key = part.slice(0, bracket);
            var re = /\[(\d+)\]/g;
            var m;
            while ((m = re.exec(part.slice(bracket))) !== null) idxs.push(parseInt(m[1], 10));
        }
        if (key !== '') {
            if (cur === null || typeof cur !== 'object') return undefined;
            cur = cur[key];
        }
        for (var j = 0; j < idxs.length; j++) {
            if (!Array.isArray(cur)) return undefined;
            cur = cur[idxs[j]];
        }
        if (cur === undefined) return undefined;
    }
    return cur;
}

function __parseLiteral(raw) {
    if (raw.length >= 2) {
        var first = raw.charAt(0), last = raw.charAt(raw.length - 1);
        if ((first === '"' && last === '"') || (first === "'" && last === "'")) {
            return raw.slice(1, -1);
        }
    }
    if (raw === 'true') return true;
    if (raw === 'false') return false;
    if (raw === 'null') return null;
    var n = Number(raw);
    return isNaN(n) ? raw : n;
}

function __looseEq(a, b) {
    if (a === b) return true;
    if (typeof a === 'number' && typeof b === 'string') return a === Number(b);
    if (typeof a === 'string' && typeof b === 'number') return Number(a) === b;
    if (typeof a === 'boolean' && typeof b === 'string') return String(a) === b.toLowerCase();
    if (typeof a === 'string' && typeof b === 'boolean') return a.toLowerCase() === String(b);
    if (a === null && b === null) return true;
    return false;
}

function evaluate(expr, data) {
    var e = String(expr).trim();
    if (e === '' || e === 'true') return true;
    if (e === 'false') return false;
    var ops = ['==', '!=', '>=', '<=', '>', '<'];
    for (var i = 0; i < ops.length; i++) {
        var pos = e.indexOf(ops[i]);
        if (pos >= 0) {
            var left = getPath(data, e.slice(0, pos).trim());
            if (left === undefined) left = null;
            var right = __parseLiteral(e.slice(pos + ops[i].length).trim());
            switch (ops[i]) {
                case '==': return __looseEq(left, right);
                case '!=': return !__looseEq(left, right);
                case '>=': return Number(left) >= Number(right);
                case '<=': return Number(left) <= Number(right);
                case '>': return Number(left) > Number(right);
                case '<': return Number(left) < Number(right);
            }
        }
    }
    var value = getPath(data, e);
    return !!value || value === true;
}

function renderTemplate(str, data) {
    var result = '';
    var rest = String(str);
    while (true) {
        var open = rest.indexOf('{{');
        if (open < 0) break;
        var close = rest.indexOf('}}', open + 2);
        if (close < 0) break;
        result += rest.slice(0, open);
        var value = getPath(data, rest.slice(open + 2, close).trim());
        if (value !== undefined && value !== null) {
            result += typeof value === 'string' ? value : JSON.stringify(value);
        }
        rest = rest.slice(close + 2);
    }
    return result + rest;
}
"#;

/// Remove the escape hatches before user code runs.
const TEARDOWN: &str = r#"
(function (g) {
    try { delete g.eval; } catch (e) { g.eval = undefined; }
    try { delete g.Function; } catch (e) { g.Function = undefined; }
})(typeof globalThis !== 'undefined' ? globalThis : this);
"#;
