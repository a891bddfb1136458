//! Builtin system blocks.
//!
//! Every step type maps to one of these slugs unless the step pins a
//! specific block definition. Snippets are bare bodies executed with
//! `input`, `config` and `ctx` in scope; `return` produces the step output.

use serde_json::json;

use crate::model::{BlockCategory, BlockDefinition, ErrorCodeDef};

pub fn system_blocks() -> Vec<BlockDefinition> {
    vec![
        start_block(),
        code_block(),
        http_block(),
        llm_block(),
        condition_block(),
        switch_block(),
        router_block(),
        map_block(),
        wait_block(),
        subflow_block(),
        human_in_loop_block(),
        log_block(),
        tool_block(),
    ]
}

fn start_block() -> BlockDefinition {
    BlockDefinition::system("start", "Start", BlockCategory::Control)
        .with_code("return input;")
}

/// Runs the snippet carried in the step's own config. The engine swaps
/// `config.code` in as the executable snippet (see the step executor), so
/// this block's code only covers direct invocations without one.
fn code_block() -> BlockDefinition {
    BlockDefinition::system("code", "Code", BlockCategory::Utility)
        .with_code("return input;")
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "code": { "type": "string" }
            }
        }))
}

fn http_block() -> BlockDefinition {
    BlockDefinition::system("http", "HTTP Request", BlockCategory::Integration)
        .with_code(
            r#"var method = (config.method || 'GET').toUpperCase();
var body = config.body !== undefined && config.body !== null ? config.body : (input && input.body !== undefined ? input.body : null);
var response = ctx.http.request(method, config.url, body, {
    headers: config.headers || {},
    timeout_ms: config.timeout_ms
});
if (response.status >= 400) {
    throw new Error('[HTTP_' + response.status + '] request failed with status ' + response.status);
}
return response;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string" },
                "headers": { "type": "object" },
                "body": {},
                "timeout_ms": { "type": "integer", "minimum": 1 }
            }
        }))
        .with_config_defaults(json!({"method": "GET", "timeout_ms": 30000}))
        .with_error_codes(vec![
            retryable("HTTP_429", "RATE_LIMIT", "Upstream rate limit"),
            retryable("HTTP_500", "SERVER_ERROR", "Upstream server error"),
            retryable("HTTP_502", "BAD_GATEWAY", "Upstream bad gateway"),
            retryable("HTTP_503", "UNAVAILABLE", "Upstream unavailable"),
            retryable("HTTP_504", "GATEWAY_TIMEOUT", "Upstream timeout"),
            permanent("HTTP_400", "BAD_REQUEST", "Request rejected"),
            permanent("HTTP_401", "UNAUTHORIZED", "Authentication failed"),
            permanent("HTTP_403", "FORBIDDEN", "Access denied"),
            permanent("HTTP_404", "NOT_FOUND", "Resource not found"),
        ])
}

fn llm_block() -> BlockDefinition {
    BlockDefinition::system("llm", "LLM Call", BlockCategory::Ai)
        .with_code(
            r#"var request = {
    messages: input && input.messages ? input.messages : [],
    temperature: config.temperature,
    max_tokens: config.max_tokens
};
if (config.system_prompt) {
    request.messages = [{ role: 'system', content: config.system_prompt }].concat(request.messages);
}
var response = ctx.llm.chat(config.provider, config.model, request);
return { content: response.content, usage: response.usage };"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "required": ["provider", "model"],
            "properties": {
                "provider": { "type": "string" },
                "model": { "type": "string" },
                "system_prompt": { "type": "string" },
                "temperature": { "type": "number" },
                "max_tokens": { "type": "integer" }
            }
        }))
        .with_error_codes(vec![
            retryable("LLM_001", "RATE_LIMIT", "Provider rate limit"),
            retryable("LLM_002", "OVERLOADED", "Provider overloaded"),
            permanent("LLM_003", "CONTEXT_TOO_LONG", "Prompt exceeds context window"),
        ])
}

fn condition_block() -> BlockDefinition {
    BlockDefinition::system("condition", "Condition", BlockCategory::Logic)
        .with_code(
            r#"var output = {};
for (var key in input) { output[key] = input[key]; }
output.__branch = evaluate(config.expression, input) ? 'then' : 'else';
return output;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "required": ["expression"],
            "properties": {
                "expression": { "type": "string" }
            }
        }))
}

fn switch_block() -> BlockDefinition {
    BlockDefinition::system("switch", "Switch", BlockCategory::Logic)
        .with_code(
            r#"var output = {};
for (var key in input) { output[key] = input[key]; }
var cases = config.cases || [];
var port = config.default_port || 'default';
for (var i = 0; i < cases.length; i++) {
    if (evaluate(cases[i].expression, input)) {
        port = cases[i].port;
        break;
    }
}
output.__branch = port;
return output;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "cases": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["port", "expression"],
                        "properties": {
                            "port": { "type": "string" },
                            "expression": { "type": "string" }
                        }
                    }
                },
                "default_port": { "type": "string" }
            }
        }))
}

fn router_block() -> BlockDefinition {
    BlockDefinition::system("router", "Router", BlockCategory::Logic)
        .with_code(
            r#"var output = {};
for (var key in input) { output[key] = input[key]; }
var routes = config.routes || [];
var port = config.fallback_port || 'default';
for (var i = 0; i < routes.length; i++) {
    if (evaluate(routes[i].expression, input)) {
        port = routes[i].port;
        break;
    }
}
output.__branch = port;
return output;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "routes": { "type": "array" },
                "fallback_port": { "type": "string" }
            }
        }))
}

fn map_block() -> BlockDefinition {
    BlockDefinition::system("map", "Map Fields", BlockCategory::Data)
        .with_code(
            r#"var mapping = config.mapping || {};
var output = {};
for (var key in mapping) {
    var value = getPath(input, mapping[key]);
    output[key] = value === undefined ? null : value;
}
return output;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "required": ["mapping"],
            "properties": {
                "mapping": { "type": "object" }
            }
        }))
}

/// Waiting happens host-side (short sleeps in the worker, long waits as a
/// delayed re-enqueue); the block itself just forwards its input.
fn wait_block() -> BlockDefinition {
    BlockDefinition::system("wait", "Wait", BlockCategory::Control)
        .with_code("return input;")
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "duration_ms": { "type": "integer", "minimum": 0 }
            }
        }))
        .with_config_defaults(json!({"duration_ms": 0}))
}

fn subflow_block() -> BlockDefinition {
    BlockDefinition::system("subflow", "Sub-workflow", BlockCategory::Control)
        .with_code(
            r#"var payload = config.input_path ? getPath(input, config.input_path) : input;
return ctx.workflow.run(config.project_id, payload === undefined ? null : payload, config.start_step_id);"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "required": ["project_id"],
            "properties": {
                "project_id": { "type": "string" },
                "start_step_id": { "type": "string" },
                "input_path": { "type": "string" }
            }
        }))
}

fn human_in_loop_block() -> BlockDefinition {
    BlockDefinition::system("human_in_loop", "Human Approval", BlockCategory::Control)
        .with_code(
            r#"var approval = ctx.human.requestApproval({
    message: config.message || 'Approval required',
    data: input
});
var output = {};
for (var key in input) { output[key] = input[key]; }
output.approval = approval;
return output;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "timeout_hours": { "type": "integer" }
            }
        }))
}

fn log_block() -> BlockDefinition {
    BlockDefinition::system("log", "Log", BlockCategory::Utility)
        .with_code(
            r#"ctx.log(config.level || 'info', renderTemplate(config.message || '', input));
return input;"#,
        )
        .with_config_schema(json!({
            "type": "object",
            "properties": {
                "level": { "type": "string" },
                "message": { "type": "string" }
            }
        }))
}

fn tool_block() -> BlockDefinition {
    BlockDefinition::system("tool", "Adapter Tool", BlockCategory::Integration)
        .with_code("return ctx.adapter.call(config.adapter, input);")
        .with_config_schema(json!({
            "type": "object",
            "required": ["adapter"],
            "properties": {
                "adapter": { "type": "string" },
                "operation": { "type": "string" }
            }
        }))
}

fn retryable(code: &str, name: &str, description: &str) -> ErrorCodeDef {
    ErrorCodeDef {
        code: code.into(),
        name: name.into(),
        description: description.into(),
        retryable: true,
    }
}

fn permanent(code: &str, name: &str, description: &str) -> ErrorCodeDef {
    ErrorCodeDef {
        code: code.into(),
        name: name.into(),
        description: description.into(),
        retryable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::validate_snippet;

    #[test]
    fn test_all_seeds_are_system_blocks() {
        for block in system_blocks() {
            assert!(block.is_system, "{} must be a system block", block.slug);
            assert!(block.tenant_id.is_none());
            assert!(block.has_own_code(), "{} must carry code", block.slug);
        }
    }

    #[test]
    fn test_seed_snippets_pass_validation() {
        for block in system_blocks() {
            validate_snippet(&block.code)
                .unwrap_or_else(|e| panic!("seed block {} failed validation: {e}", block.slug));
        }
    }

    #[test]
    fn test_http_error_codes_classify_retries() {
        let http = http_block();
        let retryable = |code: &str| {
            http.error_codes
                .iter()
                .find(|def| def.code == code)
                .map(|def| def.retryable)
                .unwrap()
        };
        assert!(retryable("HTTP_429"));
        assert!(retryable("HTTP_503"));
        assert!(!retryable("HTTP_404"));
    }

    #[test]
    fn test_slugs_are_unique() {
        let blocks = system_blocks();
        let mut slugs: Vec<&str> = blocks.iter().map(|b| b.slug.as_str()).collect();
        slugs.sort();
        let before = slugs.len();
        slugs.dedup();
        assert_eq!(before, slugs.len());
    }
}
