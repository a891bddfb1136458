//! Host-function bridge between the boa interpreter and async capabilities.
//!
//! The sandbox runs on a dedicated blocking thread. Before evaluation the
//! thread installs a [`CapabilityBridge`] into a thread-local; every `ctx.*`
//! host function reaches it from there and drives the async capability with
//! `Handle::block_on`, so the call appears synchronous to JS while the
//! tokio runtime keeps making progress. The deadline and cancellation token
//! are checked around every capability call; tripping either records an
//! interrupt that the sandbox maps to a typed error after evaluation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsNativeError, JsResult, JsValue, NativeFunction};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{CapabilityError, HttpRequest, SandboxServices};
use crate::model::StepLogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Timeout,
    Cancelled,
}

pub(crate) struct CapabilityBridge {
    pub handle: Handle,
    pub services: SandboxServices,
    pub logs: Arc<Mutex<Vec<StepLogEntry>>>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    pub interrupt: RefCell<Option<Interrupt>>,
}

thread_local! {
    static BRIDGE: RefCell<Option<CapabilityBridge>> = const { RefCell::new(None) };
}

/// Install the bridge for the duration of `f` and always remove it after.
pub(crate) fn with_installed_bridge<R>(bridge: CapabilityBridge, f: impl FnOnce() -> R) -> (R, Option<Interrupt>) {
    BRIDGE.with(|slot| *slot.borrow_mut() = Some(bridge));
    let result = f();
    let interrupt = BRIDGE.with(|slot| {
        slot.borrow_mut()
            .take()
            .and_then(|bridge| *bridge.interrupt.borrow())
    });
    (result, interrupt)
}

/// Clone of the installed services, used to build the `ctx` object.
pub(crate) fn current_services() -> Option<SandboxServices> {
    BRIDGE.with(|slot| slot.borrow().as_ref().map(|bridge| bridge.services.clone()))
}

fn dispatch<T>(
    op: impl FnOnce(&CapabilityBridge) -> Result<T, CapabilityError>,
) -> JsResult<T> {
    BRIDGE.with(|slot| {
        let slot = slot.borrow();
        let bridge = slot
            .as_ref()
            .ok_or_else(|| JsNativeError::error().with_message("capability bridge not installed"))?;

        if bridge.cancel.is_cancelled() {
            bridge.interrupt.replace(Some(Interrupt::Cancelled));
            return Err(JsNativeError::error()
                .with_message("execution cancelled")
                .into());
        }
        if Instant::now() >= bridge.deadline {
            bridge.interrupt.replace(Some(Interrupt::Timeout));
            return Err(JsNativeError::error()
                .with_message("execution deadline exceeded")
                .into());
        }

        op(bridge).map_err(|err| JsNativeError::error().with_message(err.to_string()).into())
    })
}

impl CapabilityBridge {
    /// Block the interpreter thread on a capability future, honoring the
    /// deadline and cancellation token.
    fn block_on<T>(
        &self,
        fut: impl Future<Output = Result<T, CapabilityError>>,
    ) -> Result<T, CapabilityError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        self.handle.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.interrupt.replace(Some(Interrupt::Cancelled));
                    Err(CapabilityError::new("EXEC_002", "execution cancelled"))
                }
                _ = tokio::time::sleep(remaining) => {
                    self.interrupt.replace(Some(Interrupt::Timeout));
                    Err(CapabilityError::new("SYS_002", "execution deadline exceeded"))
                }
                result = fut => result,
            }
        })
    }
}

/// Build the `ctx` global and register it into the interpreter context.
pub(crate) fn install_ctx(context: &mut Context, services: &SandboxServices) -> JsResult<()> {
    let http = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(http_get), js_string!("get"), 1)
        .function(NativeFunction::from_fn_ptr(http_post), js_string!("post"), 2)
        .function(NativeFunction::from_fn_ptr(http_put), js_string!("put"), 2)
        .function(NativeFunction::from_fn_ptr(http_delete), js_string!("delete"), 1)
        .function(NativeFunction::from_fn_ptr(http_request), js_string!("request"), 3)
        .build();

    let llm = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(llm_chat), js_string!("chat"), 3)
        .function(NativeFunction::from_fn_ptr(llm_complete), js_string!("complete"), 3)
        .build();

    let workflow = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(workflow_run), js_string!("run"), 2)
        .build();

    let human = ObjectInitializer::new(context)
        .function(
            NativeFunction::from_fn_ptr(human_request_approval),
            js_string!("requestApproval"),
            1,
        )
        .build();

    let adapter = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(adapter_call), js_string!("call"), 2)
        .function(NativeFunction::from_fn_ptr(adapter_list), js_string!("list"), 0)
        .build();

    let embedding = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(embedding_embed), js_string!("embed"), 1)
        .build();

    let vector = ObjectInitializer::new(context)
        .function(NativeFunction::from_fn_ptr(vector_upsert), js_string!("upsert"), 2)
        .function(NativeFunction::from_fn_ptr(vector_query), js_string!("query"), 2)
        .function(NativeFunction::from_fn_ptr(vector_delete), js_string!("delete"), 2)
        .function(
            NativeFunction::from_fn_ptr(vector_list_collections),
            js_string!("listCollections"),
            0,
        )
        .build();

    let secrets = string_map_to_js(&services.secrets, context)?;
    let env = string_map_to_js(&services.env, context)?;

    let ctx = ObjectInitializer::new(context)
        .property(js_string!("http"), http, Attribute::READONLY)
        .property(js_string!("llm"), llm, Attribute::READONLY)
        .property(js_string!("workflow"), workflow, Attribute::READONLY)
        .property(js_string!("human"), human, Attribute::READONLY)
        .property(js_string!("adapter"), adapter, Attribute::READONLY)
        .property(js_string!("embedding"), embedding, Attribute::READONLY)
        .property(js_string!("vector"), vector, Attribute::READONLY)
        .property(js_string!("secrets"), secrets, Attribute::READONLY)
        .property(js_string!("env"), env, Attribute::READONLY)
        .function(NativeFunction::from_fn_ptr(ctx_log), js_string!("log"), 2)
        .build();

    context.register_global_property(js_string!("ctx"), ctx, Attribute::READONLY)?;
    Ok(())
}

fn string_map_to_js(
    map: &HashMap<String, String>,
    context: &mut Context,
) -> JsResult<JsValue> {
    let value = Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    JsValue::from_json(&value, context)
}

// ---- argument helpers ----

fn string_arg(args: &[JsValue], index: usize, name: &str) -> JsResult<String> {
    args.get(index)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("argument '{name}' must be a string"))
                .into()
        })
}

fn json_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<Value> {
    match args.get(index) {
        None => Ok(Value::Null),
        Some(v) if v.is_undefined() || v.is_null() => Ok(Value::Null),
        Some(v) => v.to_json(context),
    }
}

fn reply(value: Value, context: &mut Context) -> JsResult<JsValue> {
    JsValue::from_json(&value, context)
}

// ---- ctx.http ----

fn build_http_request(
    method: &str,
    url: String,
    body: Value,
    options: Value,
) -> HttpRequest {
    let headers = options
        .get("headers")
        .and_then(|v| v.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();
    let timeout_ms = options.get("timeout_ms").and_then(|v| v.as_u64());
    HttpRequest {
        method: method.to_string(),
        url,
        headers,
        body: if body.is_null() { None } else { Some(body) },
        timeout_ms,
    }
}

fn http_call(
    method: &str,
    url: String,
    body: Value,
    options: Value,
    context: &mut Context,
) -> JsResult<JsValue> {
    let request = build_http_request(method, url, body, options);
    let value = dispatch(|bridge| {
        bridge
            .block_on(bridge.services.http.request(request))
            .map(|response| response.to_value())
    })?;
    reply(value, context)
}

fn http_get(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, "url")?;
    let options = json_arg(args, 1, context)?;
    http_call("GET", url, Value::Null, options, context)
}

fn http_post(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, "url")?;
    let body = json_arg(args, 1, context)?;
    let options = json_arg(args, 2, context)?;
    http_call("POST", url, body, options, context)
}

fn http_put(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, "url")?;
    let body = json_arg(args, 1, context)?;
    let options = json_arg(args, 2, context)?;
    http_call("PUT", url, body, options, context)
}

fn http_delete(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let url = string_arg(args, 0, "url")?;
    let options = json_arg(args, 1, context)?;
    http_call("DELETE", url, Value::Null, options, context)
}

fn http_request(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let method = string_arg(args, 0, "method")?;
    let url = string_arg(args, 1, "url")?;
    let body = json_arg(args, 2, context)?;
    let options = json_arg(args, 3, context)?;
    http_call(&method, url, body, options, context)
}

// ---- ctx.llm ----

fn llm_chat(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let provider = string_arg(args, 0, "provider")?;
    let model = string_arg(args, 1, "model")?;
    let request = json_arg(args, 2, context)?;
    let value = dispatch(|bridge| {
        bridge
            .block_on(bridge.services.llm.chat(&provider, &model, request))
            .map(|response| response.to_value())
    })?;
    reply(value, context)
}

fn llm_complete(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let provider = string_arg(args, 0, "provider")?;
    let model = string_arg(args, 1, "model")?;
    let request = json_arg(args, 2, context)?;
    let value = dispatch(|bridge| {
        bridge
            .block_on(bridge.services.llm.complete(&provider, &model, request))
            .map(|response| response.to_value())
    })?;
    reply(value, context)
}

// ---- ctx.workflow ----

fn workflow_run(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let project_raw = string_arg(args, 0, "projectId")?;
    let input = json_arg(args, 1, context)?;
    let start_raw = match args.get(2) {
        Some(v) if !v.is_undefined() && !v.is_null() => Some(string_arg(args, 2, "startStepId")?),
        _ => None,
    };

    let value = dispatch(|bridge| {
        let project_id = Uuid::parse_str(&project_raw)
            .map_err(|_| CapabilityError::new("INP_001", "projectId must be a UUID"))?;
        let start_step_id = match &start_raw {
            Some(raw) => Some(
                Uuid::parse_str(raw)
                    .map_err(|_| CapabilityError::new("INP_001", "startStepId must be a UUID"))?,
            ),
            None => None,
        };
        bridge.block_on(bridge.services.workflow.run(project_id, start_step_id, input))
    })?;
    reply(value, context)
}

// ---- ctx.human ----

fn human_request_approval(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let request = json_arg(args, 0, context)?;
    let value = dispatch(|bridge| bridge.block_on(bridge.services.human.request_approval(request)))?;
    reply(value, context)
}

// ---- ctx.adapter ----

fn adapter_call(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let adapter = string_arg(args, 0, "adapter")?;
    let input = json_arg(args, 1, context)?;
    let value = dispatch(|bridge| bridge.block_on(bridge.services.adapter.call(&adapter, input)))?;
    reply(value, context)
}

fn adapter_list(_this: &JsValue, _args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = dispatch(|bridge| bridge.block_on(bridge.services.adapter.list()))?;
    reply(value, context)
}

// ---- ctx.embedding / ctx.vector ----

fn embedding_embed(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let texts = match json_arg(args, 0, context)? {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        _ => {
            return Err(JsNativeError::typ()
                .with_message("embed expects a string or array of strings")
                .into())
        }
    };
    let value = dispatch(|bridge| bridge.block_on(bridge.services.embedding.embed(texts)))?;
    reply(value, context)
}

fn vector_upsert(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let collection = string_arg(args, 0, "collection")?;
    let points = json_arg(args, 1, context)?;
    let value = dispatch(|bridge| bridge.block_on(bridge.services.vector.upsert(&collection, points)))?;
    reply(value, context)
}

fn vector_query(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let collection = string_arg(args, 0, "collection")?;
    let query = json_arg(args, 1, context)?;
    let value = dispatch(|bridge| bridge.block_on(bridge.services.vector.query(&collection, query)))?;
    reply(value, context)
}

fn vector_delete(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let collection = string_arg(args, 0, "collection")?;
    let ids = json_arg(args, 1, context)?;
    let value = dispatch(|bridge| bridge.block_on(bridge.services.vector.delete(&collection, ids)))?;
    reply(value, context)
}

fn vector_list_collections(
    _this: &JsValue,
    _args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let value = dispatch(|bridge| bridge.block_on(bridge.services.vector.list_collections()))?;
    reply(value, context)
}

// ---- ctx.log ----

fn ctx_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = args
        .get(0)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|| "info".to_string());
    let message = args
        .get(1)
        .and_then(|v| v.as_string())
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_default();
    let data = match json_arg(args, 2, context)? {
        Value::Null => None,
        value => Some(value),
    };

    dispatch(|bridge| {
        bridge.logs.lock().push(StepLogEntry {
            level,
            message,
            data,
            at: Utc::now(),
        });
        Ok(())
    })?;
    Ok(JsValue::undefined())
}
