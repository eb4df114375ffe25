//! Shared-function call pipeline: the staged state machine that prepares,
//! invokes and observes one call, plus the engine-side per-call state its
//! V8 callbacks resolve against.
//!
//! A call advances through [`CallStage`]s, one engine-loop turn each. Every
//! stage runs on the engine thread with exclusive context access and submits
//! the next stage through the same FIFO command channel, so turns of one
//! call stay ordered while concurrent calls interleave between turns.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::error::JsError;
use deno_core::v8;
use tokio::sync::mpsc::WeakUnboundedSender;

use crate::runtime::call_context::SharedFunctionRequestContext;
use crate::runtime::error::{JsExceptionDetails, RuntimeError, RuntimeResult};
use crate::runtime::js_value::{JSValue, SerializationLimits};
use crate::runtime::marshal;
use crate::runtime::request_object;
use crate::runtime::rpc::{FunctionCallState, FunctionSignature, RpcRequest, ABORT_ENGINE_ERROR};
use crate::runtime::runner::{engine_value_to_host, RuntimeCommand, RuntimeCoreState};
use crate::runtime::shield;

/// Interval between promise-state polls while the wrapper promise is
/// pending. A compromise between latency and engine-loop pressure.
pub(crate) const PROMISE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Engine-loop turns of one call, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallStage {
    /// Marshal parameters and build the request object.
    Prepare,
    /// Evaluate the wrapper script, build the shield, assemble arguments.
    BuildProxy,
    /// Call the wrapper.
    Invoke,
    /// Verify the promise and attach settlement callbacks.
    Attach,
    /// Observe promise state without an active wait.
    Poll,
}

/// Values produced by earlier turns for later ones.
#[derive(Default)]
pub(crate) struct PreparedCall {
    request_obj: Option<v8::Global<v8::Object>>,
    arguments: Vec<v8::Global<v8::Value>>,
    wrapper: Option<v8::Global<v8::Function>>,
    invoke_args: Vec<v8::Global<v8::Value>>,
    result: Option<v8::Global<v8::Value>>,
    promise: Option<v8::Global<v8::Promise>>,
}

pub(crate) struct TimerEntry {
    callback: v8::Global<v8::Function>,
    repeating: bool,
    interval: Duration,
}

/// Engine-side state of one in-flight call. Dropped at teardown, on the
/// engine thread, releasing all V8 globals.
pub(crate) struct CallBindings {
    pub(crate) call_id: u64,
    pub(crate) function: v8::Global<v8::Function>,
    pub(crate) signature: FunctionSignature,
    pub(crate) request: RpcRequest,
    pub(crate) context: Arc<SharedFunctionRequestContext>,
    prepared: RefCell<PreparedCall>,
    timers: RefCell<HashMap<u32, TimerEntry>>,
    next_timer_id: Cell<u32>,
    promises: RefCell<Vec<v8::Global<v8::PromiseResolver>>>,
}

impl CallBindings {
    pub(crate) fn new(
        call_id: u64,
        function: v8::Global<v8::Function>,
        signature: FunctionSignature,
        request: RpcRequest,
        context: Arc<SharedFunctionRequestContext>,
    ) -> Self {
        Self {
            call_id,
            function,
            signature,
            request,
            context,
            prepared: RefCell::new(PreparedCall::default()),
            timers: RefCell::new(HashMap::new()),
            next_timer_id: Cell::new(1),
            promises: RefCell::new(Vec::new()),
        }
    }

    /// Drop all timer entries, reporting each as finished to the context.
    pub(crate) fn cancel_timers(&self) {
        let drained: Vec<TimerEntry> = self.timers.borrow_mut().drain().map(|(_, e)| e).collect();
        for _ in &drained {
            self.context.timer_finished();
        }
    }
}

/// Registry of in-flight calls, stored in an isolate slot so V8 callbacks
/// can resolve the call id carried in their data value.
#[derive(Clone)]
pub(crate) struct CallRegistry {
    calls: Rc<RefCell<HashMap<u64, Rc<CallBindings>>>>,
    tx: WeakUnboundedSender<RuntimeCommand>,
    limits: SerializationLimits,
}

impl CallRegistry {
    pub(crate) fn new(tx: WeakUnboundedSender<RuntimeCommand>, limits: SerializationLimits) -> Self {
        Self {
            calls: Rc::new(RefCell::new(HashMap::new())),
            tx,
            limits,
        }
    }

    pub(crate) fn insert(&self, bindings: Rc<CallBindings>) {
        self.calls.borrow_mut().insert(bindings.call_id, bindings);
    }

    pub(crate) fn get(&self, call_id: u64) -> Option<Rc<CallBindings>> {
        self.calls.borrow().get(&call_id).cloned()
    }

    pub(crate) fn remove(&self, call_id: u64) -> Option<Rc<CallBindings>> {
        self.calls.borrow_mut().remove(&call_id)
    }

    pub(crate) fn drain(&self) -> Vec<Rc<CallBindings>> {
        self.calls.borrow_mut().drain().map(|(_, b)| b).collect()
    }

    pub(crate) fn limits(&self) -> SerializationLimits {
        self.limits
    }

    fn submit(&self, command: RuntimeCommand) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }
}

/// Run one stage of one call. Missing bindings mean the call was already
/// torn down; a terminal context tears it down now.
pub(crate) fn run_call_stage(core: &mut RuntimeCoreState, call_id: u64, stage: CallStage) {
    let bindings = match core.calls.get(call_id) {
        Some(bindings) => bindings,
        None => return,
    };

    if bindings.context.is_terminal() {
        teardown_call(core, call_id);
        return;
    }

    let result = match stage {
        CallStage::Prepare => stage_prepare(core, &bindings),
        CallStage::BuildProxy => stage_build_proxy(core, &bindings),
        CallStage::Invoke => stage_invoke(core, &bindings),
        CallStage::Attach => stage_attach(core, &bindings),
        CallStage::Poll => stage_poll(core, &bindings),
    };

    if let Err(err) = result {
        fail_call(core, &bindings, stage, err);
    }
}

fn fail_call(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>, stage: CallStage, err: RuntimeError) {
    if matches!(err, RuntimeError::ContractViolation { .. }) {
        tracing::error!(
            call_id = bindings.call_id,
            ?stage,
            error = %err,
            "call pipeline contract violation"
        );
    } else {
        tracing::debug!(call_id = bindings.call_id, ?stage, error = %err, "call pipeline stage failed");
    }
    bindings
        .context
        .write_request_return_response(err.terminal_state());
    teardown_call(core, bindings.call_id);
}

/// First turn: marshal parameters and build the request object.
fn stage_prepare(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>) -> RuntimeResult<()> {
    {
        let scope = &mut core.js_runtime.handle_scope();
        let converted =
            marshal::convert_params(scope, &bindings.signature, &bindings.request.params)?;
        let request_obj =
            request_object::build_request_object(scope, bindings.call_id, &bindings.request)?;

        let mut prepared = bindings.prepared.borrow_mut();
        prepared.arguments = converted
            .iter()
            .map(|value| v8::Global::new(scope, *value))
            .collect();
        prepared.request_obj = Some(v8::Global::new(scope, request_obj));
    }
    core.submit_stage(bindings.call_id, CallStage::BuildProxy)
}

/// Second turn: evaluate the wrapper script, build the shield and assemble
/// the final argument list `[userFn, shield, requestObj, ...convertedValues]`.
fn stage_build_proxy(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>) -> RuntimeResult<()> {
    let wrapper = shield::evaluate_wrapper(&mut core.js_runtime)?;
    {
        let scope = &mut core.js_runtime.handle_scope();
        let shield_obj = shield::build_proxy_shield(scope, bindings.call_id)?;

        let mut prepared = bindings.prepared.borrow_mut();
        let request_obj = prepared
            .request_obj
            .clone()
            .ok_or_else(|| RuntimeError::internal("request object missing in build stage"))?;

        let mut invoke_args: Vec<v8::Global<v8::Value>> =
            Vec::with_capacity(prepared.arguments.len() + 3);

        let user_fn = v8::Local::new(scope, &bindings.function);
        let user_fn: v8::Local<v8::Value> = user_fn.into();
        invoke_args.push(v8::Global::new(scope, user_fn));

        let shield_value: v8::Local<v8::Value> = shield_obj.into();
        invoke_args.push(v8::Global::new(scope, shield_value));

        let request_local = v8::Local::new(scope, &request_obj);
        let request_value: v8::Local<v8::Value> = request_local.into();
        invoke_args.push(v8::Global::new(scope, request_value));

        for argument in &prepared.arguments {
            let local = v8::Local::new(scope, argument);
            invoke_args.push(v8::Global::new(scope, local));
        }

        prepared.invoke_args = invoke_args;
        prepared.wrapper = Some(wrapper);
    }
    core.submit_stage(bindings.call_id, CallStage::Invoke)
}

/// Third turn: call the wrapper. A synchronous throw becomes a user
/// exception.
fn stage_invoke(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>) -> RuntimeResult<()> {
    {
        let scope = &mut core.js_runtime.handle_scope();
        let mut try_catch = v8::TryCatch::new(scope);

        let (wrapper, args) = {
            let prepared = bindings.prepared.borrow();
            let wrapper = prepared
                .wrapper
                .clone()
                .ok_or_else(|| RuntimeError::internal("wrapper missing in invoke stage"))?;
            let args: Vec<v8::Local<v8::Value>> = prepared
                .invoke_args
                .iter()
                .map(|global| v8::Local::new(&mut try_catch, global))
                .collect();
            (wrapper, args)
        };

        let wrapper = v8::Local::new(&mut try_catch, &wrapper);
        let receiver: v8::Local<v8::Value> = v8::undefined(&mut try_catch).into();

        match wrapper.call(&mut try_catch, receiver, &args) {
            Some(result) => {
                bindings.prepared.borrow_mut().result =
                    Some(v8::Global::new(&mut try_catch, result));
            }
            None => {
                let details = exception_details(&mut try_catch);
                return Err(RuntimeError::javascript(details));
            }
        }
    }
    core.submit_stage(bindings.call_id, CallStage::Attach)
}

/// Fourth turn: verify the wrapper returned a promise and attach settlement
/// callbacks; the fulfilled handler is the sole terminator of the happy
/// path, the rejected handler reports the stringified reason.
fn stage_attach(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>) -> RuntimeResult<()> {
    {
        let scope = &mut core.js_runtime.handle_scope();
        let result = bindings
            .prepared
            .borrow()
            .result
            .clone()
            .ok_or_else(|| RuntimeError::internal("call result missing in attach stage"))?;
        let result = v8::Local::new(scope, &result);

        if !result.is_promise() {
            return Err(RuntimeError::contract(
                "proxy wrapper returned a non-promise value",
            ));
        }
        let promise = v8::Local::<v8::Promise>::try_from(result)
            .map_err(|_| RuntimeError::engine("failed to cast wrapper result to a promise"))?;

        let data: v8::Local<v8::Value> = v8::Number::new(scope, bindings.call_id as f64).into();
        let on_fulfilled = v8::Function::builder(promise_fulfilled_callback)
            .data(data)
            .build(scope)
            .ok_or_else(|| RuntimeError::engine("failed to create fulfillment callback"))?;
        let on_rejected = v8::Function::builder(promise_rejected_callback)
            .data(data)
            .build(scope)
            .ok_or_else(|| RuntimeError::engine("failed to create rejection callback"))?;

        let chained = promise
            .then2(scope, on_fulfilled, on_rejected)
            .ok_or_else(|| RuntimeError::engine("failed to attach settlement callbacks"))?;
        // Covers rejections thrown inside the then-handlers themselves.
        chained
            .catch(scope, on_rejected)
            .ok_or_else(|| RuntimeError::engine("failed to attach catch callback"))?;

        bindings.prepared.borrow_mut().promise = Some(v8::Global::new(scope, promise));
    }
    core.submit_stage(bindings.call_id, CallStage::Poll)
}

/// Poll turn: observe promise state. Never emits an outcome itself; it keeps
/// the microtask queue moving for rejections and re-arms itself while the
/// promise is pending.
fn stage_poll(core: &mut RuntimeCoreState, bindings: &Rc<CallBindings>) -> RuntimeResult<()> {
    let state = {
        let scope = &mut core.js_runtime.handle_scope();
        let promise = bindings
            .prepared
            .borrow()
            .promise
            .clone()
            .ok_or_else(|| RuntimeError::internal("promise missing in poll stage"))?;
        let promise = v8::Local::new(scope, &promise);
        promise.state()
    };

    match state {
        v8::PromiseState::Pending => {
            core.arm_poll(bindings.call_id);
        }
        v8::PromiseState::Rejected => {
            let scope = &mut core.js_runtime.handle_scope();
            scope.perform_microtask_checkpoint();
        }
        v8::PromiseState::Fulfilled => {
            // The fulfillment callback is the sole terminator here.
        }
    }
    Ok(())
}

/// Drop a call's engine-side state and cancel its timers. Idempotent.
pub(crate) fn teardown_call(core: &mut RuntimeCoreState, call_id: u64) {
    let bindings = match core.calls.remove(call_id) {
        Some(bindings) => bindings,
        None => return,
    };
    bindings.cancel_timers();
    bindings.promises.borrow_mut().clear();
    tracing::debug!(call_id, "call torn down");
}

/// Run one due user timer. Fired by the dispatcher's timer wheel.
pub(crate) fn run_user_timer(core: &mut RuntimeCoreState, call_id: u64, timer_id: u32) {
    let bindings = match core.calls.get(call_id) {
        Some(bindings) => bindings,
        None => return,
    };
    if bindings.context.is_terminal() {
        teardown_call(core, call_id);
        return;
    }

    let (callback, repeating, interval) = {
        let timers = bindings.timers.borrow();
        match timers.get(&timer_id) {
            Some(entry) => (entry.callback.clone(), entry.repeating, entry.interval),
            // Cancelled between arming and firing.
            None => return,
        }
    };

    let thrown = {
        let scope = &mut core.js_runtime.handle_scope();
        let mut try_catch = v8::TryCatch::new(scope);
        let callback = v8::Local::new(&mut try_catch, &callback);
        let receiver: v8::Local<v8::Value> = v8::undefined(&mut try_catch).into();
        match callback.call(&mut try_catch, receiver, &[]) {
            Some(_) => None,
            None => Some(exception_details(&mut try_catch)),
        }
    };

    if let Some(details) = thrown {
        bindings.context.function_call_exception(details.summary());
    }

    if repeating
        && !bindings.context.is_terminal()
        && bindings.timers.borrow().contains_key(&timer_id)
    {
        core.arm_timer(call_id, timer_id, interval);
    } else if bindings.timers.borrow_mut().remove(&timer_id).is_some() {
        bindings.context.timer_finished();
    }
}

/// Attach a host callback to `object` under `name`, carrying the call id as
/// the callback's data value.
pub(crate) fn bind_callback<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
    call_id: u64,
) -> RuntimeResult<()> {
    let data: v8::Local<v8::Value> = v8::Number::new(scope, call_id as f64).into();
    let function = v8::Function::builder(callback)
        .data(data)
        .build(scope)
        .ok_or_else(|| RuntimeError::engine(format!("failed to create '{name}' callback")))?;
    let key = v8::String::new(scope, name)
        .ok_or_else(|| RuntimeError::engine(format!("failed to allocate key '{name}'")))?;
    object
        .set(scope, key.into(), function.into())
        .ok_or_else(|| RuntimeError::engine(format!("failed to set callback '{name}'")))?;
    Ok(())
}

fn registry_from_scope(scope: &mut v8::HandleScope) -> Option<CallRegistry> {
    scope.get_slot::<CallRegistry>().cloned()
}

fn bindings_for_callback(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
) -> Option<(CallRegistry, Rc<CallBindings>)> {
    let call_id = args.data().number_value(scope)? as u64;
    let registry = registry_from_scope(scope)?;
    let bindings = registry.get(call_id)?;
    Some((registry, bindings))
}

fn stringify(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    value
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_else(|| "unknown error".to_string())
}

fn throw(scope: &mut v8::HandleScope, message: &str) {
    if let Some(message) = v8::String::new(scope, message) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
}

fn exception_details(try_catch: &mut v8::TryCatch<v8::HandleScope>) -> JsExceptionDetails {
    match try_catch.exception() {
        Some(exception) => {
            JsExceptionDetails::from_js_error(JsError::from_v8_exception(try_catch, exception))
        }
        None => JsExceptionDetails {
            exception_message: "function call failed with no exception".to_string(),
            ..Default::default()
        },
    }
}

/// `Resolve(value)` / shield `resolve(value)`: store the value and run the
/// final terminator. Terminal contexts ignore the call.
pub(crate) fn resolve_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    if bindings.context.is_terminal() {
        return;
    }

    let value = if args.length() > 0 {
        engine_value_to_host(scope, args.get(0), registry.limits())
    } else {
        Ok(JSValue::Undefined)
    };

    match value {
        Ok(value) => {
            bindings.context.store_resolve_value(value);
            bindings.context.function_call_final();
        }
        Err(err) => {
            tracing::error!(
                call_id = bindings.call_id,
                error = %err,
                "failed to lift resolve value out of the engine"
            );
            bindings
                .context
                .write_request_return_response(FunctionCallState::aborted(ABORT_ENGINE_ERROR));
        }
    }
}

/// `Reject(error)` / shield `reject(error)`.
pub(crate) fn reject_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    if bindings.context.is_terminal() {
        return;
    }
    let error = if args.length() > 0 {
        let value = args.get(0);
        stringify(scope, value)
    } else {
        "undefined".to_string()
    };
    bindings.context.function_call_exception(error);
}

/// Fulfillment handler attached in the Attach turn.
pub(crate) fn promise_fulfilled_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    bindings.context.function_call_final();
}

/// Rejection handler attached in the Attach turn.
pub(crate) fn promise_rejected_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    if bindings.context.is_terminal() {
        return;
    }
    let error = if args.length() > 0 {
        let value = args.get(0);
        stringify(scope, value)
    } else {
        "undefined".to_string()
    };
    bindings.context.function_call_exception(error);
}

/// `http.IsConnected()`: reads the transport's liveness probe.
pub(crate) fn is_connected_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    match bindings.request.http.as_ref() {
        Some(meta) => rv.set_bool(meta.is_connected.is_connected()),
        None => {
            bindings
                .context
                .write_request_return_response(FunctionCallState::aborted(
                    "javascript engine error",
                ));
            throw(scope, "internal engine error");
        }
    }
}

pub(crate) fn console_log_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    let line = format_log_line(scope, &args);
    tracing::info!(target: "jsrpc::proxy_shield", call_id = bindings.call_id, "{line}");
    bindings.context.push_console_line(line);
}

pub(crate) fn error_log_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    let line = format_log_line(scope, &args);
    tracing::error!(target: "jsrpc::proxy_shield", call_id = bindings.call_id, "{line}");
    bindings.context.push_console_line(line);
}

fn format_log_line(scope: &mut v8::HandleScope, args: &v8::FunctionCallbackArguments) -> String {
    let mut parts = Vec::with_capacity(args.length() as usize);
    for index in 0..args.length() {
        let value = args.get(index);
        parts.push(stringify(scope, value));
    }
    parts.join(" ")
}

pub(crate) fn set_timeout_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    schedule_timer(scope, args, rv, false);
}

pub(crate) fn set_interval_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    schedule_timer(scope, args, rv, true);
}

fn schedule_timer(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
    repeating: bool,
) {
    let Some((registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    if bindings.context.is_terminal() {
        return;
    }

    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw(scope, "timer callback must be a function");
        return;
    };
    let millis = {
        let value = args.get(1);
        value.number_value(scope).unwrap_or(0.0).max(0.0)
    };
    let interval = Duration::from_millis(millis as u64);

    let timer_id = bindings.next_timer_id.get();
    bindings.next_timer_id.set(timer_id.wrapping_add(1));
    bindings.timers.borrow_mut().insert(
        timer_id,
        TimerEntry {
            callback: v8::Global::new(scope, callback),
            repeating,
            interval,
        },
    );
    bindings.context.timer_started();

    if !registry.submit(RuntimeCommand::ArmTimer {
        call_id: bindings.call_id,
        timer_id,
        delay: interval,
    }) {
        bindings.timers.borrow_mut().remove(&timer_id);
        bindings.context.timer_finished();
        return;
    }

    rv.set_uint32(timer_id);
}

pub(crate) fn clear_timeout_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    cancel_timer(scope, args);
}

pub(crate) fn clear_interval_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    cancel_timer(scope, args);
}

fn cancel_timer(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    let timer_id = {
        let value = args.get(0);
        match value.number_value(scope) {
            Some(id) => id as u32,
            None => return,
        }
    };
    if bindings.timers.borrow_mut().remove(&timer_id).is_some() {
        bindings.context.timer_finished();
    }
}

/// Shield `newPromise()`: creates an engine promise whose resolver is
/// retained with the call, so host code can settle it later.
pub(crate) fn new_promise_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some((_registry, bindings)) = bindings_for_callback(scope, &args) else {
        return;
    };
    let Some(resolver) = v8::PromiseResolver::new(scope) else {
        throw(scope, "failed to create promise");
        return;
    };
    let promise = resolver.get_promise(scope);
    bindings
        .promises
        .borrow_mut()
        .push(v8::Global::new(scope, resolver));
    rv.set(promise.into());
}

/// Shield `wait(ms)`: test-only, blocks the engine thread. Capped at one
/// second so a stray call cannot wedge a VM.
pub(crate) fn wait_callback(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let millis = {
        let value = args.get(0);
        value.number_value(scope).unwrap_or(0.0).clamp(0.0, 1_000.0)
    };
    std::thread::sleep(Duration::from_millis(millis as u64));
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::runtime::config::VmConfig;
    use crate::runtime::handle::VmHandle;
    use crate::runtime::js_value::JSValue;
    use crate::runtime::rpc::{
        ConnectionProbe, Cookie, FunctionCallState, FunctionSignature, HttpRequestMeta, Param,
        ParamTag, RpcRequest, ABORT_CLIENT_DISCONNECTED, ABORT_TYPE_ERROR,
    };

    use super::*;

    fn vm_with(code: &str) -> VmHandle {
        crate::runtime::initialize_platform_once();
        let vm = VmHandle::spawn(VmConfig::default()).expect("spawn vm");
        vm.eval_sync(code).expect("load user code");
        vm
    }

    fn number_params(values: &[i64]) -> Vec<Param> {
        values
            .iter()
            .map(|v| Param::new(ParamTag::Number, JSValue::Int(*v)))
            .collect()
    }

    #[test]
    fn test_sync_resolve() {
        let mut vm = vm_with("globalThis.add = (req, a, b) => { req.Resolve(a + b); };");
        let func = vm
            .register_shared_function("add", FunctionSignature::parse(["number", "number"]).unwrap())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(number_params(&[2, 3]))).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Int(5))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_async_resolve_via_timer() {
        let mut vm = vm_with(
            "globalThis.mul = (req, a, b) => { setTimeout(() => req.Resolve(a * b), 50); };",
        );
        let func = vm
            .register_shared_function("mul", FunctionSignature::parse(["number", "number"]).unwrap())
            .unwrap();

        let started = Instant::now();
        let ticket = func.call(RpcRequest::ipc(number_params(&[4, 6]))).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Int(24))
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        vm.close().unwrap();
    }

    #[test]
    fn test_rejected_promise() {
        let mut vm = vm_with("globalThis.deny = (req) => Promise.reject(\"nope\");");
        let func = vm
            .register_shared_function("deny", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::exception("nope")
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_promise_rejected_while_pending() {
        let mut vm = vm_with(
            "globalThis.lateReject = (req) => new Promise((resolve, reject) => {\
                setTimeout(() => reject(\"late\"), 30);\
            });",
        );
        let func = vm
            .register_shared_function("lateReject", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::websocket(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::exception("late")
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_explicit_reject() {
        let mut vm = vm_with("globalThis.refuse = (req) => { req.Reject(\"denied\"); };");
        let func = vm
            .register_shared_function("refuse", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::exception("denied")
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_sync_throw_is_an_exception() {
        let mut vm = vm_with("globalThis.boom = (req) => { throw new Error(\"boom\"); };");
        let func = vm
            .register_shared_function("boom", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        match ticket.await_result_blocking() {
            FunctionCallState::Exception { error } => assert!(error.contains("boom"), "{error}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        vm.close().unwrap();
    }

    #[test]
    fn test_type_mismatch_never_invokes_user_code() {
        let mut vm = vm_with(
            "globalThis.touch = (req, s) => { globalThis.touched = true; req.Resolve(s); };",
        );
        let func = vm
            .register_shared_function("touch", FunctionSignature::parse(["string"]).unwrap())
            .unwrap();

        let ticket = func
            .call(RpcRequest::ipc(vec![Param::new(
                ParamTag::Number,
                JSValue::Int(1),
            )]))
            .unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::aborted(ABORT_TYPE_ERROR)
        );

        // The side-effect flag proves the user function never ran.
        assert_eq!(
            vm.eval_sync("globalThis.touched === undefined").unwrap(),
            JSValue::Bool(true)
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_disconnect_while_pending() {
        // The user function never resolves; the wrapper promise fulfills
        // and the call stays pending until the transport disconnects.
        let mut vm = vm_with("globalThis.idle = (req) => {};");
        let func = vm
            .register_shared_function("idle", FunctionSignature::default())
            .unwrap();

        let probe = ConnectionProbe::new(true);
        let meta = HttpRequestMeta {
            is_connected: probe.clone(),
            ..Default::default()
        };
        let ticket = func.call(RpcRequest::http(vec![], meta)).unwrap();
        let context = ticket.context();

        std::thread::sleep(Duration::from_millis(100));
        assert!(!context.is_terminal());

        probe.set_connected(false);
        assert!(context.abort(ABORT_CLIENT_DISCONNECTED));
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::aborted(ABORT_CLIENT_DISCONNECTED)
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_resolve_after_disconnect_is_a_no_op() {
        let mut vm =
            vm_with("globalThis.slow = (req) => { setTimeout(() => req.Resolve(1), 200); };");
        let func = vm
            .register_shared_function("slow", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        let context = ticket.context();

        std::thread::sleep(Duration::from_millis(50));
        assert!(context.abort(ABORT_CLIENT_DISCONNECTED));
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::aborted(ABORT_CLIENT_DISCONNECTED)
        );

        // Let the abandoned timer run out; the VM must stay healthy and the
        // late resolve must change nothing.
        std::thread::sleep(Duration::from_millis(300));
        assert!(context.is_terminal());
        assert_eq!(vm.eval_sync("1 + 1").unwrap(), JSValue::Int(2));
        vm.close().unwrap();
    }

    #[test]
    fn test_http_metadata_surface() {
        let mut vm = vm_with(
            "globalThis.meta = (req) => {\
                req.Resolve([\
                    req.CallMethode,\
                    req.http.Host,\
                    req.http.Headers[\"X-F\"],\
                    req.http.Headers[\"Single\"],\
                    req.http.Cookies.s.Value,\
                    req.http.Cookies.s.Domain,\
                    req.http.IsConnected(),\
                    req.http.ContentLength,\
                    req.http.RequestURI,\
                ]);\
            };",
        );
        let func = vm
            .register_shared_function("meta", FunctionSignature::default())
            .unwrap();

        let meta = HttpRequestMeta {
            host: "example.test".to_string(),
            proto: "HTTP/1.1".to_string(),
            remote_addr: "127.0.0.1:9000".to_string(),
            request_uri: "/rpc/meta".to_string(),
            content_length: 12,
            headers: indexmap::IndexMap::from([
                ("X-F".to_string(), vec!["a".to_string(), "b".to_string()]),
                ("Single".to_string(), vec!["x".to_string()]),
            ]),
            cookies: vec![Cookie {
                name: "s".to_string(),
                value: "1".to_string(),
                domain: "d".to_string(),
                path: "/".to_string(),
                expires: "e".to_string(),
            }],
            is_connected: ConnectionProbe::new(true),
        };

        let ticket = func.call(RpcRequest::http(vec![], meta)).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Array(vec![
                JSValue::String("http".to_string()),
                JSValue::String("example.test".to_string()),
                JSValue::Array(vec![
                    JSValue::String("a".to_string()),
                    JSValue::String("b".to_string()),
                ]),
                JSValue::Array(vec![JSValue::String("x".to_string())]),
                JSValue::String("1".to_string()),
                JSValue::String("d".to_string()),
                JSValue::Bool(true),
                JSValue::Int(12),
                JSValue::String("/rpc/meta".to_string()),
            ]))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_call_methode_for_ws_and_ipc() {
        let mut vm = vm_with("globalThis.which = (req) => { req.Resolve(req.CallMethode); };");
        let func = vm
            .register_shared_function("which", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::websocket(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::String("ws".to_string()))
        );

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::String("ipc".to_string()))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_all_parameter_tags_round_trip() {
        let mut vm = vm_with(
            "globalThis.echo = (req, b, n, s, a, o, y) => { req.Resolve([b, n, s, a, o, y]); };",
        );
        let func = vm
            .register_shared_function(
                "echo",
                FunctionSignature::parse([
                    "boolean", "number", "string", "array", "object", "bytes",
                ])
                .unwrap(),
            )
            .unwrap();

        let params = vec![
            Param::new(ParamTag::Boolean, JSValue::Bool(true)),
            Param::new(ParamTag::Number, JSValue::Float(2.5)),
            Param::new(ParamTag::String, JSValue::String("hi".to_string())),
            Param::new(
                ParamTag::Array,
                JSValue::Array(vec![JSValue::Int(1), JSValue::Int(2)]),
            ),
            Param::new(
                ParamTag::Object,
                JSValue::Object(indexmap::IndexMap::from([(
                    "k".to_string(),
                    JSValue::String("v".to_string()),
                )])),
            ),
            Param::new(ParamTag::Bytes, JSValue::Bytes(vec![1, 2, 3])),
        ];

        let ticket = func.call(RpcRequest::ipc(params)).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Array(vec![
                JSValue::Bool(true),
                JSValue::Float(2.5),
                JSValue::String("hi".to_string()),
                JSValue::Array(vec![JSValue::Int(1), JSValue::Int(2)]),
                JSValue::Object(indexmap::IndexMap::from([(
                    "k".to_string(),
                    JSValue::String("v".to_string()),
                )])),
                JSValue::Bytes(vec![1, 2, 3]),
            ]))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_first_outcome_wins() {
        let mut vm = vm_with(
            "globalThis.noisy = (req) => { req.Resolve(1); req.Resolve(2); req.Reject(\"x\"); };",
        );
        let func = vm
            .register_shared_function("noisy", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Int(1))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_interval_fires_until_cleared() {
        let mut vm = vm_with(
            "globalThis.ticker = (req) => {\
                let n = 0;\
                const id = setInterval(() => {\
                    n += 1;\
                    if (n === 3) { clearInterval(id); req.Resolve(n); }\
                }, 10);\
            };",
        );
        let func = vm
            .register_shared_function("ticker", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        let context = ticket.context();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Int(3))
        );
        assert_eq!(context.pending_timers(), 0);
        vm.close().unwrap();
    }

    #[test]
    fn test_shield_console_is_captured() {
        let mut vm =
            vm_with("globalThis.talk = (req) => { console.log(\"hello\", 42); req.Resolve(true); };");
        let func = vm
            .register_shared_function("talk", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        let context = ticket.context();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Bool(true))
        );
        assert_eq!(context.console_lines(), vec!["hello 42".to_string()]);
        vm.close().unwrap();
    }

    #[test]
    fn test_shield_is_bound_as_this() {
        // Lowercase resolve lives on the shield; `this` only reaches it in
        // a regular function, not an arrow.
        let mut vm = vm_with("globalThis.low = function (req) { this.resolve(7); };");
        let func = vm
            .register_shared_function("low", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Int(7))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_shield_new_promise() {
        let mut vm = vm_with(
            "globalThis.promiser = function (req) {\
                const p = this.newPromise();\
                req.Resolve(typeof p.then === \"function\");\
            };",
        );
        let func = vm
            .register_shared_function("promiser", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Bool(true))
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_resolve_without_value_is_undefined() {
        let mut vm = vm_with("globalThis.empty = (req) => { req.Resolve(); };");
        let func = vm
            .register_shared_function("empty", FunctionSignature::default())
            .unwrap();

        let ticket = func.call(RpcRequest::ipc(vec![])).unwrap();
        assert_eq!(
            ticket.await_result_blocking(),
            FunctionCallState::ok(JSValue::Undefined)
        );
        vm.close().unwrap();
    }

    #[test]
    fn test_concurrent_calls_interleave() {
        let mut vm = vm_with(
            "globalThis.waitMul = (req, a) => { setTimeout(() => req.Resolve(a * 10), 30); };",
        );
        let func = vm
            .register_shared_function("waitMul", FunctionSignature::parse(["number"]).unwrap())
            .unwrap();

        let tickets: Vec<_> = (1..=4)
            .map(|i| func.call(RpcRequest::ipc(number_params(&[i]))).unwrap())
            .collect();

        let mut results: Vec<_> = tickets
            .into_iter()
            .map(|t| t.await_result_blocking())
            .collect();
        results.sort_by_key(|state| match state {
            FunctionCallState::Ok {
                result: JSValue::Int(i),
            } => *i,
            _ => i64::MAX,
        });
        assert_eq!(
            results,
            vec![
                FunctionCallState::ok(JSValue::Int(10)),
                FunctionCallState::ok(JSValue::Int(20)),
                FunctionCallState::ok(JSValue::Int(30)),
                FunctionCallState::ok(JSValue::Int(40)),
            ]
        );
        vm.close().unwrap();
    }
}
