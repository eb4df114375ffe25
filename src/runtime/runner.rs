//! Engine thread backed by `deno_core::JsRuntime`.
//!
//! This module hosts the JavaScript engine on a dedicated OS thread with a
//! single-threaded Tokio runtime. Work from the host is forwarded through
//! [`RuntimeCommand`] and executed sequentially on that thread; pipeline
//! turns re-enter through the same FIFO channel, and a shared monotonic
//! timer wheel drives promise polls and user timers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender as StdSender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::runtime::call_context::SharedFunctionRequestContext;
use crate::runtime::config::VmConfig;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::js_value::{JSValue, LimitTracker, SerializationLimits};
use crate::runtime::pipeline::{self, CallBindings, CallRegistry, CallStage, PROMISE_POLL_INTERVAL};
use crate::runtime::rpc::{FunctionCallState, FunctionSignature, RpcRequest, ABORT_ENGINE_ERROR};
use crate::runtime::shield;

static ACTIVE_ENGINE_THREADS: AtomicUsize = AtomicUsize::new(0);

struct EngineThreadGuard;

impl EngineThreadGuard {
    fn new() -> Self {
        ACTIVE_ENGINE_THREADS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for EngineThreadGuard {
    fn drop(&mut self) {
        ACTIVE_ENGINE_THREADS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn active_engine_threads() -> usize {
    ACTIVE_ENGINE_THREADS.load(Ordering::SeqCst)
}

/// Registered shared function: the engine-side callable plus its signature.
struct SharedFunctionSlot {
    name: String,
    signature: FunctionSignature,
    function: v8::Global<v8::Function>,
}

/// Commands sent to the engine thread.
///
/// Appended to a FIFO queue; per-sender program order is preserved, which
/// carries the per-call turn ordering guarantee.
pub(crate) enum RuntimeCommand {
    Eval {
        code: String,
        responder: StdSender<RuntimeResult<JSValue>>,
    },
    RegisterSharedFunction {
        name: String,
        signature: FunctionSignature,
        responder: StdSender<RuntimeResult<u32>>,
    },
    CallSharedFunction {
        fn_id: u32,
        request: RpcRequest,
        context: Arc<SharedFunctionRequestContext>,
    },
    AdvanceCall {
        call_id: u64,
        stage: CallStage,
    },
    ArmTimer {
        call_id: u64,
        timer_id: u32,
        delay: Duration,
    },
    TeardownCall {
        call_id: u64,
    },
    Shutdown {
        responder: StdSender<()>,
    },
}

enum WheelEntryKind {
    PollPromise { call_id: u64 },
    UserTimer { call_id: u64, timer_id: u32 },
}

struct WheelEntry {
    deadline: Instant,
    seq: u64,
    kind: WheelEntryKind,
}

impl PartialEq for WheelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for WheelEntry {}

impl PartialOrd for WheelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WheelEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Core state that holds the V8 isolate and all engine-side data. Owned by
/// the dispatcher; pipeline stage handlers borrow it per turn.
pub(crate) struct RuntimeCoreState {
    pub(crate) js_runtime: JsRuntime,
    pub(crate) calls: CallRegistry,
    shared_fns: HashMap<u32, SharedFunctionSlot>,
    next_fn_id: u32,
    next_call_id: u64,
    limits: SerializationLimits,
    tx: mpsc::WeakUnboundedSender<RuntimeCommand>,
    wheel: BinaryHeap<Reverse<WheelEntry>>,
    wheel_seq: u64,
    terminated: bool,
}

impl RuntimeCoreState {
    fn new(config: VmConfig, tx: mpsc::WeakUnboundedSender<RuntimeCommand>) -> RuntimeResult<Self> {
        config.validate()?;

        let create_params = match (config.max_heap_size, config.initial_heap_size) {
            (Some(max), initial) => {
                Some(v8::CreateParams::default().heap_limits(initial.unwrap_or(0), max))
            }
            (None, _) => None,
        };

        let mut js_runtime = JsRuntime::new(RuntimeOptions {
            create_params,
            is_main: true,
            ..Default::default()
        });

        if !config.enable_console {
            js_runtime
                .execute_script(
                    "<disable_console>",
                    r#"
                    (() => {
                        const noop = () => {};
                        const stub = new Proxy(Object.create(null), { get: () => noop });
                        globalThis.console = stub;
                    })();
                    "#,
                )
                .map_err(|err| RuntimeError::engine(format!("console stub failed: {err}")))?;
        }

        if let Some(script) = config.bootstrap_script.clone() {
            js_runtime
                .execute_script("<bootstrap>", script)
                .map_err(|err| RuntimeError::engine(format!("bootstrap script failed: {err}")))?;
        }

        // Verify the embedded wrapper before the VM accepts any call.
        shield::evaluate_wrapper(&mut js_runtime)?;

        let limits = config.serialization_limits();
        let calls = CallRegistry::new(tx.clone(), limits);
        js_runtime.v8_isolate().set_slot(calls.clone());

        Ok(Self {
            js_runtime,
            calls,
            shared_fns: HashMap::new(),
            next_fn_id: 0,
            next_call_id: 0,
            limits,
            tx,
            wheel: BinaryHeap::new(),
            wheel_seq: 0,
            terminated: false,
        })
    }

    /// Enqueue the next turn of a call onto the engine loop.
    pub(crate) fn submit_stage(&self, call_id: u64, stage: CallStage) -> RuntimeResult<()> {
        match self.tx.upgrade() {
            Some(tx) => tx
                .send(RuntimeCommand::AdvanceCall { call_id, stage })
                .map_err(|_| RuntimeError::ShuttingDown),
            None => Err(RuntimeError::ShuttingDown),
        }
    }

    pub(crate) fn arm_poll(&mut self, call_id: u64) {
        self.push_wheel(PROMISE_POLL_INTERVAL, WheelEntryKind::PollPromise { call_id });
    }

    pub(crate) fn arm_timer(&mut self, call_id: u64, timer_id: u32, delay: Duration) {
        self.push_wheel(delay, WheelEntryKind::UserTimer { call_id, timer_id });
    }

    fn push_wheel(&mut self, delay: Duration, kind: WheelEntryKind) {
        self.wheel_seq = self.wheel_seq.wrapping_add(1);
        self.wheel.push(Reverse(WheelEntry {
            deadline: Instant::now() + delay,
            seq: self.wheel_seq,
            kind,
        }));
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.wheel.peek().map(|Reverse(entry)| entry.deadline)
    }

    fn eval_sync(&mut self, code: &str) -> RuntimeResult<JSValue> {
        let global_value = self
            .js_runtime
            .execute_script("<eval>", code.to_string())
            .map_err(|err| RuntimeError::engine(format!("eval failed: {err}")))?;

        let limits = self.limits;
        let scope = &mut self.js_runtime.handle_scope();
        let local = v8::Local::new(scope, global_value);
        engine_value_to_host(scope, local, limits)
    }

    /// Look up a global function by name and register it as a shared
    /// function. The callable must declare the request object plus one
    /// parameter per signature tag.
    fn register_shared_function(
        &mut self,
        name: &str,
        signature: FunctionSignature,
    ) -> RuntimeResult<u32> {
        let function = {
            let scope = &mut self.js_runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);
            let key = v8::String::new(scope, name)
                .ok_or_else(|| RuntimeError::engine("failed to allocate function name"))?;
            let value = global
                .get(scope, key.into())
                .ok_or_else(|| RuntimeError::engine(format!("shared function `{name}` not found")))?;
            if value.is_undefined() {
                return Err(RuntimeError::engine(format!(
                    "shared function `{name}` not found"
                )));
            }
            let function = v8::Local::<v8::Function>::try_from(value)
                .map_err(|_| RuntimeError::engine(format!("`{name}` is not a function")))?;

            let length_key = v8::String::new(scope, "length")
                .ok_or_else(|| RuntimeError::engine("failed to allocate length key"))?;
            let declared = function
                .get(scope, length_key.into())
                .and_then(|value| value.number_value(scope))
                .unwrap_or(0.0) as usize;
            let expected = signature.len() + 1;
            if declared != expected {
                return Err(RuntimeError::engine(format!(
                    "shared function `{name}` declares {declared} parameters, expected {expected} \
                     (request object plus {} signature parameters)",
                    signature.len()
                )));
            }

            v8::Global::new(scope, function)
        };

        let fn_id = self.next_fn_id;
        self.next_fn_id += 1;
        self.shared_fns.insert(
            fn_id,
            SharedFunctionSlot {
                name: name.to_string(),
                signature,
                function,
            },
        );
        tracing::debug!(name, fn_id, "shared function registered");
        Ok(fn_id)
    }

    /// Accept a call: create its engine-side bindings and submit the first
    /// pipeline turn.
    fn begin_call(
        &mut self,
        fn_id: u32,
        request: RpcRequest,
        context: Arc<SharedFunctionRequestContext>,
    ) {
        if context.is_terminal() {
            return;
        }

        let (function, signature, name) = match self.shared_fns.get(&fn_id) {
            Some(slot) => (
                slot.function.clone(),
                slot.signature.clone(),
                slot.name.clone(),
            ),
            None => {
                log::debug!("call for unknown shared function id {}", fn_id);
                context.write_request_return_response(FunctionCallState::aborted(
                    ABORT_ENGINE_ERROR,
                ));
                return;
            }
        };

        let call_id = self.next_call_id;
        self.next_call_id += 1;
        context.install_teardown(call_id, self.tx.clone());
        tracing::debug!(call_id, function = %name, "shared function call accepted");

        let bindings = Rc::new(CallBindings::new(
            call_id,
            function,
            signature,
            request,
            context,
        ));
        self.calls.insert(bindings.clone());

        if let Err(err) = self.submit_stage(call_id, CallStage::Prepare) {
            bindings
                .context
                .write_request_return_response(err.terminal_state());
            self.calls.remove(call_id);
        }
    }
}

/// Dispatcher that multiplexes host commands, pipeline turns and timer
/// wakeups on the engine thread.
struct RuntimeDispatcher {
    core: RuntimeCoreState,
    cmd_rx: mpsc::UnboundedReceiver<RuntimeCommand>,
}

impl RuntimeDispatcher {
    fn new(core: RuntimeCoreState, cmd_rx: mpsc::UnboundedReceiver<RuntimeCommand>) -> Self {
        Self { core, cmd_rx }
    }

    async fn run(&mut self) {
        loop {
            // Advance microtasks and promise reactions one tick, without
            // blocking.
            self.pump_event_loop();
            self.fire_due_timers();

            let next_deadline = self.core.next_deadline();
            let should_exit = tokio::select! {
                biased; // Prefer commands over timer wakeups

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.handle_channel_closed();
                            true
                        }
                    }
                }

                _ = sleep_until_deadline(next_deadline) => false,
            };

            if should_exit {
                break;
            }
        }
    }

    fn pump_event_loop(&mut self) {
        let noop_waker = futures::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&noop_waker);
        let poll_opts = PollEventLoopOptions {
            wait_for_inspector: false,
            pump_v8_message_loop: true,
        };

        // A promise rejected before its Attach turn installed handlers can
        // surface here as an unhandled rejection; the settlement callbacks
        // still observe the state, so this is log-only.
        if let std::task::Poll::Ready(Err(err)) =
            self.core.js_runtime.poll_event_loop(&mut cx, poll_opts)
        {
            tracing::debug!(error = %err, "engine event loop reported an error");
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        loop {
            let due = matches!(self.core.wheel.peek(), Some(Reverse(entry)) if entry.deadline <= now);
            if !due {
                break;
            }
            let Reverse(entry) = self.core.wheel.pop().expect("peeked entry");
            match entry.kind {
                WheelEntryKind::PollPromise { call_id } => {
                    pipeline::run_call_stage(&mut self.core, call_id, CallStage::Poll);
                }
                WheelEntryKind::UserTimer { call_id, timer_id } => {
                    pipeline::run_user_timer(&mut self.core, call_id, timer_id);
                }
            }
        }
    }

    /// Handle a command - returns true if the dispatcher should exit.
    fn handle_command(&mut self, cmd: RuntimeCommand) -> bool {
        match cmd {
            RuntimeCommand::Eval { code, responder } => {
                let result = if self.core.terminated {
                    Err(RuntimeError::ShuttingDown)
                } else {
                    self.core.eval_sync(&code)
                };
                let _ = responder.send(result);
                false
            }
            RuntimeCommand::RegisterSharedFunction {
                name,
                signature,
                responder,
            } => {
                let result = if self.core.terminated {
                    Err(RuntimeError::ShuttingDown)
                } else {
                    self.core.register_shared_function(&name, signature)
                };
                let _ = responder.send(result);
                false
            }
            RuntimeCommand::CallSharedFunction {
                fn_id,
                request,
                context,
            } => {
                if self.core.terminated {
                    context.write_request_return_response(FunctionCallState::aborted(
                        ABORT_ENGINE_ERROR,
                    ));
                } else {
                    self.core.begin_call(fn_id, request, context);
                }
                false
            }
            RuntimeCommand::AdvanceCall { call_id, stage } => {
                pipeline::run_call_stage(&mut self.core, call_id, stage);
                false
            }
            RuntimeCommand::ArmTimer {
                call_id,
                timer_id,
                delay,
            } => {
                self.core.arm_timer(call_id, timer_id, delay);
                false
            }
            RuntimeCommand::TeardownCall { call_id } => {
                pipeline::teardown_call(&mut self.core, call_id);
                false
            }
            RuntimeCommand::Shutdown { responder } => {
                self.abort_in_flight();
                self.core.terminated = true;
                let _ = responder.send(());
                self.cmd_rx.close();
                true // Exit the loop
            }
        }
    }

    /// Handle the command channel closing without an explicit shutdown
    /// request.
    fn handle_channel_closed(&mut self) {
        tracing::warn!("command channel closed without explicit shutdown - cleaning up");
        self.abort_in_flight();
        self.core.terminated = true;
    }

    fn abort_in_flight(&mut self) {
        let in_flight = self.core.calls.drain();
        if !in_flight.is_empty() {
            tracing::debug!(count = in_flight.len(), "aborting in-flight calls");
        }
        for bindings in in_flight {
            bindings
                .context
                .write_request_return_response(FunctionCallState::aborted(ABORT_ENGINE_ERROR));
            bindings.cancel_timers();
        }
        self.core.wheel.clear();
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending::<()>().await,
    }
}

/// Spawn the engine thread for one VM and return the command sender.
///
/// The dispatcher itself only holds a weak sender, so the thread exits once
/// every host handle is gone.
pub(crate) fn spawn_runtime_thread(
    config: VmConfig,
) -> RuntimeResult<mpsc::UnboundedSender<RuntimeCommand>> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
    let weak_tx = cmd_tx.downgrade();
    let (init_tx, init_rx) = std::sync::mpsc::channel::<RuntimeResult<()>>();

    std::thread::Builder::new()
        .name("jsrpc-engine".to_string())
        .spawn(move || {
            let _thread_guard = EngineThreadGuard::new();
            crate::runtime::initialize_platform_once();

            let tokio_rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build tokio runtime");

            let core = match RuntimeCoreState::new(config, weak_tx) {
                Ok(core) => {
                    let _ = init_tx.send(Ok(()));
                    core
                }
                Err(err) => {
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tokio_rt.block_on(async move {
                let mut dispatcher = RuntimeDispatcher::new(core, cmd_rx);
                dispatcher.run().await;
            });
        })
        .map_err(|e| RuntimeError::internal(format!("Failed to spawn engine thread: {}", e)))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(cmd_tx),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(RuntimeError::internal(
            "Engine thread initialization failed",
        )),
    }
}

/// Convert an engine value to a host value with circular reference
/// detection and depth/byte limits enforced.
pub(crate) fn engine_value_to_host<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'_, v8::Value>,
    limits: SerializationLimits,
) -> RuntimeResult<JSValue> {
    let value = v8::Local::new(scope, value);
    let mut seen = HashSet::new();
    let mut tracker = LimitTracker::new(limits.max_depth, limits.max_bytes);
    convert_engine_value(scope, value, &mut seen, &mut tracker)
}

fn convert_engine_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    seen: &mut HashSet<i32>,
    tracker: &mut LimitTracker,
) -> RuntimeResult<JSValue> {
    tracker.enter().map_err(RuntimeError::engine)?;

    let result = if value.is_undefined() {
        tracker.add_bytes(0).map_err(RuntimeError::engine)?;
        Ok(JSValue::Undefined)
    } else if value.is_null() {
        tracker.add_bytes(4).map_err(RuntimeError::engine)?;
        Ok(JSValue::Null)
    } else if value.is_boolean() {
        tracker.add_bytes(5).map_err(RuntimeError::engine)?; // "false" (worst case)
        Ok(JSValue::Bool(value.boolean_value(scope)))
    } else if value.is_number() {
        // Preserve special numeric values (NaN, ±Infinity) as floats.
        let num_val = value
            .to_number(scope)
            .ok_or_else(|| RuntimeError::engine("failed to convert value to number"))?
            .value();
        tracker.add_bytes(24).map_err(RuntimeError::engine)?;
        if num_val.is_finite() && num_val.fract() == 0.0 {
            let as_int = num_val as i64;
            if as_int as f64 == num_val {
                Ok(JSValue::Int(as_int))
            } else {
                Ok(JSValue::Float(num_val))
            }
        } else {
            Ok(JSValue::Float(num_val))
        }
    } else if value.is_string() {
        let string = value
            .to_string(scope)
            .ok_or_else(|| RuntimeError::engine("failed to convert string"))?;
        let rust_str = string.to_rust_string_lossy(scope);
        tracker
            .add_bytes(rust_str.len())
            .map_err(RuntimeError::engine)?;
        Ok(JSValue::String(rust_str))
    } else if value.is_uint8_array() {
        let typed_array = v8::Local::<v8::Uint8Array>::try_from(value)
            .map_err(|_| RuntimeError::engine("failed to cast to Uint8Array"))?;
        let length = typed_array.byte_length();
        tracker.add_bytes(length).map_err(RuntimeError::engine)?;
        let mut buffer = vec![0u8; length];
        let view: v8::Local<v8::ArrayBufferView> = typed_array.into();
        view.copy_contents(&mut buffer);
        Ok(JSValue::Bytes(buffer))
    } else if value.is_array_buffer() {
        let array_buffer = v8::Local::<v8::ArrayBuffer>::try_from(value)
            .map_err(|_| RuntimeError::engine("failed to cast to ArrayBuffer"))?;
        let length = array_buffer.byte_length();
        tracker.add_bytes(length).map_err(RuntimeError::engine)?;
        let mut buffer = vec![0u8; length];
        let typed = v8::Uint8Array::new(scope, array_buffer, 0, length)
            .ok_or_else(|| RuntimeError::engine("failed to view ArrayBuffer"))?;
        let view: v8::Local<v8::ArrayBufferView> = typed.into();
        view.copy_contents(&mut buffer);
        Ok(JSValue::Bytes(buffer))
    } else if value.is_function() {
        Err(RuntimeError::engine(
            "cannot lift a function out of the engine",
        ))
    } else if value.is_array() {
        // Circular references are detected by identity hash.
        let obj = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| RuntimeError::engine("failed to cast array to object"))?;
        let hash = obj.get_identity_hash().get();
        if !seen.insert(hash) {
            return Err(RuntimeError::engine("cannot serialize circular reference"));
        }

        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| RuntimeError::engine("failed to cast to array"))?;
        let len = array.length() as usize;

        let mut items = Vec::with_capacity(len);
        for i in 0..len {
            let item = array
                .get_index(scope, i as u32)
                .ok_or_else(|| RuntimeError::engine(format!("failed to get array index {i}")))?;
            items.push(convert_engine_value(scope, item, seen, tracker)?);
        }

        seen.remove(&hash);
        Ok(JSValue::Array(items))
    } else if value.is_object() {
        let obj = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| RuntimeError::engine("failed to cast to object"))?;
        let hash = obj.get_identity_hash().get();
        if !seen.insert(hash) {
            return Err(RuntimeError::engine("cannot serialize circular reference"));
        }

        let prop_names = obj
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| RuntimeError::engine("failed to get property names"))?;

        let mut map = IndexMap::new();
        for i in 0..prop_names.length() {
            let key = prop_names
                .get_index(scope, i)
                .ok_or_else(|| RuntimeError::engine("failed to get property name"))?;
            let key_str = key
                .to_string(scope)
                .ok_or_else(|| RuntimeError::engine("failed to convert key to string"))?
                .to_rust_string_lossy(scope);

            let val = obj.get(scope, key).ok_or_else(|| {
                RuntimeError::engine(format!("failed to get property '{key_str}'"))
            })?;

            tracker
                .add_bytes(key_str.len())
                .map_err(RuntimeError::engine)?;
            map.insert(key_str, convert_engine_value(scope, val, seen, tracker)?);
        }

        seen.remove(&hash);
        Ok(JSValue::Object(map))
    } else {
        // Fallback: convert to string
        let string = value
            .to_string(scope)
            .ok_or_else(|| RuntimeError::engine("failed to convert value to string"))?;
        let rust_str = string.to_rust_string_lossy(scope);
        tracker
            .add_bytes(rust_str.len())
            .map_err(RuntimeError::engine)?;
        Ok(JSValue::String(rust_str))
    };

    tracker.exit();
    result
}
