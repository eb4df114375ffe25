//! Per-call bookkeeping: response sink, terminal-state guard, log capture.
//!
//! A [`SharedFunctionRequestContext`] is shared between the transport and the
//! engine side of one call. All three terminators funnel through a single
//! mutex-guarded slot so that exactly one [`FunctionCallState`] ever crosses
//! the response sink; late resolve/reject/exception signals are silent
//! no-ops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::oneshot;

use crate::runtime::js_value::JSValue;
use crate::runtime::rpc::{FunctionCallState, RequestType, ABORT_ENGINE_ERROR};
use crate::runtime::runner::RuntimeCommand;

#[derive(Debug)]
struct TerminalSlot {
    terminal: bool,
    sink: Option<oneshot::Sender<FunctionCallState>>,
}

#[derive(Debug)]
struct TeardownHook {
    call_id: u64,
    tx: WeakUnboundedSender<RuntimeCommand>,
}

/// Shared per-call state (C6).
///
/// Lifetime: created when the transport accepts the RPC, dropped once both
/// the transport and the engine release it; the engine side releases at
/// teardown, after all timers were cancelled or fired.
#[derive(Debug)]
pub struct SharedFunctionRequestContext {
    request_type: RequestType,
    terminal: Mutex<TerminalSlot>,
    resolved: Mutex<Option<JSValue>>,
    console: Mutex<Vec<String>>,
    pending_timers: AtomicUsize,
    teardown: Mutex<Option<TeardownHook>>,
}

impl SharedFunctionRequestContext {
    pub(crate) fn new(
        request_type: RequestType,
    ) -> (Arc<Self>, oneshot::Receiver<FunctionCallState>) {
        let (sink, receiver) = oneshot::channel();
        let context = Arc::new(Self {
            request_type,
            terminal: Mutex::new(TerminalSlot {
                terminal: false,
                sink: Some(sink),
            }),
            resolved: Mutex::new(None),
            console: Mutex::new(Vec::new()),
            pending_timers: AtomicUsize::new(0),
            teardown: Mutex::new(None),
        });
        (context, receiver)
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    /// True once a terminal outcome has been delivered.
    pub fn is_terminal(&self) -> bool {
        self.terminal.lock().unwrap().terminal
    }

    /// Console lines captured from the proxy shield, in emission order.
    pub fn console_lines(&self) -> Vec<String> {
        self.console.lock().unwrap().clone()
    }

    /// Timers and intervals registered by user code that have not yet fired
    /// their last time or been cancelled.
    pub fn pending_timers(&self) -> usize {
        self.pending_timers.load(Ordering::SeqCst)
    }

    /// Transport-facing abort, used by disconnect watchers.
    ///
    /// Returns `true` if this call delivered the outcome; `false` if another
    /// terminator won.
    pub fn abort(&self, reason: &str) -> bool {
        self.write_request_return_response(FunctionCallState::aborted(reason))
    }

    pub(crate) fn push_console_line(&self, line: String) {
        self.console.lock().unwrap().push(line);
    }

    pub(crate) fn timer_started(&self) {
        self.pending_timers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn timer_finished(&self) {
        self.pending_timers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wire the engine-side teardown trigger once the call is dispatched.
    pub(crate) fn install_teardown(&self, call_id: u64, tx: WeakUnboundedSender<RuntimeCommand>) {
        *self.teardown.lock().unwrap() = Some(TeardownHook { call_id, tx });
    }

    /// Ask the engine to drop this call's bindings and cancel its timers.
    /// Safe to call from any thread; a no-op while the engine is gone.
    fn request_teardown(&self) {
        let hook = self.teardown.lock().unwrap();
        if let Some(hook) = hook.as_ref() {
            if let Some(tx) = hook.tx.upgrade() {
                let _ = tx.send(RuntimeCommand::TeardownCall {
                    call_id: hook.call_id,
                });
            }
        }
    }

    /// Deliver a terminal outcome. The first caller wins; every later call
    /// is a no-op.
    pub(crate) fn write_request_return_response(&self, state: FunctionCallState) -> bool {
        {
            let mut slot = self.terminal.lock().unwrap();
            if slot.terminal {
                return false;
            }
            slot.terminal = true;
            if let Some(sink) = slot.sink.take() {
                let _ = sink.send(state);
            }
        }
        self.request_teardown();
        true
    }

    /// Record the value passed to `Resolve`. The first value wins.
    pub(crate) fn store_resolve_value(&self, value: JSValue) {
        let mut resolved = self.resolved.lock().unwrap();
        if resolved.is_none() {
            *resolved = Some(value);
        }
    }

    /// Terminator for the fulfilled path. Delivers `ok` only when user code
    /// has resolved; a fulfilled wrapper promise without a resolve value
    /// leaves the call pending until the transport disconnects.
    pub(crate) fn function_call_final(&self) -> bool {
        {
            let mut slot = self.terminal.lock().unwrap();
            if slot.terminal {
                return false;
            }
            let value = match self.resolved.lock().unwrap().take() {
                Some(value) => value,
                None => return false,
            };
            slot.terminal = true;
            if let Some(sink) = slot.sink.take() {
                let _ = sink.send(FunctionCallState::ok(value));
            }
        }
        self.request_teardown();
        true
    }

    /// Terminator for the rejected/thrown path.
    pub(crate) fn function_call_exception(&self, error: String) -> bool {
        self.write_request_return_response(FunctionCallState::exception(error))
    }
}

/// Transport-side handle on one in-flight call.
///
/// Receives the single terminal outcome; `context()` exposes the shared
/// state for disconnect watchers and log retrieval.
#[derive(Debug)]
pub struct CallTicket {
    context: Arc<SharedFunctionRequestContext>,
    receiver: oneshot::Receiver<FunctionCallState>,
}

impl CallTicket {
    pub(crate) fn new(
        context: Arc<SharedFunctionRequestContext>,
        receiver: oneshot::Receiver<FunctionCallState>,
    ) -> Self {
        Self { context, receiver }
    }

    pub fn context(&self) -> Arc<SharedFunctionRequestContext> {
        self.context.clone()
    }

    /// Wait for the terminal outcome. The single true suspension point of a
    /// call; everything else is event-driven.
    pub async fn await_result(self) -> FunctionCallState {
        self.receiver
            .await
            .unwrap_or_else(|_| FunctionCallState::aborted(ABORT_ENGINE_ERROR))
    }

    /// Blocking variant for transports that are not async.
    pub fn await_result_blocking(self) -> FunctionCallState {
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| FunctionCallState::aborted(ABORT_ENGINE_ERROR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_terminator_wins() {
        let (context, receiver) = SharedFunctionRequestContext::new(RequestType::Ipc);
        assert!(!context.is_terminal());

        assert!(context.function_call_exception("first".to_string()));
        assert!(!context.function_call_exception("second".to_string()));
        assert!(!context.abort("late"));
        assert!(context.is_terminal());

        let state = receiver.blocking_recv().unwrap();
        assert_eq!(state, FunctionCallState::exception("first"));
    }

    #[test]
    fn test_final_without_resolve_value_stays_pending() {
        let (context, mut receiver) = SharedFunctionRequestContext::new(RequestType::Http);

        assert!(!context.function_call_final());
        assert!(!context.is_terminal());
        assert!(receiver.try_recv().is_err());

        context.store_resolve_value(JSValue::Int(7));
        assert!(context.function_call_final());
        assert_eq!(
            receiver.blocking_recv().unwrap(),
            FunctionCallState::ok(JSValue::Int(7))
        );
    }

    #[test]
    fn test_first_resolve_value_wins() {
        let (context, receiver) = SharedFunctionRequestContext::new(RequestType::Ipc);
        context.store_resolve_value(JSValue::Int(1));
        context.store_resolve_value(JSValue::Int(2));
        assert!(context.function_call_final());
        assert_eq!(
            receiver.blocking_recv().unwrap(),
            FunctionCallState::ok(JSValue::Int(1))
        );
    }

    #[test]
    fn test_abort_after_dropped_receiver_is_silent() {
        let (context, receiver) = SharedFunctionRequestContext::new(RequestType::WebSocket);
        drop(receiver);
        // Delivery into a dropped sink still flips the terminal flag.
        assert!(context.abort("client disconnected"));
        assert!(context.is_terminal());
    }

    #[test]
    fn test_timer_counter() {
        let (context, _receiver) = SharedFunctionRequestContext::new(RequestType::Ipc);
        context.timer_started();
        context.timer_started();
        assert_eq!(context.pending_timers(), 2);
        context.timer_finished();
        assert_eq!(context.pending_timers(), 1);
    }
}
