//! Host-facing handles for interacting with the engine thread.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::runtime::call_context::{CallTicket, SharedFunctionRequestContext};
use crate::runtime::config::VmConfig;
use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::js_value::JSValue;
use crate::runtime::rpc::{FunctionCallState, FunctionSignature, RpcRequest, ABORT_TYPE_ERROR};
use crate::runtime::runner::{spawn_runtime_thread, RuntimeCommand};

/// Handle on one JavaScript VM (one isolate on its own engine thread).
///
/// Cloneable; the engine thread stays alive while any clone exists and
/// exits once the last one is dropped or [`VmHandle::close`] completes.
#[derive(Clone, Debug)]
pub struct VmHandle {
    tx: Option<mpsc::UnboundedSender<RuntimeCommand>>,
    shutdown: Arc<Mutex<bool>>,
}

impl VmHandle {
    pub fn spawn(config: VmConfig) -> RuntimeResult<Self> {
        let tx = spawn_runtime_thread(config)?;
        Ok(Self {
            tx: Some(tx),
            shutdown: Arc::new(Mutex::new(false)),
        })
    }

    fn sender(&self) -> RuntimeResult<&mpsc::UnboundedSender<RuntimeCommand>> {
        if *self.shutdown.lock().unwrap() {
            return Err(RuntimeError::ShuttingDown);
        }
        self.tx.as_ref().ok_or(RuntimeError::ShuttingDown)
    }

    /// Evaluate JavaScript source on the engine thread and lift the result
    /// out. Used to load VM code before registering shared functions.
    pub fn eval_sync(&self, code: &str) -> RuntimeResult<JSValue> {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = std::sync::mpsc::channel();

        sender
            .send(RuntimeCommand::Eval {
                code: code.to_string(),
                responder: result_tx,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;

        result_rx
            .recv()
            .map_err(|_| RuntimeError::internal("Failed to receive eval result"))?
    }

    /// Register a global function as a shared RPC endpoint.
    ///
    /// The callable must declare the request object plus one parameter per
    /// signature tag; anything else is rejected here, before any call.
    pub fn register_shared_function(
        &self,
        name: &str,
        signature: FunctionSignature,
    ) -> RuntimeResult<SharedFunction> {
        let sender = self.sender()?.clone();
        let (result_tx, result_rx) = std::sync::mpsc::channel();

        sender
            .send(RuntimeCommand::RegisterSharedFunction {
                name: name.to_string(),
                signature: signature.clone(),
                responder: result_tx,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;

        let fn_id = result_rx
            .recv()
            .map_err(|_| RuntimeError::internal("Failed to receive registration result"))??;

        Ok(SharedFunction {
            name: name.to_string(),
            signature,
            fn_id,
            vm: self.clone(),
        })
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().unwrap()
    }

    /// Shut the VM down. In-flight calls are aborted; later submissions
    /// fail with [`RuntimeError::ShuttingDown`]. Idempotent.
    pub fn close(&mut self) -> RuntimeResult<()> {
        let mut shutdown_guard = self.shutdown.lock().unwrap();
        if *shutdown_guard {
            return Ok(());
        }

        if let Some(tx) = self.tx.take() {
            let (result_tx, result_rx) = std::sync::mpsc::channel();
            if tx
                .send(RuntimeCommand::Shutdown {
                    responder: result_tx,
                })
                .is_err()
            {
                return Err(RuntimeError::internal("Failed to send shutdown command"));
            }

            match result_rx.recv() {
                Ok(_) => {
                    *shutdown_guard = true;
                }
                Err(_) => {
                    return Err(RuntimeError::internal("Failed to confirm engine shutdown"));
                }
            }
        }

        Ok(())
    }
}

/// A registered endpoint: immutable after creation, destroyed with the VM.
#[derive(Clone, Debug)]
pub struct SharedFunction {
    name: String,
    signature: FunctionSignature,
    fn_id: u32,
    vm: VmHandle,
}

impl SharedFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    /// Dispatch one call. Returns a ticket whose `await_result` delivers
    /// exactly one terminal outcome.
    ///
    /// Arity failures are recovered locally into an `aborted` outcome and
    /// never reach the engine. A closed VM fails with the typed
    /// [`RuntimeError::ShuttingDown`].
    pub fn call(&self, request: RpcRequest) -> RuntimeResult<CallTicket> {
        let (context, receiver) = SharedFunctionRequestContext::new(request.request_type);
        let ticket = CallTicket::new(context.clone(), receiver);

        if request.params.len() != self.signature.len() {
            tracing::debug!(
                function = %self.name,
                expected = self.signature.len(),
                actual = request.params.len(),
                "parameter count mismatch"
            );
            context.write_request_return_response(FunctionCallState::aborted(ABORT_TYPE_ERROR));
            return Ok(ticket);
        }

        let sender = self.vm.sender()?.clone();
        sender
            .send(RuntimeCommand::CallSharedFunction {
                fn_id: self.fn_id,
                request,
                context,
            })
            .map_err(|_| RuntimeError::ShuttingDown)?;

        Ok(ticket)
    }
}
