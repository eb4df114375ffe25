//! Hosts long-running JavaScript virtual machines and exposes selected
//! in-VM functions ("shared functions") as RPC endpoints.
//!
//! The engineering core is the shared-function call pipeline: given an
//! external RPC request, it marshals parameters into the embedded engine,
//! invokes the user function inside a controlled proxy shield, observes the
//! possibly-asynchronous result, and delivers exactly one terminal response
//! to the caller, despite concurrency between the engine loop, the
//! transport, and timer callbacks.
//!
//! ```no_run
//! use jsrpc::{FunctionSignature, JSValue, Param, ParamTag, RpcRequest, VmConfig, VmHandle};
//!
//! let vm = VmHandle::spawn(VmConfig::default())?;
//! vm.eval_sync("globalThis.add = (req, a, b) => { req.Resolve(a + b); };")?;
//! let add = vm.register_shared_function("add", FunctionSignature::parse(["number", "number"])?)?;
//!
//! let ticket = add.call(RpcRequest::ipc(vec![
//!     Param::new(ParamTag::Number, JSValue::Int(2)),
//!     Param::new(ParamTag::Number, JSValue::Int(3)),
//! ]))?;
//! let outcome = ticket.await_result_blocking();
//! assert!(outcome.is_ok());
//! # Ok::<(), jsrpc::RuntimeError>(())
//! ```

pub mod runtime;

pub use runtime::{
    initialize_platform_once, is_platform_initialized, CallTicket, ConnectionProbe, Cookie,
    FunctionCallState, FunctionSignature, HttpRequestMeta, JSValue, JsExceptionDetails, Param,
    ParamTag, RequestType, RpcRequest, RuntimeError, RuntimeResult, SharedFunction,
    SharedFunctionRequestContext, VmConfig, VmHandle,
};
