//! Tokio-based JavaScript VM host for shared-function RPC.
//!
//! Each VM owns a single V8 isolate running on a dedicated OS thread with a
//! Tokio event loop, patterned after `deno_core` embeddings. External RPC
//! requests are marshalled into the isolate, invoked through a proxy shield
//! and answered with exactly one terminal outcome per call.

pub mod call_context;
pub mod config;
pub mod error;
pub mod handle;
pub mod js_value;
pub mod rpc;

mod marshal;
mod pipeline;
mod request_object;
mod runner;
mod shield;

use once_cell::sync::OnceCell;

/// Global V8 platform initialization marker.
///
/// V8 requires exactly one platform to be initialized before creating
/// isolates. Initialization is idempotent and performed on first access.
static V8_PLATFORM: OnceCell<()> = OnceCell::new();

/// Initialize the V8 platform exactly once.
///
/// This function is safe to call multiple times; subsequent calls are
/// no-ops. Spawning a VM performs it implicitly.
pub fn initialize_platform_once() {
    V8_PLATFORM.get_or_init(|| {
        deno_core::JsRuntime::init_platform(None, false);
    });
}

/// Check if the V8 platform has been initialized.
pub fn is_platform_initialized() -> bool {
    V8_PLATFORM.get().is_some()
}

// Re-export key types for convenience
pub use call_context::{CallTicket, SharedFunctionRequestContext};
pub use config::VmConfig;
pub use error::{JsExceptionDetails, RuntimeError, RuntimeResult};
pub use handle::{SharedFunction, VmHandle};
pub use js_value::JSValue;
pub use rpc::{
    ConnectionProbe, Cookie, FunctionCallState, FunctionSignature, HttpRequestMeta, Param,
    ParamTag, RequestType, RpcRequest, ABORT_CLIENT_DISCONNECTED, ABORT_CONTRACT_VIOLATION,
    ABORT_ENGINE_ERROR, ABORT_TYPE_ERROR,
};
pub use runner::active_engine_threads;

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_platform_initialization() {
        initialize_platform_once();
        assert!(is_platform_initialized());

        // Should be safe to call again
        initialize_platform_once();
        assert!(is_platform_initialized());
    }

    #[test]
    fn test_vm_lifecycle() {
        initialize_platform_once();

        let config = VmConfig::default();
        let mut handle = VmHandle::spawn(config).unwrap();

        assert!(!handle.is_shutdown());

        let result = handle.eval_sync("40 + 2");
        assert_eq!(result.unwrap(), JSValue::Int(42));

        handle.close().unwrap();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_multiple_vms_sequential() {
        initialize_platform_once();

        for i in 0..3 {
            let config = VmConfig::default();
            let mut handle = VmHandle::spawn(config).unwrap();

            let code = format!("{} * 2", i);
            let result = handle.eval_sync(&code);
            assert_eq!(result.unwrap(), JSValue::Int(i * 2));

            handle.close().unwrap();
        }
    }

    #[test]
    fn test_concurrent_vms() {
        initialize_platform_once();

        let mut handles = vec![];
        for _ in 0..3 {
            let config = VmConfig::default();
            let handle = VmHandle::spawn(config).unwrap();
            handles.push(handle);
        }

        let mut threads = vec![];
        for (i, handle) in handles.into_iter().enumerate() {
            let t = thread::spawn(move || {
                let code = format!("{} + 100", i);
                let result = handle.eval_sync(&code);
                assert_eq!(result.unwrap(), JSValue::Int(i as i64 + 100));
            });
            threads.push(t);
        }

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_vm_with_heap_limits() {
        initialize_platform_once();

        let config = VmConfig::new()
            .with_max_heap_size(64 * 1024 * 1024) // 64 MB
            .with_initial_heap_size(1024 * 1024); // 1 MB

        let handle = VmHandle::spawn(config).unwrap();

        let result = handle.eval_sync("'hello'");
        assert_eq!(result.unwrap(), JSValue::String("hello".to_string()));
    }

    #[test]
    fn test_vm_with_bootstrap() {
        initialize_platform_once();

        let config =
            VmConfig::new().with_bootstrap("globalThis.VERSION = '1.0.0';".to_string());

        let handle = VmHandle::spawn(config).unwrap();

        let result = handle.eval_sync("globalThis.VERSION");
        assert_eq!(result.unwrap(), JSValue::String("1.0.0".to_string()));
    }

    #[test]
    fn test_vm_state_persistence() {
        initialize_platform_once();

        let config = VmConfig::default();
        let handle = VmHandle::spawn(config).unwrap();

        let result1 = handle.eval_sync("var counter = 0; counter");
        assert_eq!(result1.unwrap(), JSValue::Int(0));

        let result2 = handle.eval_sync("++counter");
        assert_eq!(result2.unwrap(), JSValue::Int(1));

        let result3 = handle.eval_sync("counter");
        assert_eq!(result3.unwrap(), JSValue::Int(1));
    }
}
