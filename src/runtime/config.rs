//! Per-VM configuration.
//!
//! This module defines the configuration structure for JavaScript virtual
//! machines, including heap limits, bootstrap options and the limits applied
//! when call results are lifted out of the engine.

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::js_value::{SerializationLimits, MAX_JS_BYTES, MAX_JS_DEPTH};

/// Configuration for a single JavaScript VM (one isolate, one engine thread).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Bootstrap script to run on startup, before any shared function is
    /// registered.
    pub bootstrap_script: Option<String>,

    /// Enable console output (default: true)
    pub enable_console: bool,

    /// Maximum depth when converting engine values to host values.
    pub max_serialization_depth: usize,

    /// Maximum byte count when converting engine values to host values.
    pub max_serialization_bytes: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            enable_console: true,
            max_serialization_depth: MAX_JS_DEPTH,
            max_serialization_bytes: MAX_JS_BYTES,
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: String) -> Self {
        self.bootstrap_script = Some(source);
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_serialization_limits(mut self, max_depth: usize, max_bytes: usize) -> Self {
        self.max_serialization_depth = max_depth;
        self.max_serialization_bytes = max_bytes;
        self
    }

    pub(crate) fn serialization_limits(&self) -> SerializationLimits {
        SerializationLimits::new(self.max_serialization_depth, self.max_serialization_bytes)
    }

    pub(crate) fn validate(&self) -> RuntimeResult<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(RuntimeError::internal(
                "initial_heap_size requires max_heap_size to be set as well",
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(RuntimeError::internal(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.bootstrap_script.is_none());
        assert!(config.enable_console);
        assert_eq!(config.max_serialization_depth, MAX_JS_DEPTH);
        assert_eq!(config.max_serialization_bytes, MAX_JS_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = VmConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024)
            .with_bootstrap("globalThis.VERSION = '1.0.0';".to_string());

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.initial_heap_size, Some(1024 * 1024));
        assert!(config.bootstrap_script.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_heap_requires_max_heap() {
        let config = VmConfig::new().with_initial_heap_size(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_initial_heap_cannot_exceed_max_heap() {
        let config = VmConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(4096);
        assert!(config.validate().is_err());
    }
}
