//! RPC request model shared between the transport layer and the call pipeline.
//!
//! Transports build an [`RpcRequest`] per inbound call and hand it to a
//! [`SharedFunction`](crate::runtime::handle::SharedFunction); the pipeline
//! treats it as read-only. The terminal outcome travels the other way as a
//! [`FunctionCallState`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::runtime::error::RuntimeError;
use crate::runtime::js_value::JSValue;

/// Abort reason for arity, tag and value-shape failures.
pub const ABORT_TYPE_ERROR: &str = "type error";
/// Abort reason for engine-level failures (compilation, value creation).
pub const ABORT_ENGINE_ERROR: &str = "engine error";
/// Abort reason when the proxy wrapper breaks its promise contract.
pub const ABORT_CONTRACT_VIOLATION: &str = "contract violation";
/// Abort reason when the transport reports a dropped connection.
pub const ABORT_CLIENT_DISCONNECTED: &str = "client disconnected";

/// Declared parameter type of a shared function.
///
/// The vocabulary is closed; [`ParamTag::from_str`] accepts exactly the six
/// lowercase tags and rejects everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamTag {
    Boolean,
    Number,
    String,
    Array,
    Object,
    Bytes,
}

impl ParamTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamTag::Boolean => "boolean",
            ParamTag::Number => "number",
            ParamTag::String => "string",
            ParamTag::Array => "array",
            ParamTag::Object => "object",
            ParamTag::Bytes => "bytes",
        }
    }
}

impl fmt::Display for ParamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamTag {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "boolean" => Ok(ParamTag::Boolean),
            "number" => Ok(ParamTag::Number),
            "string" => Ok(ParamTag::String),
            "array" => Ok(ParamTag::Array),
            "object" => Ok(ParamTag::Object),
            "bytes" => Ok(ParamTag::Bytes),
            other => Err(RuntimeError::UnsupportedType {
                tag: other.to_string(),
            }),
        }
    }
}

/// Ordered parameter types declared by a shared function.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FunctionSignature(Vec<ParamTag>);

impl FunctionSignature {
    pub fn new(tags: Vec<ParamTag>) -> Self {
        Self(tags)
    }

    /// Parse a signature from string tags, rejecting unknown tags.
    pub fn parse<I, S>(tags: I) -> Result<Self, RuntimeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for tag in tags {
            parsed.push(tag.as_ref().parse()?);
        }
        Ok(Self(parsed))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tags(&self) -> &[ParamTag] {
        &self.0
    }
}

/// One inbound call parameter: the transport's declared tag plus the value.
#[derive(Clone, Debug)]
pub struct Param {
    pub tag: ParamTag,
    pub value: JSValue,
}

impl Param {
    pub fn new(tag: ParamTag, value: JSValue) -> Self {
        Self { tag, value }
    }
}

/// Transport a request arrived over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Http,
    WebSocket,
    Ipc,
}

impl RequestType {
    /// The `CallMethode` literal exposed to user code.
    pub fn call_methode(&self) -> &'static str {
        match self {
            RequestType::Http => "http",
            RequestType::WebSocket => "ws",
            RequestType::Ipc => "ipc",
        }
    }
}

/// Atomic view of the transport's connection liveness.
///
/// The transport flips it to `false` on disconnect; user code observes it
/// through `request.http.IsConnected()`.
#[derive(Clone, Debug)]
pub struct ConnectionProbe {
    connected: Arc<AtomicBool>,
}

impl ConnectionProbe {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Default for ConnectionProbe {
    fn default() -> Self {
        Self::new(true)
    }
}

/// One HTTP cookie as exposed to user code. `expires` carries the raw
/// header string, unparsed.
#[derive(Clone, Debug, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: String,
}

/// HTTP transport metadata attached to an [`RpcRequest`].
#[derive(Clone, Debug, Default)]
pub struct HttpRequestMeta {
    pub host: String,
    pub proto: String,
    pub remote_addr: String,
    pub request_uri: String,
    pub content_length: u64,
    /// Header values in arrival order; single-valued headers still carry a
    /// one-element vector.
    pub headers: IndexMap<String, Vec<String>>,
    pub cookies: Vec<Cookie>,
    pub is_connected: ConnectionProbe,
}

/// The inbound call. Created by a transport, read-only to the pipeline.
#[derive(Clone, Debug)]
pub struct RpcRequest {
    pub request_type: RequestType,
    pub params: Vec<Param>,
    pub http: Option<HttpRequestMeta>,
}

impl RpcRequest {
    pub fn http(params: Vec<Param>, meta: HttpRequestMeta) -> Self {
        Self {
            request_type: RequestType::Http,
            params,
            http: Some(meta),
        }
    }

    pub fn websocket(params: Vec<Param>) -> Self {
        Self {
            request_type: RequestType::WebSocket,
            params,
            http: None,
        }
    }

    pub fn ipc(params: Vec<Param>) -> Self {
        Self {
            request_type: RequestType::Ipc,
            params,
            http: None,
        }
    }
}

/// Terminal outcome of one shared-function call.
///
/// Exactly one of these is delivered per accepted call, regardless of how
/// resolve, reject, exceptions and disconnects interleave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum FunctionCallState {
    Ok { result: JSValue },
    Exception { error: String },
    Aborted { error: String },
}

impl FunctionCallState {
    pub fn ok(result: JSValue) -> Self {
        FunctionCallState::Ok { result }
    }

    pub fn exception(error: impl Into<String>) -> Self {
        FunctionCallState::Exception {
            error: error.into(),
        }
    }

    pub fn aborted(error: impl Into<String>) -> Self {
        FunctionCallState::Aborted {
            error: error.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, FunctionCallState::Ok { .. })
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, FunctionCallState::Exception { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, FunctionCallState::Aborted { .. })
    }

    /// Wire form for transports.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_tags_are_exact_lowercase() {
        assert_eq!("boolean".parse::<ParamTag>().unwrap(), ParamTag::Boolean);
        assert_eq!("number".parse::<ParamTag>().unwrap(), ParamTag::Number);
        assert_eq!("string".parse::<ParamTag>().unwrap(), ParamTag::String);
        assert_eq!("array".parse::<ParamTag>().unwrap(), ParamTag::Array);
        assert_eq!("object".parse::<ParamTag>().unwrap(), ParamTag::Object);
        assert_eq!("bytes".parse::<ParamTag>().unwrap(), ParamTag::Bytes);

        assert!("Number".parse::<ParamTag>().is_err());
        assert!("bytes ".parse::<ParamTag>().is_err());
        assert!("int".parse::<ParamTag>().is_err());
        assert!("".parse::<ParamTag>().is_err());
    }

    #[test]
    fn test_signature_parse_reports_the_bad_tag() {
        let err = FunctionSignature::parse(["number", "buffer"]).unwrap_err();
        match err {
            RuntimeError::UnsupportedType { tag } => assert_eq!(tag, "buffer"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_call_methode_literals() {
        assert_eq!(RequestType::Http.call_methode(), "http");
        assert_eq!(RequestType::WebSocket.call_methode(), "ws");
        assert_eq!(RequestType::Ipc.call_methode(), "ipc");
    }

    #[test]
    fn test_connection_probe_is_shared() {
        let probe = ConnectionProbe::new(true);
        let view = probe.clone();
        assert!(view.is_connected());
        probe.set_connected(false);
        assert!(!view.is_connected());
    }

    #[test]
    fn test_function_call_state_wire_form() {
        assert_eq!(
            FunctionCallState::ok(JSValue::Int(5)).to_json(),
            serde_json::json!({"state": "ok", "result": 5})
        );
        assert_eq!(
            FunctionCallState::exception("nope").to_json(),
            serde_json::json!({"state": "exception", "error": "nope"})
        );
        assert_eq!(
            FunctionCallState::aborted(ABORT_CLIENT_DISCONNECTED).to_json(),
            serde_json::json!({"state": "aborted", "error": "client disconnected"})
        );
    }
}
