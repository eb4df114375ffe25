//! Per-call JS request object: transport metadata plus Resolve/Reject.

use deno_core::v8;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::pipeline::{self, bind_callback};
use crate::runtime::rpc::{HttpRequestMeta, RequestType, RpcRequest};

/// Build the request object handed to the user function ahead of its
/// declared parameters.
pub(crate) fn build_request_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    call_id: u64,
    request: &RpcRequest,
) -> RuntimeResult<v8::Local<'s, v8::Object>> {
    let obj = v8::Object::new(scope);

    bind_callback(scope, obj, "Resolve", pipeline::resolve_callback, call_id)?;
    bind_callback(scope, obj, "Reject", pipeline::reject_callback, call_id)?;
    set_string(scope, obj, "CallMethode", request.request_type.call_methode())?;

    if request.request_type == RequestType::Http {
        let meta = request
            .http
            .as_ref()
            .ok_or_else(|| RuntimeError::engine("http request carries no http metadata"))?;
        let http = build_http_object(scope, call_id, meta)?;
        set_value(scope, obj, "http", http.into())?;
    }

    Ok(obj)
}

fn build_http_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    call_id: u64,
    meta: &HttpRequestMeta,
) -> RuntimeResult<v8::Local<'s, v8::Object>> {
    let http = v8::Object::new(scope);

    bind_callback(scope, http, "IsConnected", pipeline::is_connected_callback, call_id)?;
    set_number(scope, http, "ContentLength", meta.content_length as f64)?;
    set_string(scope, http, "Host", &meta.host)?;
    set_string(scope, http, "Proto", &meta.proto)?;
    set_string(scope, http, "RemoteAddr", &meta.remote_addr)?;
    set_string(scope, http, "RequestURI", &meta.request_uri)?;

    let cookies = v8::Object::new(scope);
    for cookie in &meta.cookies {
        let entry = v8::Object::new(scope);
        set_string(scope, entry, "Value", &cookie.value)?;
        set_string(scope, entry, "Domain", &cookie.domain)?;
        set_string(scope, entry, "Path", &cookie.path)?;
        set_string(scope, entry, "Expires", &cookie.expires)?;
        set_value(scope, cookies, &cookie.name, entry.into())?;
    }
    set_value(scope, http, "Cookies", cookies.into())?;

    // Every header value set is exposed as an array, even a single value.
    let headers = v8::Object::new(scope);
    for (name, values) in &meta.headers {
        let array = v8::Array::new(scope, values.len() as i32);
        for (index, value) in values.iter().enumerate() {
            let v8_value = v8::String::new(scope, value)
                .ok_or_else(|| RuntimeError::engine("failed to allocate header value"))?;
            array
                .set_index(scope, index as u32, v8_value.into())
                .ok_or_else(|| RuntimeError::engine("failed to push header value"))?;
        }
        set_value(scope, headers, name, array.into())?;
    }
    set_value(scope, http, "Headers", headers.into())?;

    Ok(http)
}

fn set_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    value: v8::Local<'s, v8::Value>,
) -> RuntimeResult<()> {
    let key = v8::String::new(scope, name)
        .ok_or_else(|| RuntimeError::engine(format!("failed to allocate key '{name}'")))?;
    object
        .set(scope, key.into(), value)
        .ok_or_else(|| RuntimeError::engine(format!("failed to set property '{name}'")))?;
    Ok(())
}

fn set_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    value: &str,
) -> RuntimeResult<()> {
    let v8_value = v8::String::new(scope, value)
        .ok_or_else(|| RuntimeError::engine(format!("failed to allocate value for '{name}'")))?;
    set_value(scope, object, name, v8_value.into())
}

fn set_number<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    name: &str,
    value: f64,
) -> RuntimeResult<()> {
    let v8_value = v8::Number::new(scope, value);
    set_value(scope, object, name, v8_value.into())
}
