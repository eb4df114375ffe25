//! Parameter marshalling into the engine (the transport→engine direction).
//!
//! Runs inside an engine-loop turn; V8 value creation requires isolate
//! affinity. The reverse direction lives in `runner::engine_value_to_host`.

use deno_core::v8;

use crate::runtime::error::{RuntimeError, RuntimeResult};
use crate::runtime::js_value::JSValue;
use crate::runtime::rpc::{FunctionSignature, Param, ParamTag};

/// Convert typed RPC parameters into engine values.
///
/// Checks arity first, then compares each parameter's tag against the
/// signature before converting. On any failure no value is handed to user
/// code; the caller maps the error to an `aborted` terminal state.
pub(crate) fn convert_params<'s>(
    scope: &mut v8::HandleScope<'s>,
    signature: &FunctionSignature,
    params: &[Param],
) -> RuntimeResult<Vec<v8::Local<'s, v8::Value>>> {
    if params.len() != signature.len() {
        return Err(RuntimeError::ParameterCount {
            expected: signature.len(),
            actual: params.len(),
        });
    }

    let mut converted = Vec::with_capacity(params.len());
    for (index, (param, expected)) in params.iter().zip(signature.tags()).enumerate() {
        if param.tag != *expected {
            return Err(RuntimeError::TypeMismatch {
                index,
                expected: *expected,
                actual: param.tag,
            });
        }
        if !value_matches_tag(&param.value, param.tag) {
            return Err(RuntimeError::ValueShape {
                index,
                tag: param.tag,
            });
        }
        converted.push(engine_value(scope, &param.value)?);
    }

    Ok(converted)
}

fn value_matches_tag(value: &JSValue, tag: ParamTag) -> bool {
    match tag {
        ParamTag::Boolean => matches!(value, JSValue::Bool(_)),
        ParamTag::Number => matches!(value, JSValue::Int(_) | JSValue::Float(_)),
        ParamTag::String => matches!(value, JSValue::String(_)),
        ParamTag::Array => matches!(value, JSValue::Array(_)),
        ParamTag::Object => matches!(value, JSValue::Object(_)),
        ParamTag::Bytes => matches!(value, JSValue::Bytes(_)),
    }
}

/// Build an engine value for a host value. Recurses through arrays and
/// objects; allocation failures are engine errors.
pub(crate) fn engine_value<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: &JSValue,
) -> RuntimeResult<v8::Local<'s, v8::Value>> {
    match value {
        JSValue::Undefined => Ok(v8::undefined(scope).into()),
        JSValue::Null => Ok(v8::null(scope).into()),
        JSValue::Bool(b) => Ok(v8::Boolean::new(scope, *b).into()),
        JSValue::Int(i) => Ok(v8::Number::new(scope, *i as f64).into()),
        JSValue::Float(f) => Ok(v8::Number::new(scope, *f).into()),
        JSValue::String(s) => {
            let v8_str = v8::String::new(scope, s)
                .ok_or_else(|| RuntimeError::engine("failed to allocate string"))?;
            Ok(v8_str.into())
        }
        JSValue::Bytes(bytes) => {
            let backing = v8::ArrayBuffer::new_backing_store_from_vec(bytes.clone());
            let shared = backing.make_shared();
            let buffer = v8::ArrayBuffer::with_backing_store(scope, &shared);
            let typed = v8::Uint8Array::new(scope, buffer, 0, bytes.len())
                .ok_or_else(|| RuntimeError::engine("failed to create Uint8Array"))?;
            Ok(typed.into())
        }
        JSValue::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (index, item) in items.iter().enumerate() {
                let v8_value = engine_value(scope, item)?;
                array
                    .set_index(scope, index as u32, v8_value)
                    .ok_or_else(|| RuntimeError::engine("failed to set array element"))?;
            }
            Ok(array.into())
        }
        JSValue::Object(map) => {
            let object = v8::Object::new(scope);
            for (key, val) in map.iter() {
                let key_str = v8::String::new(scope, key).ok_or_else(|| {
                    RuntimeError::engine(format!("failed to allocate key '{key}'"))
                })?;
                let v8_value = engine_value(scope, val)?;
                object
                    .set(scope, key_str.into(), v8_value)
                    .ok_or_else(|| RuntimeError::engine(format!("failed to set property '{key}'")))?;
            }
            Ok(object.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Conversion itself needs a live isolate and is covered by the pipeline
    // tests; the shape checks are pure.

    #[test]
    fn test_value_matches_tag() {
        assert!(value_matches_tag(&JSValue::Bool(true), ParamTag::Boolean));
        assert!(value_matches_tag(&JSValue::Int(1), ParamTag::Number));
        assert!(value_matches_tag(&JSValue::Float(1.5), ParamTag::Number));
        assert!(value_matches_tag(
            &JSValue::String("x".into()),
            ParamTag::String
        ));
        assert!(value_matches_tag(&JSValue::Array(vec![]), ParamTag::Array));
        assert!(value_matches_tag(
            &JSValue::Object(Default::default()),
            ParamTag::Object
        ));
        assert!(value_matches_tag(&JSValue::Bytes(vec![1]), ParamTag::Bytes));

        assert!(!value_matches_tag(&JSValue::Int(1), ParamTag::String));
        assert!(!value_matches_tag(&JSValue::Null, ParamTag::Object));
        assert!(!value_matches_tag(&JSValue::Array(vec![]), ParamTag::Bytes));
    }
}
