//! Parameter validation at the dispatcher boundary
//!
//! Untyped input (JSON arguments, raw template captures) is checked against
//! a capability's declared descriptors before any collaborator is invoked.
//! Failures here are client errors, never provider errors.

use serde_json::{Map, Value};

use crate::error::{AlmanacError, Result};
use crate::registry::{ParamDescriptor, ParamMap, ParamType};

/// Validate tools/call arguments against the declared descriptors.
/// Missing required parameters and type mismatches are InvalidParams;
/// optional parameters get their declared defaults filled in. Undeclared
/// arguments pass through untouched, matching the lenient tools/call
/// convention.
pub fn validate_arguments(
    descriptors: &[ParamDescriptor],
    args: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    let mut validated = args.clone();

    for descriptor in descriptors {
        match args.get(&descriptor.name) {
            Some(Value::Null) | None => {
                if descriptor.required {
                    return Err(AlmanacError::InvalidParams(format!(
                        "missing required parameter '{}'",
                        descriptor.name
                    )));
                }
                if let Some(default) = &descriptor.default {
                    validated.insert(descriptor.name.clone(), default.clone());
                }
            }
            Some(value) => {
                if !matches_type(descriptor.param_type, value) {
                    return Err(AlmanacError::InvalidParams(format!(
                        "parameter '{}' must be a {}",
                        descriptor.name,
                        descriptor.param_type.as_str()
                    )));
                }
            }
        }
    }

    Ok(validated)
}

/// Validate raw template captures against the declared descriptors. Every
/// capture is a string; a capture declared as a non-string type must parse
/// as that type or the address is an InvalidParams client error.
pub fn validate_uri_params(descriptors: &[ParamDescriptor], params: &ParamMap) -> Result<()> {
    for descriptor in descriptors {
        let Some(raw) = params.get(&descriptor.name) else {
            // Template variables are always captured when the address
            // matches; a declared-but-unmatched name is an optional hint
            continue;
        };
        if coerce_capture(descriptor.param_type, raw).is_none() {
            return Err(AlmanacError::InvalidParams(format!(
                "address parameter '{}' must be a {}",
                descriptor.name,
                descriptor.param_type.as_str()
            )));
        }
    }
    Ok(())
}

fn matches_type(ty: ParamType, value: &Value) -> bool {
    match ty {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64(),
        ParamType::Number => value.is_number(),
        ParamType::Boolean => value.is_boolean(),
    }
}

/// Parse a raw capture as its declared type
pub fn coerce_capture(ty: ParamType, raw: &str) -> Option<Value> {
    match ty {
        ParamType::String => Some(Value::String(raw.to_string())),
        ParamType::Integer => raw.parse::<i64>().ok().map(Value::from),
        ParamType::Number => raw.parse::<f64>().ok().map(Value::from),
        ParamType::Boolean => raw.parse::<bool>().ok().map(Value::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptors() -> Vec<ParamDescriptor> {
        vec![
            ParamDescriptor::required("query", ParamType::String),
            ParamDescriptor::optional("limit", ParamType::Integer, Some(json!(10))),
        ]
    }

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_missing_required_is_invalid_params() {
        let err = validate_arguments(&descriptors(), &args(json!({"limit": 5}))).unwrap_err();
        assert!(matches!(err, AlmanacError::InvalidParams(_)));
    }

    #[test]
    fn test_default_filled_in() {
        let validated =
            validate_arguments(&descriptors(), &args(json!({"query": "rust"}))).unwrap();
        assert_eq!(validated["limit"], json!(10));
        assert_eq!(validated["query"], json!("rust"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = validate_arguments(&descriptors(), &args(json!({"query": 7}))).unwrap_err();
        assert!(matches!(err, AlmanacError::InvalidParams(_)));

        let err =
            validate_arguments(&descriptors(), &args(json!({"query": "q", "limit": "ten"})))
                .unwrap_err();
        assert!(matches!(err, AlmanacError::InvalidParams(_)));
    }

    #[test]
    fn test_explicit_value_beats_default() {
        let validated =
            validate_arguments(&descriptors(), &args(json!({"query": "q", "limit": 3}))).unwrap();
        assert_eq!(validated["limit"], json!(3));
    }

    #[test]
    fn test_uri_capture_coercion() {
        let descriptors = vec![ParamDescriptor::required("page", ParamType::Integer)];
        let mut params = ParamMap::new();
        params.insert("page".to_string(), "42".to_string());
        assert!(validate_uri_params(&descriptors, &params).is_ok());

        params.insert("page".to_string(), "forty-two".to_string());
        assert!(validate_uri_params(&descriptors, &params).is_err());
    }

    #[test]
    fn test_coerce_capture_types() {
        assert_eq!(coerce_capture(ParamType::Integer, "7"), Some(json!(7)));
        assert_eq!(coerce_capture(ParamType::Boolean, "true"), Some(json!(true)));
        assert_eq!(coerce_capture(ParamType::Integer, "x"), None);
    }
}
