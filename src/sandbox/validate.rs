//! Argument validation against a tool's declared schema
//!
//! Pure function, separate from rendering so both stages test in isolation.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::definition::{ParameterType, ToolDefinition};
use crate::{Error, Result};

/// Validate caller-supplied arguments against the declared parameter schema.
///
/// Every required name must be present and every supplied value must satisfy
/// its declared type. Arguments the schema does not declare are dropped, not
/// passed through.
///
/// # Errors
///
/// Returns [`Error::Validation`] on a missing or ill-typed required argument
pub fn validate_args(
    def: &ToolDefinition,
    supplied: &Map<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    for required in &def.parameters.required {
        if !supplied.contains_key(required) {
            return Err(Error::Validation(format!(
                "tool {}: missing required argument {required}",
                def.name
            )));
        }
    }

    let mut accepted = BTreeMap::new();
    for (name, spec) in &def.parameters.properties {
        let Some(value) = supplied.get(name) else {
            continue;
        };

        if !type_matches(spec.kind, value) {
            return Err(Error::Validation(format!(
                "tool {}: argument {name} is not a {:?}",
                def.name, spec.kind
            )));
        }

        accepted.insert(name.clone(), value.clone());
    }

    Ok(accepted)
}

fn type_matches(kind: ParameterType, value: &Value) -> bool {
    match kind {
        ParameterType::String => value.is_string(),
        ParameterType::Number => value.is_number(),
        ParameterType::Integer => value.is_i64() || value.is_u64(),
        ParameterType::Boolean => value.is_boolean(),
    }
}
