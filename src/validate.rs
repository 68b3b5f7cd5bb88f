use serde_json::Value;
use std::collections::BTreeMap;

const VALID_STATE_MUTABILITIES: [&str; 4] = ["pure", "view", "nonpayable", "payable"];

/// Structurally validates a model-synthesized ABI plus its confidence map.
///
/// This is the last gate before an extrapolated ABI is trusted by anything
/// downstream: pure, no I/O, and it never panics on adversarial input.
/// Any structural violation just yields `false`. Tuple components are
/// validated recursively all the way down, not only one level deep.
pub fn validate_extrapolated_abi(abi: &Value, confidence: &BTreeMap<String, f64>) -> bool {
    let Some(items) = abi.as_array() else {
        return false;
    };

    for item in items {
        if !fragment_is_valid(item) {
            return false;
        }
    }

    confidence
        .values()
        .all(|score| score.is_finite() && (0.0..=1.0).contains(score))
}

fn fragment_is_valid(item: &Value) -> bool {
    let has_name = item
        .get("name")
        .and_then(Value::as_str)
        .map(|name| !name.is_empty())
        .unwrap_or(false);
    if !has_name {
        return false;
    }

    let Some(mutability) = item.get("stateMutability").and_then(Value::as_str) else {
        return false;
    };
    if !VALID_STATE_MUTABILITIES.contains(&mutability) {
        return false;
    }

    for field in ["inputs", "outputs"] {
        let Some(parameters) = item.get(field).and_then(Value::as_array) else {
            return false;
        };
        if !parameters.iter().all(parameter_is_valid) {
            return false;
        }
    }

    true
}

fn parameter_is_valid(parameter: &Value) -> bool {
    if parameter.get("internalType").and_then(Value::as_str).is_none() {
        return false;
    }
    if parameter.get("type").and_then(Value::as_str).is_none() {
        return false;
    }

    match parameter.get("components") {
        None | Some(Value::Null) => true,
        Some(Value::Array(components)) => components.iter().all(parameter_is_valid),
        Some(_) => false,
    }
}

/// Derives the canonical `name(type,type,...)` key for an ABI fragment, with
/// tuples expanded into their component types. Returns `None` for unnamed
/// fragments (constructor, fallback, receive).
pub fn fragment_signature(fragment: &Value) -> Option<String> {
    let name = fragment.get("name")?.as_str()?;
    let inputs = fragment
        .get("inputs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let types: Vec<String> = inputs.iter().map(parameter_type_string).collect();
    Some(format!("{}({})", name, types.join(",")))
}

fn parameter_type_string(parameter: &Value) -> String {
    let ty = parameter
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if let Some(base) = ty.strip_suffix("[]") {
        if base == "tuple" {
            if let Some(components) = parameter.get("components").and_then(Value::as_array) {
                let inner: Vec<String> =
                    components.iter().map(parameter_type_string).collect();
                return format!("({})[]", inner.join(","));
            }
        }
    } else if ty == "tuple" {
        if let Some(components) = parameter.get("components").and_then(Value::as_array) {
            let inner: Vec<String> = components.iter().map(parameter_type_string).collect();
            return format!("({})", inner.join(","));
        }
    }

    ty.to_string()
}

/// Normalizes a confidence-map key so that provider output written with
/// cosmetic spaces ("transfer(address, uint256)") matches the canonical
/// signature form.
pub fn normalize_signature_key(key: &str) -> String {
    key.chars().filter(|c| !c.is_whitespace()).collect()
}
