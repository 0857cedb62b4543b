//! `json` module.

use serde_json::Value;

use super::{string_arg, unsupported, CapabilityError, JSON};

pub(super) const FUNCTIONS: &[&str] = &["loads", "dumps"];

pub(super) fn call(function: &str, args: &[Value]) -> Result<Value, CapabilityError> {
    match function {
        "loads" => serde_json::from_str(string_arg("loads", args, 0)?).map_err(|e| CapabilityError::InvalidArgument {
            function: "loads",
            message: e.to_string(),
        }),
        "dumps" => {
            let value = args.first().unwrap_or(&Value::Null);
            Ok(Value::String(value.to_string()))
        }
        _ => Err(unsupported(JSON, function)),
    }
}
