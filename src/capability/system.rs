//! `system` module.

use std::thread;
use std::time::Duration;

use serde_json::Value;

use super::{unsupported, CapabilityError, SYSTEM};

pub(super) const FUNCTIONS: &[&str] = &["delay"];

pub(super) fn call(function: &str, args: &[Value]) -> Result<Value, CapabilityError> {
    match function {
        "delay" => {
            let millis = args
                .first()
                .and_then(Value::as_f64)
                .filter(|ms| *ms >= 0.0)
                .ok_or_else(|| CapabilityError::InvalidArgument {
                    function: "delay",
                    message: "argument 1 must be a non-negative number of milliseconds".into(),
                })?;
            let duration = Duration::try_from_secs_f64(millis / 1000.0).map_err(|e| CapabilityError::InvalidArgument {
                function: "delay",
                message: e.to_string(),
            })?;
            // Blocks the task's worker, like any other blocking call a script makes.
            thread::sleep(duration);
            Ok(Value::Null)
        }
        _ => Err(unsupported(SYSTEM, function)),
    }
}
