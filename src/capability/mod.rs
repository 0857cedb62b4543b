//! Host functions bound into every sandbox.
//!
//! Each interpreter exposes the modules below as globals (`crypto.sha256`,
//! `logger.info`, ...). Adapters convert native arguments to JSON values and
//! route every call through [`Capabilities::invoke`]; the JSON result is
//! converted back into a native value.

mod crypto;
mod json;
mod requests;
mod system;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::task::registry::TaskEntry;
use crate::task::reporter::TaskReporter;
use crate::transport::protocol::LogLevel;

pub const CRYPTO: &str = "crypto";
pub const JSON: &str = "json";
pub const REQUESTS: &str = "requests";
pub const SYSTEM: &str = "system";
pub const LOGGER: &str = "logger";

/// Every module bound into a sandbox, in binding order.
pub const MODULES: [&str; 5] = [CRYPTO, JSON, REQUESTS, LOGGER, SYSTEM];

/// Function names exposed by `module`.
pub fn functions(module: &str) -> &'static [&'static str] {
    match module {
        CRYPTO => crypto::FUNCTIONS,
        JSON => json::FUNCTIONS,
        REQUESTS => requests::FUNCTIONS,
        SYSTEM => system::FUNCTIONS,
        LOGGER => &["operation", "info", "failed", "succeed"],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("{module}.{function} is not supported")]
    Unsupported {
        module: String,
        function: String,
    },

    #[error("{function}: {message}")]
    InvalidArgument {
        function: &'static str,
        message: String,
    },
}

/// Capability set bound to one task.
///
/// Cheap to clone; adapters hand a clone to every native function they create.
#[derive(Clone)]
pub struct Capabilities {
    task: Arc<TaskEntry>,
    reporter: Arc<dyn TaskReporter>,
}

impl Capabilities {
    pub fn new(task: Arc<TaskEntry>, reporter: Arc<dyn TaskReporter>) -> Self {
        Self { task, reporter }
    }

    pub fn task(&self) -> &TaskEntry {
        &self.task
    }

    /// Emit a log event for the owning task.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.reporter.log(&self.task, level, message);
    }

    /// Call `module.function(args...)`.
    pub fn invoke(&self, module: &str, function: &str, args: &[Value]) -> Result<Value, CapabilityError> {
        debug!(runner = %self.task.runner_id, module, function, "Capability call");
        match module {
            CRYPTO => crypto::call(function, args),
            JSON => json::call(function, args),
            REQUESTS => requests::call(function, args),
            SYSTEM => system::call(function, args),
            LOGGER => {
                let level = LogLevel::from_name(function).ok_or_else(|| unsupported(module, function))?;
                let message = args.iter().map(display).collect::<Vec<_>>().join(" ");
                self.log(level, &message);
                Ok(Value::Null)
            }
            _ => Err(unsupported(module, function)),
        }
    }
}

fn unsupported(module: &str, function: &str) -> CapabilityError {
    CapabilityError::Unsupported {
        module: module.to_string(),
        function: function.to_string(),
    }
}

/// Text form of a value as the logger prints it. Strings are printed raw.
fn display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "nil".to_string(),
        other => other.to_string(),
    }
}

/// Required string argument at `index`.
fn string_arg<'a>(function: &'static str, args: &'a [Value], index: usize) -> Result<&'a str, CapabilityError> {
    match args.get(index) {
        Some(Value::String(text)) => Ok(text),
        other => Err(CapabilityError::InvalidArgument {
            function,
            message: format!("argument {} must be a string, got {}", index + 1, type_name(other)),
        }),
    }
}

/// Optional argument; a missing value and `null` both count as absent.
fn optional_arg(args: &[Value], index: usize) -> Option<&Value> {
    args.get(index).filter(|value| !value.is_null())
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None | Some(Value::Null) => "nothing",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}
