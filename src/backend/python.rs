//! Python interpreters, one child process per task.
//!
//! The child runs a small bootstrap (`python_bootstrap.py`) and talks to the
//! host over [`StdioPipeTransport`]. Capability calls made by the script are
//! sent back to the host as requests and answered before the pending host
//! request completes, so the exchange stays strictly request/response.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{utf8, Interpreter, Language, Returned, ScriptBackend, ScriptError};
use crate::capability::{self, Capabilities};
use crate::transport::StdioPipeTransport;

const BOOTSTRAP: &str = include_str!("python_bootstrap.py");

pub const DEFAULT_PYTHON: &str = "python3";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Host to child.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Bind {
        modules: BTreeMap<&'static str, &'static [&'static str]>,
    },
    Load {
        script: &'a str,
    },
    Call {
        name: &'a str,
        argument: Option<&'a str>,
    },
    CapabilityResult {
        value: Value,
    },
    CapabilityError {
        message: String,
    },
    Shutdown,
}

/// Child to host.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChildMessage {
    Done,
    Returned {
        value: Option<bool>,
        #[serde(default)]
        type_name: String,
    },
    NotCallable,
    Raised {
        message: String,
    },
    Capability {
        module: String,
        function: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct PythonBackend {
    program: String,
    ready_timeout: Duration,
}

impl PythonBackend {
    pub fn new(program: impl Into<String>, ready_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            ready_timeout,
        }
    }
}

impl Default for PythonBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PYTHON, DEFAULT_READY_TIMEOUT)
    }
}

impl ScriptBackend for PythonBackend {
    fn language(&self) -> Language {
        Language::Python
    }

    fn create(&self) -> Result<Box<dyn Interpreter>, ScriptError> {
        let transport = StdioPipeTransport::spawn(&self.program, &["-u", "-c", BOOTSTRAP], self.ready_timeout)
            .map_err(|e| ScriptError::Interpreter(format!("{e:#}")))?;
        Ok(Box::new(PythonInterpreter {
            transport,
            capabilities: None,
        }))
    }
}

struct PythonInterpreter {
    transport: StdioPipeTransport,
    capabilities: Option<Capabilities>,
}

fn pipe_error(e: &anyhow::Error) -> ScriptError {
    ScriptError::Interpreter(format!("{e:#}"))
}

fn unexpected(reply: &ChildMessage) -> ScriptError {
    ScriptError::Interpreter(format!("unexpected interpreter reply: {reply:?}"))
}

impl PythonInterpreter {
    /// Send one request and serve capability calls until its answer arrives.
    fn exchange(&mut self, message: &HostMessage<'_>) -> Result<ChildMessage, ScriptError> {
        self.transport.send(message).map_err(|e| pipe_error(&e))?;
        loop {
            let reply: ChildMessage = self.transport.recv().map_err(|e| pipe_error(&e))?;
            let ChildMessage::Capability { module, function, args } = reply else {
                return Ok(reply);
            };

            let answer = match &self.capabilities {
                Some(capabilities) => match capabilities.invoke(&module, &function, &args) {
                    Ok(value) => HostMessage::CapabilityResult { value },
                    Err(e) => HostMessage::CapabilityError { message: e.to_string() },
                },
                None => HostMessage::CapabilityError {
                    message: format!("{module}.{function} called before capabilities were bound"),
                },
            };
            self.transport.send(&answer).map_err(|e| pipe_error(&e))?;
        }
    }
}

impl Interpreter for PythonInterpreter {
    fn bind_capabilities(&mut self, capabilities: &Capabilities) -> Result<(), ScriptError> {
        self.capabilities = Some(capabilities.clone());
        let modules = capability::MODULES
            .into_iter()
            .map(|module| (module, capability::functions(module)))
            .collect();
        match self.exchange(&HostMessage::Bind { modules })? {
            ChildMessage::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn load_script(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        let script = utf8("script", script)?;
        match self.exchange(&HostMessage::Load { script })? {
            ChildMessage::Done => Ok(()),
            ChildMessage::Raised { message } => Err(ScriptError::Raised(message)),
            other => Err(unexpected(&other)),
        }
    }

    fn invoke(&mut self, name: &str, argument: Option<&[u8]>) -> Result<Returned, ScriptError> {
        let argument = argument.map(|bytes| utf8("argument", bytes)).transpose()?;
        match self.exchange(&HostMessage::Call { name, argument })? {
            ChildMessage::Returned { value: Some(b), .. } => Ok(Returned::Bool(b)),
            ChildMessage::Returned { value: None, type_name } => Ok(Returned::Other(type_name)),
            ChildMessage::NotCallable => Err(ScriptError::NotCallable(name.to_string())),
            ChildMessage::Raised { message } => Err(ScriptError::Raised(message)),
            other => Err(unexpected(&other)),
        }
    }

    fn destroy(mut self: Box<Self>) {
        debug!("Stopping Python interpreter process");
        self.transport.shutdown(&HostMessage::Shutdown);
    }
}
