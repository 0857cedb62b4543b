//! Script backends: one per supported language.
//!
//! A backend creates [`Interpreter`] instances. The orchestrator drives every
//! interpreter through the same fixed sequence (bind capabilities, load the
//! script, invoke methods, destroy) and never looks at the language behind it.
//!
//! Interpreters are created on the worker thread that runs the task and never
//! leave it, so they need not be `Send`.

mod javascript;
mod lua;
mod python;

pub use javascript::JavaScriptBackend;
pub use lua::LuaBackend;
pub use python::PythonBackend;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::capability::Capabilities;

/// Language byte carried in `run` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Language {
    Lua = 0,
    Python = 1,
    JavaScript = 2,
}

impl Language {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lua => "lua",
            Self::Python => "python",
            Self::JavaScript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for Language {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Lua),
            1 => Ok(Self::Python),
            2 => Ok(Self::JavaScript),
            other => Err(other),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    /// Accepts the short names used on the command line (`lua`, `py`, `js`)
    /// as well as the full names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lua" => Ok(Self::Lua),
            "py" | "python" => Ok(Self::Python),
            "js" | "javascript" => Ok(Self::JavaScript),
            other => Err(format!("unknown language '{other}', available: lua, py, js")),
        }
    }
}

/// Errors raised by an interpreter while loading or invoking script code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The named global is missing or is not a function.
    #[error("{0} is not a function")]
    NotCallable(String),

    /// Script code raised an error or failed to compile.
    #[error("{0}")]
    Raised(String),

    /// The interpreter itself failed (runtime creation, child process I/O).
    #[error("interpreter failure: {0}")]
    Interpreter(String),
}

/// What a script function returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Returned {
    Bool(bool),
    /// Anything else, described by its type name.
    Other(String),
}

/// Factory for interpreters of one language.
pub trait ScriptBackend: Send + Sync {
    fn language(&self) -> Language;

    /// Construct a fresh, isolated interpreter.
    fn create(&self) -> Result<Box<dyn Interpreter>, ScriptError>;
}

/// One isolated interpreter instance, exclusively owned by its task.
pub trait Interpreter {
    /// Expose the capability modules as globals.
    fn bind_capabilities(&mut self, capabilities: &Capabilities) -> Result<(), ScriptError>;

    /// Evaluate the whole script in global scope.
    fn load_script(&mut self, script: &[u8]) -> Result<(), ScriptError>;

    /// Call the global function `name`, with `argument` as its only argument if given.
    fn invoke(&mut self, name: &str, argument: Option<&[u8]>) -> Result<Returned, ScriptError>;

    /// Tear the interpreter down.
    fn destroy(self: Box<Self>);
}

/// Backend lookup by language.
#[derive(Clone, Default)]
pub struct Backends {
    backends: HashMap<Language, Arc<dyn ScriptBackend>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lua and JavaScript in-process, Python through `python` child processes.
    pub fn standard(python: PythonBackend) -> Self {
        Self::new()
            .with(Arc::new(LuaBackend::new()))
            .with(Arc::new(python))
            .with(Arc::new(JavaScriptBackend::new()))
    }

    #[must_use]
    pub fn with(mut self, backend: Arc<dyn ScriptBackend>) -> Self {
        self.backends.insert(backend.language(), backend);
        self
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn ScriptBackend>> {
        self.backends.get(&language).cloned()
    }
}

/// Borrow raw request bytes as text for interpreters whose strings are
/// Unicode. Invalid input is refused rather than replaced.
pub(crate) fn utf8<'a>(what: &str, bytes: &'a [u8]) -> Result<&'a str, ScriptError> {
    std::str::from_utf8(bytes).map_err(|e| ScriptError::Raised(format!("{what} is not valid UTF-8: {e}")))
}

/// Split a comma-joined method list. Surrounding whitespace is ignored; an
/// empty entry is kept so that it fails as a missing function.
pub fn split_methods(call_methods: &str) -> Vec<&str> {
    call_methods.split(',').map(str::trim).collect()
}
