//! JavaScript interpreters embedded with QuickJS (rquickjs).
//!
//! Each interpreter owns its own QuickJS runtime. Promise jobs queued by a
//! script are drained after the script is loaded and after every call, so
//! `then` callbacks run before the task moves on.

use rquickjs::prelude::{Coerced, Rest};
use rquickjs::{CatchResultExt, Context, Ctx, Exception, Function, Object, Runtime, Value};
use tracing::{debug, warn};

use super::{utf8, Interpreter, Language, Returned, ScriptBackend, ScriptError};
use crate::capability::{self, Capabilities, LOGGER};

#[derive(Debug, Default, Clone, Copy)]
pub struct JavaScriptBackend;

impl JavaScriptBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl ScriptBackend for JavaScriptBackend {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn create(&self) -> Result<Box<dyn Interpreter>, ScriptError> {
        let runtime = Runtime::new().map_err(|e| ScriptError::Interpreter(e.to_string()))?;
        let context = Context::full(&runtime).map_err(|e| ScriptError::Interpreter(e.to_string()))?;
        Ok(Box::new(JavaScriptInterpreter { context, runtime }))
    }
}

// The context must be dropped before its runtime.
struct JavaScriptInterpreter {
    context: Context,
    runtime: Runtime,
}

impl JavaScriptInterpreter {
    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(_) => warn!("Pending JavaScript job raised an exception"),
            }
        }
    }
}

/// Convert a JS value to JSON. `undefined` and functions become `null`.
fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    let Some(text) = ctx.json_stringify(value)? else {
        return Ok(serde_json::Value::Null);
    };
    let text = text.to_string()?;
    serde_json::from_str(&text).map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}

fn from_json<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    ctx.json_parse(value.to_string())
}

fn bind_function<'js>(
    ctx: &Ctx<'js>,
    capabilities: Capabilities,
    module: &'static str,
    function: &'static str,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let mut converted = Vec::with_capacity(args.len());
            for arg in args.0 {
                converted.push(if module == LOGGER {
                    serde_json::Value::String(arg.get::<Coerced<String>>()?.0)
                } else {
                    to_json(&ctx, arg)?
                });
            }
            match capabilities.invoke(module, function, &converted) {
                Ok(result) => from_json(&ctx, &result),
                Err(e) => Err(Exception::throw_message(&ctx, &e.to_string())),
            }
        },
    )
}

fn bind_module<'js>(ctx: &Ctx<'js>, capabilities: &Capabilities, module: &'static str) -> rquickjs::Result<()> {
    let object = Object::new(ctx.clone())?;
    for &function in capability::functions(module) {
        object.set(function, bind_function(ctx, capabilities.clone(), module, function)?)?;
    }
    ctx.globals().set(module, object)
}

impl Interpreter for JavaScriptInterpreter {
    fn bind_capabilities(&mut self, capabilities: &Capabilities) -> Result<(), ScriptError> {
        self.context.with(|ctx| {
            for module in capability::MODULES {
                bind_module(&ctx, capabilities, module).map_err(|e| ScriptError::Interpreter(e.to_string()))?;
            }
            Ok(())
        })
    }

    fn load_script(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        let script = utf8("script", script)?;
        let loaded = self.context.with(|ctx| {
            ctx.eval::<(), _>(script)
                .catch(&ctx)
                .map_err(|e| ScriptError::Raised(e.to_string()))
        });
        self.drain_jobs();
        loaded
    }

    fn invoke(&mut self, name: &str, argument: Option<&[u8]>) -> Result<Returned, ScriptError> {
        let argument = argument.map(|bytes| utf8("argument", bytes)).transpose()?;
        let returned = self.context.with(|ctx| {
            let value: Value = ctx
                .globals()
                .get(name)
                .map_err(|e| ScriptError::Interpreter(e.to_string()))?;
            let Some(function) = value.as_function() else {
                return Err(ScriptError::NotCallable(name.to_string()));
            };
            let result: Value = match argument {
                Some(argument) => function.call::<_, Value>((argument,)),
                None => function.call::<_, Value>(()),
            }
            .catch(&ctx)
            .map_err(|e| ScriptError::Raised(e.to_string()))?;

            Ok(match result.as_bool() {
                Some(b) => Returned::Bool(b),
                None => Returned::Other(result.type_name().to_string()),
            })
        });
        self.drain_jobs();
        returned
    }

    fn destroy(self: Box<Self>) {
        debug!("Closing JavaScript runtime");
        self.runtime.run_gc();
    }
}
