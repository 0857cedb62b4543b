//! Lua 5.4 interpreters embedded with mlua.

use mlua::{Function, Lua, LuaSerdeExt, MultiValue, SerializeOptions, Table, Value};
use tracing::debug;

use super::{Interpreter, Language, Returned, ScriptBackend, ScriptError};
use crate::capability::{self, Capabilities, LOGGER};

#[derive(Debug, Default, Clone, Copy)]
pub struct LuaBackend;

impl LuaBackend {
    pub const fn new() -> Self {
        Self
    }
}

impl ScriptBackend for LuaBackend {
    fn language(&self) -> Language {
        Language::Lua
    }

    fn create(&self) -> Result<Box<dyn Interpreter>, ScriptError> {
        Ok(Box::new(LuaInterpreter { lua: Lua::new() }))
    }
}

struct LuaInterpreter {
    lua: Lua,
}

/// JSON `null` becomes `nil` rather than mlua's null sentinel.
fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

/// Text form of a Lua value as `logger` prints it.
fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => format_float(*n),
        Value::String(s) => format!("{}", s.to_string_lossy()),
        other => other.type_name().to_string(),
    }
}

/// Float text as Lua's `tostring` gives it: `%.14g`, plus `.0` when the
/// result would read as an integer.
fn format_float(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }

    const SIGNIFICANT: i32 = 14;
    let scientific = format!("{:.*e}", (SIGNIFICANT - 1) as usize, n);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    let text = if exponent < -4 || exponent >= SIGNIFICANT {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.unsigned_abs())
    } else {
        let decimals = usize::try_from(SIGNIFICANT - 1 - exponent).unwrap_or(0);
        trim_fraction(&format!("{n:.decimals$}")).to_string()
    };

    if text.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        format!("{text}.0")
    } else {
        text
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

fn module_table(lua: &Lua, capabilities: &Capabilities, module: &'static str) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    for &function in capability::functions(module) {
        let caps = capabilities.clone();
        let native = lua.create_function(move |lua, args: MultiValue| {
            let args = if module == LOGGER {
                args.iter().map(|arg| serde_json::Value::String(display(arg))).collect()
            } else {
                args.into_iter()
                    .map(|arg| lua.from_value::<serde_json::Value>(arg))
                    .collect::<mlua::Result<Vec<_>>>()?
            };
            let result = caps
                .invoke(module, function, &args)
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            lua.to_value_with(&result, serialize_options())
        })?;
        table.set(function, native)?;
    }
    Ok(table)
}

impl Interpreter for LuaInterpreter {
    fn bind_capabilities(&mut self, capabilities: &Capabilities) -> Result<(), ScriptError> {
        let globals = self.lua.globals();
        for module in capability::MODULES {
            let table = module_table(&self.lua, capabilities, module)
                .map_err(|e| ScriptError::Interpreter(e.to_string()))?;
            globals
                .set(module, table)
                .map_err(|e| ScriptError::Interpreter(e.to_string()))?;
        }
        Ok(())
    }

    fn load_script(&mut self, script: &[u8]) -> Result<(), ScriptError> {
        self.lua
            .load(script)
            .set_name("=script")
            .exec()
            .map_err(|e| ScriptError::Raised(e.to_string()))
    }

    fn invoke(&mut self, name: &str, argument: Option<&[u8]>) -> Result<Returned, ScriptError> {
        let value: Value = self
            .lua
            .globals()
            .get(name)
            .map_err(|e| ScriptError::Interpreter(e.to_string()))?;
        let Value::Function(function) = value else {
            return Err(ScriptError::NotCallable(name.to_string()));
        };

        let returned = call(&self.lua, &function, argument).map_err(|e| ScriptError::Raised(e.to_string()))?;
        Ok(match returned {
            Value::Boolean(b) => Returned::Bool(b),
            other => Returned::Other(other.type_name().to_string()),
        })
    }

    fn destroy(self: Box<Self>) {
        debug!(memory = self.lua.used_memory(), "Closing Lua state");
    }
}

// Lua strings are byte strings, so the argument is passed through untouched.
fn call(lua: &Lua, function: &Function, argument: Option<&[u8]>) -> mlua::Result<Value> {
    match argument {
        Some(argument) => function.call(lua.create_string(argument)?),
        None => function.call(()),
    }
}
