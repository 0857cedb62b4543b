//! script-runner library
//!
//! A TCP service that runs client-submitted Lua, Python and JavaScript
//! scripts in isolated interpreters:
//! - Binary wire protocol and framing ([`transport`])
//! - Client handshake and command dispatch ([`server`])
//! - Worker pool that runs all packet handling and tasks ([`pool`])
//! - Per-task lifecycle and reporting ([`task`])
//! - Interpreter backends and the host capability modules they expose
//!   ([`backend`], [`capability`])

pub mod backend;
pub mod capability;
pub mod config;
pub mod pool;
pub mod server;
pub mod service;
pub mod task;
pub mod transport;
