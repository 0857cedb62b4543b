//! Stdin/stdout pipe transport to an interpreter child process.
//!
//! Owns a child process and exchanges length-prefixed JSON on the child's
//! stdin (host to child) and stdout (child to host). The child announces
//! itself with `{"type":"ready"}` before anything else is sent.
//!
//! A transport is owned by exactly one task on one worker thread, so all
//! calls are blocking and take `&mut self`.

use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::{recv_message, send_message};

/// How long `shutdown` waits for a graceful exit before killing the child.
const EXIT_GRACE: Duration = Duration::from_millis(500);

pub struct StdioPipeTransport {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    alive: bool,
}

impl StdioPipeTransport {
    /// Spawn `program args...` and wait for its ready message.
    ///
    /// The child's stderr is inherited so interpreter diagnostics and
    /// script `print` output stay visible to the operator.
    pub fn spawn(program: &str, args: &[&str], ready_timeout: Duration) -> Result<Self> {
        debug!(program = %program, "Spawning interpreter process");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter: {program}"))?;

        let stdin = child.stdin.take().context("Failed to take child stdin")?;
        let stdout = child.stdout.take().context("Failed to take child stdout")?;

        // Blocking reads have no timeout, so the ready message is awaited on
        // a helper thread. Killing the child unblocks it.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut stdout = BufReader::new(stdout);
            let ready = recv_message(&mut stdout);
            let _ = tx.send((stdout, ready));
        });

        let (stdout, ready) = match rx.recv_timeout(ready_timeout) {
            Ok(received) => received,
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("Interpreter did not send Ready within {ready_timeout:?}");
            }
        };

        let ready: serde_json::Value = match ready
            .context("Failed to read interpreter Ready message")
            .and_then(|bytes| {
                serde_json::from_slice(&bytes).context("Failed to parse interpreter Ready message")
            }) {
            Ok(value) => value,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };

        if ready.get("type").and_then(serde_json::Value::as_str) != Some("ready") {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("Expected Ready message, got: {ready}");
        }
        debug!("Interpreter process is ready");

        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout,
            alive: true,
        })
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        anyhow::ensure!(self.alive, "Interpreter process is not alive");
        let bytes = serde_json::to_vec(message).context("Failed to serialize message")?;
        send_message(&mut self.stdin, &bytes).context("Failed to write to interpreter")
    }

    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        anyhow::ensure!(self.alive, "Interpreter process is not alive");
        let bytes = recv_message(&mut self.stdout).map_err(|e| {
            self.alive = false;
            e.context("Failed to read from interpreter")
        })?;
        serde_json::from_slice(&bytes).context("Failed to parse interpreter message")
    }

    /// Ask the child to exit, then make sure it is gone.
    pub fn shutdown<T: Serialize>(&mut self, goodbye: &T) {
        if self.alive {
            if let Err(e) = self.send(goodbye) {
                warn!(error = %e, "Graceful shutdown failed, killing interpreter");
            }
            self.alive = false;
        }

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        debug!("Interpreter process shut down");
    }
}

impl Drop for StdioPipeTransport {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_fails_for_missing_program() {
        let result = StdioPipeTransport::spawn(
            "/nonexistent/interpreter",
            &[],
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn spawn_fails_when_child_exits_without_ready() {
        if Command::new("true").status().is_err() {
            return;
        }
        let result = StdioPipeTransport::spawn("true", &[], Duration::from_secs(5));
        assert!(result.is_err());
    }
}
