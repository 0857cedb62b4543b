//! The network service: connection manager, worker pool and orchestrator
//! wired together, with `run`/`stop`/`status` handlers registered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::backend::{Backends, Language};
use crate::config::Config;
use crate::pool::WorkerPool;
use crate::server::{self, ConnectionManager, HandlerHandle, ServerHandle};
use crate::task::registry::{ClientId, RunnerId, TaskEntry};
use crate::task::reporter::TaskReporter;
use crate::task::{Orchestrator, TaskSpec};
use crate::transport::protocol::{self, Command, LogLevel, PayloadReader, RunRequest};

/// How often shutdown checks for remaining live tasks.
const JOIN_POLL: Duration = Duration::from_millis(50);

/// Sends task events to the client that submitted the task.
pub struct NetworkReporter {
    connections: ConnectionManager,
}

impl NetworkReporter {
    pub const fn new(connections: ConnectionManager) -> Self {
        Self { connections }
    }
}

impl TaskReporter for NetworkReporter {
    fn log(&self, task: &TaskEntry, level: LogLevel, message: &str) {
        let frame = protocol::log_frame(task.user_id, task.task_id, level, &task.name, message);
        if let Err(e) = self.connections.send(task.client_id, frame) {
            debug!(runner = %task.runner_id, error = %e, "Log frame dropped");
        }
    }

    fn result(&self, task: &TaskEntry, result: bool) {
        let frame = protocol::result_frame(task.user_id, task.task_id, result, task.runner_id.get());
        if let Err(e) = self.connections.send(task.client_id, frame) {
            warn!(runner = %task.runner_id, error = %e, "Result frame dropped");
        }
    }
}

pub struct Service {
    config: Config,
    pool: Arc<WorkerPool>,
    connections: ConnectionManager,
    orchestrator: Arc<Orchestrator>,
    handlers: Vec<HandlerHandle>,
}

impl Service {
    /// Build the service with the standard Lua, Python and JavaScript backends.
    pub fn new(config: Config) -> Result<Self> {
        let backends = Backends::standard(config.python_backend());
        Self::with_backends(config, backends)
    }

    pub fn with_backends(config: Config, backends: Backends) -> Result<Self> {
        let key = config.require_key()?.to_string();
        let pool = Arc::new(WorkerPool::new(config.workers));
        let connections = ConnectionManager::new(key, pool.clone());
        let reporter = Arc::new(NetworkReporter::new(connections.clone()));
        let orchestrator = Arc::new(Orchestrator::new(pool.clone(), backends, reporter));

        let mut service = Self {
            config,
            pool,
            connections,
            orchestrator,
            handlers: Vec::new(),
        };
        service.handlers = service.register_handlers();
        Ok(service)
    }

    pub const fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn register_handlers(&self) -> Vec<HandlerHandle> {
        let orchestrator = self.orchestrator.clone();
        let connections = self.connections.clone();
        let run = self.connections.add_handler(Command::Run, move |client, reader| {
            handle_run(&orchestrator, &connections, client, reader);
        });

        let orchestrator = self.orchestrator.clone();
        let connections = self.connections.clone();
        let stop = self.connections.add_handler(Command::Stop, move |client, reader| {
            let Ok(runner) = reader.read_u64() else {
                debug!(client, "Malformed stop request");
                return;
            };
            let accepted = orchestrator.stop(RunnerId::new(runner));
            reply(&connections, client, protocol::stop_reply(accepted));
        });

        let orchestrator = self.orchestrator.clone();
        let connections = self.connections.clone();
        let status = self.connections.add_handler(Command::Status, move |client, reader| {
            let Ok(runner) = reader.read_u64() else {
                debug!(client, "Malformed status request");
                return;
            };
            let status = orchestrator.status(RunnerId::new(runner));
            reply(&connections, client, protocol::status_reply(status.code()));
        });

        vec![run, stop, status]
    }

    /// Bind the configured address and start accepting clients.
    pub async fn start(&self) -> Result<ServerHandle> {
        let address = self.config.listen_address();
        server::listen(&address, self.connections.clone(), self.config.max_frame_size)
            .await
            .with_context(|| format!("Failed to listen on {address}"))
    }

    /// Wait for every live task to finish, then stop the worker pool.
    ///
    /// Blocks; call from a blocking context.
    pub fn shutdown(&self) {
        info!(live = self.orchestrator.live_tasks(), "Waiting for live tasks");
        self.orchestrator.join(JOIN_POLL);
        self.pool.shutdown();
        info!("Service stopped");
    }
}

impl Drop for Service {
    // The handlers hold the connection manager that holds them.
    fn drop(&mut self) {
        for handle in self.handlers.drain(..) {
            self.connections.remove_handler(handle);
        }
        self.pool.shutdown();
    }
}

fn reply(connections: &ConnectionManager, client: ClientId, frame: Vec<u8>) {
    if let Err(e) = connections.send(client, frame) {
        debug!(client, error = %e, "Reply dropped");
    }
}

/// Queue the task and answer `{run, ok, id}` from its worker once the
/// interpreter exists. Never blocks the dispatching worker.
fn handle_run(orchestrator: &Orchestrator, connections: &ConnectionManager, client: ClientId, reader: &mut PayloadReader<'_>) {
    let request = match RunRequest::decode(reader) {
        Ok(request) => request,
        Err(e) => {
            warn!(client, error = %e, "Malformed run request");
            return;
        }
    };

    let (user, task) = (request.user_id, request.task_id);
    let language = match Language::try_from(request.language) {
        Ok(language) => language,
        Err(byte) => {
            warn!(client, language = byte, "Unknown language");
            reply(connections, client, protocol::run_reply(RunnerId::NONE.get()));
            return;
        }
    };

    let connections = connections.clone();
    orchestrator.submit(
        TaskSpec {
            client_id: client,
            user_id: user,
            task_id: task,
            language,
            name: request.name,
            script: request.script,
            passport: request.passport,
            call_methods: request.call_methods,
        },
        move |runner| {
            info!(client, user, task, runner = %runner, "Run request handled");
            reply(&connections, client, protocol::run_reply(runner.get()));
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    use crate::backend::LuaBackend;
    use crate::transport::protocol::{decode_frame, handshake_request, runner_request};

    fn service() -> Service {
        let config = Config {
            key: Some("k".into()),
            workers: 2,
            ..Config::default()
        };
        Service::with_backends(config, Backends::new().with(Arc::new(LuaBackend::new()))).unwrap()
    }

    fn client(service: &Service) -> (ClientId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = service.connections().connect(tx);
        service.connections().handle_packet(client, &handshake_request(b"k"));
        assert_eq!(rx.try_recv().unwrap(), protocol::handshake_reply(true));
        (client, rx)
    }

    /// Collect frames until `done` holds, failing after ten seconds.
    fn collect_until(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, done: impl Fn(&[Vec<u8>]) -> bool) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = Vec::new();
        while !done(&frames) {
            match rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => {
                    assert!(Instant::now() < deadline, "timed out after {frames:?}");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        frames
    }

    fn count(frames: &[Vec<u8>], command: Command) -> usize {
        frames
            .iter()
            .filter(|frame| decode_frame(frame).unwrap().0 == command)
            .count()
    }

    #[test]
    fn missing_key_is_refused() {
        assert!(Service::with_backends(Config::default(), Backends::new()).is_err());
    }

    #[test]
    fn unknown_language_is_answered_with_zero() {
        let service = service();
        let (client, mut rx) = client(&service);
        let request = RunRequest {
            user_id: 1,
            task_id: 2,
            language: 9,
            name: "x".into(),
            script: Vec::new(),
            passport: Vec::new(),
            call_methods: "main".into(),
        };
        service.connections().handle_packet(client, &request.encode());
        assert_eq!(rx.try_recv().unwrap(), protocol::run_reply(0));
    }

    #[test]
    fn stop_and_status_reply_directly() {
        let service = service();
        let (client, mut rx) = client(&service);

        service.connections().handle_packet(client, &runner_request(Command::Stop, 5));
        assert_eq!(rx.try_recv().unwrap(), protocol::stop_reply(false));

        service.connections().handle_packet(client, &runner_request(Command::Status, 5));
        let frame = rx.try_recv().unwrap();
        let (command, mut reader) = decode_frame(&frame).unwrap();
        assert_eq!(command, Command::Status);
        assert_eq!(reader.read_u8().unwrap(), 3);
    }

    #[test]
    fn more_runs_than_workers_all_complete() {
        let service = service();
        let (client, mut rx) = client(&service);
        let script = "function setTaskPassport() end function main() system.delay(100) return true end";
        for task_id in 0..3 {
            let request = RunRequest {
                user_id: 1,
                task_id,
                language: Language::Lua as u8,
                name: "busy".into(),
                script: script.into(),
                passport: Vec::new(),
                call_methods: "main".into(),
            };
            service.connections().dispatch(client, request.encode());
        }

        // New clients are still served while the tasks run.
        let (tx, mut other_rx) = mpsc::unbounded_channel();
        let other = service.connections().connect(tx);
        service.connections().dispatch(other, handshake_request(b"k"));
        let replies = collect_until(&mut other_rx, |frames| !frames.is_empty());
        assert_eq!(replies, vec![protocol::handshake_reply(true)]);

        let frames = collect_until(&mut rx, |frames| count(frames, Command::Result) == 3);
        assert_eq!(count(&frames, Command::Run), 3);

        // Each task's run reply precedes its result.
        let mut announced = Vec::new();
        for frame in &frames {
            let (command, mut reader) = decode_frame(frame).unwrap();
            match command {
                Command::Run => {
                    assert!(reader.read_bool().unwrap());
                    announced.push(reader.read_u64().unwrap());
                }
                Command::Result => {
                    reader.read_u64().unwrap();
                    reader.read_u64().unwrap();
                    assert!(reader.read_bool().unwrap());
                    let runner = reader.read_u64().unwrap();
                    assert!(announced.contains(&runner), "result for {runner} before its run reply");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn results_go_back_to_the_submitting_client() {
        let service = service();
        let (client, mut rx) = client(&service);
        let request = RunRequest {
            user_id: 10,
            task_id: 20,
            language: Language::Lua as u8,
            name: "job".into(),
            script: "function setTaskPassport() end function main() logger.succeed('done') return true end".into(),
            passport: Vec::new(),
            call_methods: "main".into(),
        };
        service.connections().handle_packet(client, &request.encode());
        service.shutdown();

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        let run = frames
            .iter()
            .find(|frame| decode_frame(frame).unwrap().0 == Command::Run)
            .unwrap();
        let (_, mut reader) = decode_frame(run).unwrap();
        assert!(reader.read_bool().unwrap());
        let runner = reader.read_u64().unwrap();

        let results: Vec<_> = frames
            .iter()
            .filter(|frame| decode_frame(frame).unwrap().0 == Command::Result)
            .collect();
        assert_eq!(results, vec![&protocol::result_frame(10, 20, true, runner)]);
        assert!(frames.contains(&protocol::log_frame(10, 20, LogLevel::Succeed, "job", "done")));
    }
}
