//! Session controller - one debugging run, from `initialize` to termination.
//!
//! The session task is the only mutator of session state. It consumes:
//! - front-end requests, one at a time
//! - [`ProcessEvent`]s posted by the debuggee's reader and monitor tasks
//!
//! Most commands are forwarded to the debuggee and acknowledged immediately.
//! `stackTrace` is correlated: its response is deferred until the debuggee
//! replies or the correlation expires with an empty frame list.

use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::IncomingMessage;
use crate::bridge::writer::BackendWriter;
use crate::config::SessionConfig;
use crate::correlation::CorrelationTable;
use crate::dap::{Event, OutgoingMessage, Request, Response};
use crate::process::{self, DebuggeeSpawner, ExitInfo, LaunchError, LaunchSpec, ProcessEvent, ProcessHandle};
use crate::workspace::WorkspaceResolver;

pub const THREAD_ID: i64 = 1;
pub const THREAD_NAME: &str = "Main Thread";

const DEFAULT_STOP_REASON: &str = "pause";
const DEFAULT_OUTPUT_CATEGORY: &str = "console";
const DEFAULT_STACK_LEVELS: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Initializing,
    Launching,
    Running,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

/// Launch failures reported to the front end as error responses.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No workspace folder found")]
    NoWorkspace,
    #[error("launch requires a 'program' path")]
    MissingProgram,
    #[error("Failed to launch Etch: {0}")]
    Launch(#[from] LaunchError),
    #[error("Etch is already running in this session")]
    AlreadyLaunched,
    #[error("Debug session has terminated")]
    Terminated,
}

impl SessionError {
    /// Error id carried in the DAP error response body.
    pub fn code(&self) -> u32 {
        match self {
            Self::NoWorkspace | Self::MissingProgram => 2001,
            Self::Launch(LaunchError::NotFound { .. } | LaunchError::PermissionDenied { .. }) => {
                2002
            }
            Self::Launch(_) => 2003,
            Self::AlreadyLaunched | Self::Terminated => 2004,
        }
    }
}

fn capabilities() -> Value {
    json!({
        "supportsConfigurationDoneRequest": true,
        "supportsBreakpointLocationsRequest": false,
        "supportsStepBack": false,
        "supportsRestartFrame": false,
        "supportsTerminateRequest": true,
    })
}

fn empty_stack_trace() -> Value {
    json!({ "stackFrames": [], "totalFrames": 0 })
}

/// Readiness signals from the debuggee, consumed by the handshake task.
#[derive(Default)]
struct HandshakeSignals {
    first_output: Notify,
    initialize_acked: Notify,
}

pub struct Session {
    config: SessionConfig,
    resolver: Arc<dyn WorkspaceResolver>,
    spawner: Arc<dyn DebuggeeSpawner>,
    state: watch::Sender<SessionState>,
    backend: Arc<BackendWriter>,
    correlations: Arc<CorrelationTable>,
    process: Option<ProcessHandle>,
    process_tx: mpsc::UnboundedSender<ProcessEvent>,
    process_rx: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    frontend: mpsc::UnboundedSender<OutgoingMessage>,
    signals: Arc<HandshakeSignals>,
    handshake: Option<JoinHandle<()>>,
    terminated_sent: bool,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        resolver: Arc<dyn WorkspaceResolver>,
        spawner: Arc<dyn DebuggeeSpawner>,
        frontend: mpsc::UnboundedSender<OutgoingMessage>,
    ) -> Self {
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            resolver,
            spawner,
            state,
            backend: Arc::new(BackendWriter::new()),
            correlations: CorrelationTable::new(),
            process: None,
            process_tx,
            process_rx: Some(process_rx),
            frontend,
            signals: Arc::new(HandshakeSignals::default()),
            handshake: None,
            terminated_sent: false,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions from outside the session task.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn pending_correlations(&self) -> usize {
        self.correlations.len()
    }

    /// Drive the session until the front end closes its stream, then shut down.
    pub async fn run<S>(mut self, mut requests: S)
    where
        S: Stream<Item = io::Result<Request>> + Unpin,
    {
        let Some(mut events) = self.process_rx.take() else {
            tracing::error!("Session event queue already taken");
            return;
        };

        loop {
            tokio::select! {
                request = requests.next() => match request {
                    Some(Ok(request)) => self.handle_request(request).await,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Front-end channel error");
                        break;
                    }
                    None => {
                        tracing::info!("Front end closed the session");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_process_event(event).await,
            }
        }

        self.shutdown(&mut events).await;
    }

    pub async fn handle_request(&mut self, request: Request) {
        tracing::info!(seq = request.seq, command = %request.command, "Handling request");
        match request.command.as_str() {
            "initialize" => self.initialize(&request),
            "launch" => self.launch(&request).await,
            "disconnect" | "terminate" => self.disconnect(&request).await,
            "setBreakpoints" => self.set_breakpoints(&request).await,
            "continue" | "next" | "stepIn" | "stepOut" | "pause" | "configurationDone" => {
                self.forward(&request.command, json!({})).await;
                self.respond(Response::success(&request, None));
            }
            "stackTrace" => self.stack_trace(&request).await,
            "threads" => self.respond(Response::success(
                &request,
                Some(json!({ "threads": [{ "id": THREAD_ID, "name": THREAD_NAME }] })),
            )),
            other => {
                tracing::warn!(command = %other, "Unsupported request");
                self.respond(Response::error(
                    &request,
                    1014,
                    format!("unsupported request '{other}'"),
                ));
            }
        }
    }

    pub async fn handle_process_event(&mut self, event: ProcessEvent) {
        match event {
            ProcessEvent::Message(msg) => {
                self.signals.first_output.notify_one();
                self.handle_backend_message(msg);
            }
            ProcessEvent::Malformed { line, .. } => {
                tracing::debug!(%line, "Dropped malformed debuggee record");
            }
            ProcessEvent::Exited(info) => self.on_process_exit(info).await,
        }
    }

    fn initialize(&mut self, request: &Request) {
        self.respond(Response::success(request, Some(capabilities())));
        if self.state() == SessionState::Idle {
            self.set_state(SessionState::Initializing);
        } else {
            tracing::warn!(state = self.state().as_str(), "initialize outside Idle state");
        }
        self.emit(Event::initialized());
        tracing::debug!("Sent initialize response and initialized event");
    }

    async fn launch(&mut self, request: &Request) {
        match self.try_launch(request).await {
            Ok(program) => {
                self.respond(Response::success(request, None));
                self.set_state(SessionState::Running);
                self.spawn_handshake(program);
            }
            Err(e) => {
                tracing::error!(error = %e, code = e.code(), "Launch failed");
                self.respond(Response::error(request, e.code(), e.to_string()));
            }
        }
    }

    async fn try_launch(&mut self, request: &Request) -> Result<String, SessionError> {
        match self.state() {
            SessionState::Launching | SessionState::Running => {
                return Err(SessionError::AlreadyLaunched);
            }
            SessionState::Terminating | SessionState::Terminated => {
                return Err(SessionError::Terminated);
            }
            SessionState::Idle | SessionState::Initializing => {}
        }

        let program = request
            .arguments
            .get("program")
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty())
            .ok_or(SessionError::MissingProgram)?
            .to_string();
        let root = self
            .resolver
            .resolve(Path::new(&program))
            .ok_or(SessionError::NoWorkspace)?;

        let spec = LaunchSpec {
            executable: root.join(&self.config.executable_name),
            args: vec![
                self.config.debug_server_flag.clone().into(),
                program.clone().into(),
            ],
            cwd: root,
        };

        let previous = self.state();
        self.set_state(SessionState::Launching);
        let started = process::start(
            self.spawner.as_ref(),
            &spec,
            self.config.terminate_grace,
            self.process_tx.clone(),
        );
        match started {
            Ok((handle, stdin)) => {
                self.backend.attach(stdin).await;
                self.process = Some(handle);
                Ok(program)
            }
            Err(e) => {
                self.set_state(previous);
                Err(e.into())
            }
        }
    }

    /// Send `initialize` then `launch` to the debuggee once it is ready.
    ///
    /// The debuggee has no explicit ready message, so the settle and launch
    /// delays are upper bounds: any output (or the `initialize` reply) ends
    /// the corresponding wait early.
    fn spawn_handshake(&mut self, program: String) {
        let backend = Arc::clone(&self.backend);
        let signals = Arc::clone(&self.signals);
        let settle_delay = self.config.settle_delay;
        let launch_delay = self.config.launch_delay;

        self.handshake = Some(tokio::spawn(async move {
            tokio::select! {
                _ = signals.first_output.notified() => tracing::debug!("Debuggee produced output - starting handshake"),
                _ = tokio::time::sleep(settle_delay) => tracing::debug!(?settle_delay, "Settle delay elapsed - starting handshake"),
            }
            if let Err(e) = backend.send("initialize", json!({})).await {
                tracing::warn!(error = %e, "Failed to send initialize to debuggee");
                return;
            }

            tokio::select! {
                _ = signals.initialize_acked.notified() => {}
                _ = tokio::time::sleep(launch_delay) => {}
            }
            if let Err(e) = backend.send("launch", json!({ "program": program })).await {
                tracing::warn!(error = %e, "Failed to send launch to debuggee");
            }
        }));
    }

    async fn disconnect(&mut self, request: &Request) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if self.state() != SessionState::Terminated {
            self.set_state(SessionState::Terminating);
        }
        if let Some(process) = &self.process {
            process.terminate();
        }
        self.backend.detach().await;
        self.correlations.drain();

        self.respond(Response::success(request, None));
        self.set_state(SessionState::Terminated);
        self.send_terminated();
    }

    async fn set_breakpoints(&mut self, request: &Request) {
        let args = &request.arguments;
        let path = args.pointer("/source/path").cloned().unwrap_or(Value::Null);
        let requested: Vec<Value> = args
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        // One entry per requested breakpoint; clients match the reply by index.
        let lines: Vec<Value> = requested
            .iter()
            .map(|bp| bp.get("line").cloned().unwrap_or(Value::Null))
            .collect();
        tracing::debug!(?path, ?lines, "Setting breakpoints");

        self.forward("setBreakpoints", json!({ "path": path, "lines": lines }))
            .await;

        let breakpoints: Vec<Value> = requested
            .iter()
            .map(|bp| match bp.get("line") {
                Some(line) => json!({ "verified": true, "line": line }),
                None => json!({ "verified": true }),
            })
            .collect();
        self.respond(Response::success(
            request,
            Some(json!({ "breakpoints": breakpoints })),
        ));
    }

    async fn stack_trace(&mut self, request: &Request) {
        let args = &request.arguments;
        let thread_id = args.get("threadId").cloned().unwrap_or(json!(THREAD_ID));
        let start_frame = args.get("startFrame").and_then(Value::as_u64).unwrap_or(0);
        let levels = args
            .get("levels")
            .and_then(Value::as_u64)
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_STACK_LEVELS);
        let backend_args = json!({
            "threadId": thread_id,
            "startFrame": start_frame,
            "levels": levels,
        });

        let seq = match self.backend.send("stackTrace", backend_args).await {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot forward stackTrace - answering with no frames");
                self.respond(Response::success(request, Some(empty_stack_trace())));
                return;
            }
        };

        let (tx, rx) = oneshot::channel();
        self.correlations.register(
            seq,
            "stackTrace",
            tx,
            empty_stack_trace(),
            self.config.stack_trace_timeout,
        );

        let frontend = self.frontend.clone();
        let request_seq = request.seq;
        tokio::spawn(async move {
            let body = match rx.await {
                Ok(body) if body.is_object() => body,
                Ok(_) | Err(_) => empty_stack_trace(),
            };
            let response = Response::for_request(request_seq, "stackTrace", Some(body));
            if frontend.send(response.into()).is_err() {
                tracing::debug!(request_seq, "Front end gone before stackTrace response");
            }
        });
    }

    fn handle_backend_message(&mut self, msg: IncomingMessage) {
        match msg {
            IncomingMessage::Event { event, body } => self.handle_backend_event(&event, &body),
            IncomingMessage::Response {
                command,
                body,
                request_seq,
                success,
                ..
            } => {
                if command == "initialize" {
                    self.signals.initialize_acked.notify_one();
                }
                // A debuggee that numbers its own replies still matches by command.
                let resolved = match request_seq {
                    Some(seq) => {
                        self.correlations.resolve(seq, body.clone())
                            || self.correlations.resolve_command(&command, body)
                    }
                    None => self.correlations.resolve_command(&command, body),
                };
                if resolved {
                    tracing::debug!(%command, ?request_seq, "Forwarded debuggee response");
                } else {
                    tracing::debug!(%command, ?request_seq, success, "Dropping unmatched debuggee response");
                }
            }
        }
    }

    fn handle_backend_event(&mut self, event: &str, body: &Value) {
        tracing::debug!(%event, "Forwarding event to front end");
        match event {
            "stopped" => {
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(DEFAULT_STOP_REASON);
                let thread_id = body
                    .get("threadId")
                    .and_then(Value::as_i64)
                    .filter(|t| *t != 0)
                    .unwrap_or(THREAD_ID);
                self.emit(Event::stopped(reason, thread_id));
            }
            "terminated" => {
                self.set_state(SessionState::Terminated);
                self.send_terminated();
            }
            "output" => {
                let output = body.get("output").and_then(Value::as_str).unwrap_or_default();
                let category = body
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_OUTPUT_CATEGORY);
                self.emit(Event::output(output, category));
            }
            other => tracing::info!(event = %other, "Unhandled debuggee event"),
        }
    }

    async fn on_process_exit(&mut self, info: ExitInfo) {
        tracing::info!(code = ?info.code, signal = ?info.signal, "Debuggee process ended");
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        self.backend.detach().await;
        self.correlations.drain();

        if !self.terminated_sent
            && let Some(code) = info.code
        {
            self.emit(Event::exited(code));
        }
        self.set_state(SessionState::Terminated);
        self.send_terminated();
    }

    /// Stop the debuggee (if any) and wait for its exit notification.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<ProcessEvent>) {
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        self.backend.detach().await;
        self.correlations.drain();

        let Some(process) = self.process.as_ref().filter(|p| !p.has_exited()) else {
            return;
        };
        process.terminate();
        let wait_for_exit = async {
            while let Some(event) = events.recv().await {
                if matches!(event, ProcessEvent::Exited(_)) {
                    return;
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, wait_for_exit)
            .await
            .is_err()
        {
            tracing::warn!(pid = ?process.pid(), "Debuggee did not exit during shutdown");
        }
    }

    async fn forward(&self, command: &str, arguments: Value) {
        if let Err(e) = self.backend.send(command, arguments).await {
            tracing::warn!(%command, error = %e, "Cannot send to debuggee");
        }
    }

    fn set_state(&mut self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = previous.as_str(), to = next.as_str(), "Session state changed");
        }
    }

    /// Emit the termination notification; later calls are no-ops.
    fn send_terminated(&mut self) {
        if self.terminated_sent {
            return;
        }
        self.terminated_sent = true;
        self.emit(Event::terminated());
    }

    fn respond(&self, response: Response) {
        if self.frontend.send(response.into()).is_err() {
            tracing::debug!("Front end gone - dropping response");
        }
    }

    fn emit(&self, event: Event) {
        if self.frontend.send(event.into()).is_err() {
            tracing::debug!("Front end gone - dropping event");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::process::Command;

    use crate::workspace::WorkspaceRoots;

    /// Records launch specs, then runs `sh -c <script>` in a temp dir.
    struct ScriptSpawner {
        script: String,
        launched: Mutex<Vec<LaunchSpec>>,
    }

    impl ScriptSpawner {
        fn new(script: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                script: script.into(),
                launched: Mutex::new(Vec::new()),
            })
        }

        fn launched(&self) -> Vec<LaunchSpec> {
            self.launched.lock().unwrap().clone()
        }
    }

    impl DebuggeeSpawner for ScriptSpawner {
        fn command(&self, spec: &LaunchSpec) -> Command {
            self.launched.lock().unwrap().push(spec.clone());
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(&self.script)
                .current_dir(std::env::temp_dir());
            command
        }
    }

    const SILENT: &str = "cat > /dev/null";
    const STACK_REPLY_OWN_SEQ: &str = r#"while IFS= read -r line; do
  case "$line" in
    *'"command":"stackTrace"'*) printf '%s\n' '{"type":"response","command":"stackTrace","request_seq":0,"body":{"stackFrames":[{"id":1,"name":"main","line":7,"column":1}],"totalFrames":1}}' ;;
  esac
done"#;
    const STACK_REPLY: &str = r#"while IFS= read -r line; do
  case "$line" in
    *'"command":"stackTrace"'*) printf '%s\n' '{"type":"response","command":"stackTrace","body":{"stackFrames":[{"id":1,"name":"main","line":3,"column":1}],"totalFrames":1}}' ;;
  esac
done"#;

    fn test_config() -> SessionConfig {
        SessionConfig::new()
            .with_settle_delay(Duration::from_millis(20))
            .with_launch_delay(Duration::from_millis(10))
            .with_stack_trace_timeout(Duration::from_millis(200))
            .with_terminate_grace(Duration::from_millis(500))
            .with_shutdown_grace(Duration::from_secs(2))
    }

    fn ws_roots() -> Arc<WorkspaceRoots> {
        Arc::new(WorkspaceRoots::new([PathBuf::from("/ws")]))
    }

    /// A session running on its own task, driven like a front end would.
    struct Harness {
        requests: futures::channel::mpsc::UnboundedSender<io::Result<Request>>,
        responses: mpsc::UnboundedReceiver<OutgoingMessage>,
        state: watch::Receiver<SessionState>,
        task: JoinHandle<()>,
        next_seq: u64,
    }

    impl Harness {
        fn start(
            config: SessionConfig,
            resolver: Arc<dyn WorkspaceResolver>,
            spawner: Arc<dyn DebuggeeSpawner>,
        ) -> Self {
            let (frontend, responses) = mpsc::unbounded_channel();
            let session = Session::new(config, resolver, spawner, frontend);
            let state = session.subscribe_state();
            let (requests, stream) = futures::channel::mpsc::unbounded();
            let task = tokio::spawn(session.run(stream));
            Self {
                requests,
                responses,
                state,
                task,
                next_seq: 1,
            }
        }

        fn request(&mut self, command: &str, arguments: Value) -> u64 {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.requests
                .unbounded_send(Ok(Request::new(seq, command, arguments)))
                .unwrap();
            seq
        }

        async fn next(&mut self) -> OutgoingMessage {
            tokio::time::timeout(Duration::from_secs(5), self.responses.recv())
                .await
                .expect("timed out waiting for front-end message")
                .expect("front-end channel closed")
        }

        async fn response(&mut self) -> Response {
            match self.next().await {
                OutgoingMessage::Response(r) => r,
                other => panic!("expected response, got {other:?}"),
            }
        }

        async fn event(&mut self) -> Event {
            match self.next().await {
                OutgoingMessage::Event(e) => e,
                other => panic!("expected event, got {other:?}"),
            }
        }

        async fn expect_quiet(&mut self, window: Duration) {
            if let Ok(Some(msg)) = tokio::time::timeout(window, self.responses.recv()).await {
                panic!("unexpected front-end message: {msg:?}");
            }
        }

        fn state(&self) -> SessionState {
            *self.state.borrow()
        }

        async fn wait_for_state(&mut self, wanted: SessionState) {
            tokio::time::timeout(Duration::from_secs(5), self.state.wait_for(|s| *s == wanted))
                .await
                .expect("timed out waiting for state")
                .expect("session dropped");
        }

        async fn close(self) {
            drop(self.requests);
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .expect("session did not shut down")
                .unwrap();
        }
    }

    async fn launched_harness(script: &str) -> (Harness, Arc<ScriptSpawner>) {
        let spawner = ScriptSpawner::new(script);
        let mut h = Harness::start(test_config(), ws_roots(), spawner.clone());
        h.request("launch", json!({ "program": "/ws/main.etch" }));
        let ack = h.response().await;
        assert!(ack.success, "{ack:?}");
        (h, spawner)
    }

    fn manual_session() -> (Session, mpsc::UnboundedReceiver<OutgoingMessage>) {
        let (frontend, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            test_config(),
            ws_roots(),
            ScriptSpawner::new(SILENT),
            frontend,
        );
        (session, rx)
    }

    fn backend_event(raw: &str) -> ProcessEvent {
        ProcessEvent::Message(serde_json::from_str(raw).unwrap())
    }

    #[tokio::test]
    async fn initialize_declares_capabilities() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        let seq = h.request("initialize", json!({ "adapterID": "etch" }));

        let response = h.response().await;
        assert!(response.success);
        assert_eq!(response.request_seq, seq);
        insta::assert_json_snapshot!(response.body, @r#"
        {
          "supportsBreakpointLocationsRequest": false,
          "supportsConfigurationDoneRequest": true,
          "supportsRestartFrame": false,
          "supportsStepBack": false,
          "supportsTerminateRequest": true
        }
        "#);
        assert_eq!(h.event().await.event, "initialized");
        assert_eq!(h.state(), SessionState::Initializing);
        h.close().await;
    }

    #[tokio::test]
    async fn launch_spawns_etch_from_workspace_root() {
        let (mut h, spawner) = launched_harness(SILENT).await;
        assert_eq!(h.state(), SessionState::Running);

        let launched = spawner.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].executable, PathBuf::from("/ws/etch"));
        assert_eq!(launched[0].args, vec!["--debug-server", "/ws/main.etch"]);
        assert_eq!(launched[0].cwd, PathBuf::from("/ws"));

        h.request("disconnect", json!({}));
        assert!(h.response().await.success);
        assert_eq!(h.event().await.event, "terminated");
        h.close().await;
    }

    #[tokio::test]
    async fn launch_falls_back_to_first_root() {
        let spawner = ScriptSpawner::new(SILENT);
        let roots = Arc::new(WorkspaceRoots::new([PathBuf::from("/first"), PathBuf::from("/second")]));
        let mut h = Harness::start(test_config(), roots, spawner.clone());
        h.request("launch", json!({ "program": "/elsewhere/main.etch" }));
        assert!(h.response().await.success);
        assert_eq!(spawner.launched()[0].executable, PathBuf::from("/first/etch"));
        h.close().await;
    }

    #[tokio::test]
    async fn launch_without_workspace_is_configuration_error() {
        let spawner = ScriptSpawner::new(SILENT);
        let mut h = Harness::start(test_config(), Arc::new(WorkspaceRoots::default()), spawner.clone());
        h.request("launch", json!({ "program": "/ws/main.etch" }));

        let response = h.response().await;
        assert!(!response.success);
        assert_eq!(response.body.unwrap()["error"]["id"], 2001);
        assert_eq!(response.message.as_deref(), Some("No workspace folder found"));
        assert_eq!(h.state(), SessionState::Idle);
        assert!(spawner.launched().is_empty());
        h.close().await;
    }

    #[tokio::test]
    async fn launch_with_missing_executable_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let roots = Arc::new(WorkspaceRoots::new([dir.path().to_path_buf()]));
        let mut h = Harness::start(test_config(), roots, Arc::new(process::ExecSpawner));
        h.request("initialize", json!({}));
        h.response().await;
        h.event().await;

        let program = dir.path().join("main.etch");
        h.request("launch", json!({ "program": program }));
        let response = h.response().await;
        assert!(!response.success);
        assert_eq!(response.body.unwrap()["error"]["id"], 2002);
        assert_eq!(h.state(), SessionState::Initializing);
        h.close().await;
    }

    #[tokio::test]
    async fn handshake_and_commands_use_increasing_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("requests.log");
        let script = format!(
            r#"while IFS= read -r line; do printf '%s\n' "$line" >> '{}'; done"#,
            log.display()
        );
        let (mut h, _spawner) = launched_harness(&script).await;

        let read_log = || -> Vec<Value> {
            std::fs::read_to_string(&log)
                .unwrap_or_default()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        };
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while read_log().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "handshake never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.request("continue", Value::Null);
        assert!(h.response().await.success);
        h.request("next", Value::Null);
        assert!(h.response().await.success);

        while read_log().len() < 4 {
            assert!(tokio::time::Instant::now() < deadline, "commands never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let requests = read_log();
        let commands: Vec<&str> = requests.iter().map(|r| r["command"].as_str().unwrap()).collect();
        assert_eq!(commands, ["initialize", "launch", "continue", "next"]);
        assert_eq!(requests[1]["arguments"], json!({ "program": "/ws/main.etch" }));
        let seqs: Vec<u64> = requests.iter().map(|r| r["seq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, [1, 2, 3, 4]);
        h.close().await;
    }

    #[tokio::test]
    async fn set_breakpoints_reports_all_verified() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        h.request(
            "setBreakpoints",
            json!({
                "source": { "path": "/ws/main.etch" },
                "breakpoints": [{ "line": 10 }, { "line": 20 }],
            }),
        );
        let response = h.response().await;
        assert!(response.success);
        assert_eq!(
            response.body,
            Some(json!({
                "breakpoints": [
                    { "verified": true, "line": 10 },
                    { "verified": true, "line": 20 },
                ]
            }))
        );
        h.close().await;
    }

    #[tokio::test]
    async fn set_breakpoints_answers_every_requested_entry() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        h.request(
            "setBreakpoints",
            json!({
                "source": { "path": "/ws/main.etch" },
                "breakpoints": [{ "line": 10 }, { "column": 3 }, { "line": 20 }],
            }),
        );
        let response = h.response().await;
        insta::assert_json_snapshot!(response.body, @r#"
        {
          "breakpoints": [
            {
              "line": 10,
              "verified": true
            },
            {
              "verified": true
            },
            {
              "line": 20,
              "verified": true
            }
          ]
        }
        "#);
        h.close().await;
    }

    #[tokio::test]
    async fn threads_is_synthetic() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        h.request("threads", Value::Null);
        let response = h.response().await;
        assert_eq!(
            response.body,
            Some(json!({ "threads": [{ "id": 1, "name": "Main Thread" }] }))
        );
        h.close().await;
    }

    #[tokio::test]
    async fn unsupported_request_is_rejected() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        h.request("evaluate", json!({ "expression": "x" }));
        let response = h.response().await;
        assert!(!response.success);
        assert_eq!(response.command, "evaluate");
        h.close().await;
    }

    #[tokio::test]
    async fn stack_trace_is_answered_by_debuggee() {
        let (mut h, _spawner) = launched_harness(STACK_REPLY).await;
        let seq = h.request("stackTrace", json!({ "threadId": 1 }));

        let response = h.response().await;
        assert_eq!(response.request_seq, seq);
        assert_eq!(response.command, "stackTrace");
        let body = response.body.unwrap();
        assert_eq!(body["totalFrames"], 1);
        assert_eq!(body["stackFrames"][0]["name"], "main");

        // The cancelled timeout must not produce a second response.
        h.expect_quiet(Duration::from_millis(400)).await;
        h.close().await;
    }

    #[tokio::test]
    async fn stack_trace_matches_by_command_when_request_seq_is_foreign() {
        let (mut h, _spawner) = launched_harness(STACK_REPLY_OWN_SEQ).await;
        let started = tokio::time::Instant::now();
        let seq = h.request("stackTrace", json!({ "threadId": 1 }));

        let response = h.response().await;
        assert!(started.elapsed() < Duration::from_millis(200), "answered by timeout");
        assert_eq!(response.request_seq, seq);
        let body = response.body.unwrap();
        assert_eq!(body["totalFrames"], 1);
        assert_eq!(body["stackFrames"][0]["line"], 7);

        h.expect_quiet(Duration::from_millis(400)).await;
        h.close().await;
    }

    #[tokio::test]
    async fn stack_trace_times_out_with_empty_frames_once() {
        let (mut h, _spawner) = launched_harness(SILENT).await;
        let started = tokio::time::Instant::now();
        let seq = h.request("stackTrace", json!({ "threadId": 1, "levels": 5 }));

        let response = h.response().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(response.request_seq, seq);
        assert!(response.success);
        assert_eq!(response.body, Some(json!({ "stackFrames": [], "totalFrames": 0 })));

        h.expect_quiet(Duration::from_millis(400)).await;
        h.close().await;
    }

    #[tokio::test]
    async fn stack_trace_without_debuggee_answers_immediately() {
        let mut h = Harness::start(test_config(), ws_roots(), ScriptSpawner::new(SILENT));
        h.request("stackTrace", json!({ "threadId": 1 }));
        let response = h.response().await;
        assert_eq!(response.body, Some(json!({ "stackFrames": [], "totalFrames": 0 })));
        h.close().await;
    }

    #[tokio::test]
    async fn stopped_event_defaults_reason_and_thread() {
        let (mut session, mut rx) = manual_session();
        session
            .handle_process_event(backend_event(r#"{"type":"event","event":"stopped","body":{}}"#))
            .await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.as_event(), Some(&Event::stopped("pause", 1)));

        session
            .handle_process_event(backend_event(
                r#"{"type":"event","event":"stopped","body":{"reason":"breakpoint","threadId":4}}"#,
            ))
            .await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.as_event(), Some(&Event::stopped("breakpoint", 4)));
    }

    #[tokio::test]
    async fn output_event_is_forwarded_and_unknown_events_dropped() {
        let (mut session, mut rx) = manual_session();
        session
            .handle_process_event(backend_event(
                r#"{"type":"event","event":"output","body":{"output":"hello\n","category":"stdout"}}"#,
            ))
            .await;
        assert_eq!(
            rx.try_recv().unwrap().as_event(),
            Some(&Event::output("hello\n", "stdout"))
        );

        session
            .handle_process_event(backend_event(
                r#"{"type":"event","event":"breakpointValidated","body":{"line":3}}"#,
            ))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unmatched_response_is_dropped() {
        let (mut session, mut rx) = manual_session();
        session
            .handle_process_event(backend_event(
                r#"{"type":"response","command":"stackTrace","body":{"stackFrames":[],"totalFrames":0}}"#,
            ))
            .await;
        session
            .handle_process_event(ProcessEvent::Malformed {
                line: "{oops".to_string(),
                error: "EOF".to_string(),
            })
            .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.pending_correlations(), 0);
    }

    #[tokio::test]
    async fn debuggee_terminated_event_ends_session_once() {
        let (mut session, mut rx) = manual_session();
        let terminated = r#"{"type":"event","event":"terminated"}"#;
        session.handle_process_event(backend_event(terminated)).await;
        session.handle_process_event(backend_event(terminated)).await;
        session
            .handle_process_event(ProcessEvent::Exited(ExitInfo {
                code: Some(0),
                signal: None,
            }))
            .await;

        assert_eq!(rx.try_recv().unwrap().as_event(), Some(&Event::terminated()));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn debuggee_exit_emits_single_termination() {
        let (mut h, _spawner) = launched_harness("exit 1").await;

        assert_eq!(h.event().await, Event::exited(1));
        assert_eq!(h.event().await, Event::terminated());
        h.wait_for_state(SessionState::Terminated).await;

        h.expect_quiet(Duration::from_millis(200)).await;
        h.close().await;
    }

    #[tokio::test]
    async fn disconnect_then_commands_never_respawn() {
        let (mut h, spawner) = launched_harness(SILENT).await;

        h.request("disconnect", json!({ "terminateDebuggee": true }));
        assert!(h.response().await.success);
        assert_eq!(h.event().await, Event::terminated());
        assert_eq!(h.state(), SessionState::Terminated);

        h.request("launch", json!({ "program": "/ws/main.etch" }));
        let relaunch = h.response().await;
        assert!(!relaunch.success);
        assert_eq!(relaunch.body.unwrap()["error"]["id"], 2004);

        h.request("continue", Value::Null);
        assert!(h.response().await.success);
        h.request("terminate", Value::Null);
        assert!(h.response().await.success);
        h.request("disconnect", Value::Null);
        assert!(h.response().await.success);

        // Exit of the killed debuggee must not repeat the termination notice.
        h.expect_quiet(Duration::from_millis(300)).await;
        assert_eq!(spawner.launched().len(), 1);
        h.close().await;
    }

    #[tokio::test]
    async fn closing_front_end_kills_live_debuggee() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("debuggee.pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pidfile.display());
        let (h, _spawner) = launched_harness(&script).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let pid = loop {
            if let Ok(raw) = std::fs::read_to_string(&pidfile)
                && let Ok(pid) = raw.trim().parse::<i32>()
            {
                break pid;
            }
            assert!(tokio::time::Instant::now() < deadline, "debuggee never wrote its pid");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert!(kill(Pid::from_raw(pid), None).is_ok(), "debuggee should be running");

        h.close().await;
        assert!(
            kill(Pid::from_raw(pid), None).is_err(),
            "debuggee {pid} outlived the session"
        );
    }

    #[tokio::test]
    async fn second_launch_is_rejected_while_running() {
        let (mut h, spawner) = launched_harness(SILENT).await;
        h.request("launch", json!({ "program": "/ws/main.etch" }));
        let response = h.response().await;
        assert!(!response.success);
        assert_eq!(response.body.unwrap()["error"]["id"], 2004);
        assert_eq!(spawner.launched().len(), 1);
        h.close().await;
    }

    #[test]
    fn error_codes_are_distinct_per_failure_kind() {
        assert_eq!(SessionError::NoWorkspace.code(), 2001);
        assert_eq!(
            SessionError::Launch(LaunchError::NotFound {
                path: PathBuf::from("/ws/etch")
            })
            .code(),
            2002
        );
        assert_eq!(SessionError::Launch(LaunchError::Pipe("stdin")).code(), 2003);
        assert_eq!(SessionError::Terminated.code(), 2004);
    }
}
