//! Server handle: owns a child process and drives the LSP lifecycle.
//!
//! A [`RunningServer`] is split in two:
//!
//! - [`Connection`] holds everything callers and the background tasks
//!   touch: the writer queue, the pending-request table and the diagnostics
//!   slot. It is built from any reader/writer pair so the request/response
//!   machinery runs over in-memory pipes in tests.
//! - [`RunningServer`] adds the child process and the launch descriptor.
//!
//! Requests and pushes never share a structure: responses are routed
//! through a table of oneshot senders keyed by id, while
//! `publishDiagnostics` pushes overwrite a single `watch` slot.
//!
//! Only the writer task touches stdin. An analyzer that stops reading
//! stalls that task and nothing else: callers give up at their deadline and
//! the read loop keeps draining stdout.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter, encode_message};
use crate::discovery::SearchPath;
use crate::error::LspError;
use crate::protocol::{
    self, ErrorResponse, Incoming, IncomingMessage, Notification, PublishDiagnosticsParams,
    Request, RpcResponse,
};
use crate::types::{Diagnostic, LspTimeouts, ServerDescriptor, ServerState};

/// How long a process gets to exit on its own after `exit`.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Document version sent with every `didOpen`. Each check is a fresh open.
const DOCUMENT_VERSION: i32 = 1;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Longest a notification waits for room in a full writer queue.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);

enum WriterCommand {
    /// One encoded frame.
    Send(Vec<u8>),
    /// Close stdin.
    Shutdown,
}

// Environment variable denylist patterns
const ENV_SECRET_DENYLIST: [&str; 15] = [
    "*_KEY",
    "*_TOKEN",
    "*_SECRET",
    "*_PASSWORD",
    "*_CREDENTIAL*",
    "*_API_*",
    "AWS_*",
    "ANTHROPIC_*",
    "OPENAI_*",
    "GEMINI_*",
    "GOOGLE_*",
    "AZURE_*",
    "GH_*",
    "GITHUB_*",
    "NPM_*",
];

/// Minimal glob matcher for env var denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
/// Both pattern and key are compared in uppercase.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) => {
            let inner = &pat[1..pat.len() - 1];
            key_upper.contains(inner)
        }
        (true, false) => key_upper.ends_with(&pat[1..]),
        (false, true) => key_upper.starts_with(&pat[..pat.len() - 1]),
        (false, false) => key_upper == pat,
    }
}

fn is_secret_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| env_glob_matches(pat, &upper))
}

/// One batch of diagnostics pushed by the server.
#[derive(Debug)]
pub(crate) struct PublishedDiagnostics {
    uri: String,
    items: Vec<Diagnostic>,
}

type DiagnosticsSlot = Option<Arc<PublishedDiagnostics>>;
type PendingMap = Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>;

/// `Starting → Running → Stopped`, `Starting → Stopped`. Nothing leaves
/// `Stopped`.
struct Lifecycle(AtomicU8);

impl Lifecycle {
    const STARTING: u8 = 0;
    const RUNNING: u8 = 1;
    const STOPPED: u8 = 2;

    fn new() -> Self {
        Self(AtomicU8::new(Self::STARTING))
    }

    fn state(&self) -> ServerState {
        match self.0.load(Ordering::SeqCst) {
            Self::STARTING => ServerState::Starting,
            Self::RUNNING => ServerState::Running,
            _ => ServerState::Stopped,
        }
    }

    fn mark_running(&self) -> bool {
        self.0
            .compare_exchange(
                Self::STARTING,
                Self::RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Returns `true` only for the call that performed the transition.
    fn mark_stopped(&self) -> bool {
        self.0.swap(Self::STOPPED, Ordering::SeqCst) != Self::STOPPED
    }

    fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst) == Self::STOPPED
    }
}

/// Transport and bookkeeping shared between callers and the background
/// tasks.
pub(crate) struct Connection {
    name: String,
    next_id: AtomicU64,
    pending: PendingMap,
    writer_tx: mpsc::Sender<WriterCommand>,
    diagnostics: watch::Receiver<DiagnosticsSlot>,
    lifecycle: Lifecycle,
    /// Set by the read loop on exit; waiters registered afterwards would
    /// never be released, so requests check it.
    closed: AtomicBool,
}

/// The reader and writer tasks of one connection.
pub(crate) struct ConnectionTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionTasks {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Connection {
    /// Create a connection writing to `writer` and reading from `reader`,
    /// and start both background tasks.
    pub fn spawn<R, W>(name: String, reader: R, writer: W) -> (Arc<Self>, ConnectionTasks)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let (diag_tx, diag_rx) = watch::channel(None);
        let writer = tokio::spawn(write_loop(
            FrameWriter::new(writer),
            writer_rx,
            name.clone(),
        ));
        let conn = Arc::new(Self {
            name,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer_tx,
            diagnostics: diag_rx,
            lifecycle: Lifecycle::new(),
            closed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_loop(FrameReader::new(reader), conn.clone(), diag_tx));
        (conn, ConnectionTasks { reader, writer })
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_not_stopped(&self) -> Result<(), LspError> {
        if self.lifecycle.is_stopped() {
            return Err(LspError::Stopped {
                server: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Send a request and wait up to `timeout` for its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, LspError> {
        self.ensure_not_stopped()?;
        self.request_unchecked(method, params, timeout).await
    }

    /// Fire-and-forget notification.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        self.ensure_not_stopped()?;
        self.notify_unchecked(method, params).await
    }

    /// Request without the stopped check. Only `stop` uses this directly,
    /// to send `shutdown` after the flag has flipped.
    ///
    /// `timeout` covers queueing the frame as well as the response.
    async fn request_unchecked(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_message(&Request::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.is_closed() {
            // The read loop already drained the table; nobody would answer.
            self.pending.lock().await.remove(&id);
            return Err(self.connection_closed());
        }

        let exchange = async {
            self.writer_tx
                .send(WriterCommand::Send(frame))
                .await
                .map_err(|_| self.connection_closed())?;
            // Sender dropped: the read loop released every waiter on exit.
            rx.await.map_err(|_| self.connection_closed())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response.into_result(method),
            Ok(Err(e)) => {
                self.pending.lock().await.remove(&id);
                Err(e)
            }
            Err(_) => {
                // A response arriving after this finds no waiter and is dropped.
                self.pending.lock().await.remove(&id);
                Err(LspError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn notify_unchecked(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), LspError> {
        let frame = encode_message(&Notification::new(method, params))?;
        match self
            .writer_tx
            .send_timeout(WriterCommand::Send(frame), ENQUEUE_TIMEOUT)
            .await
        {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(LspError::Timeout {
                method: method.to_string(),
                after: ENQUEUE_TIMEOUT,
            }),
            Err(SendTimeoutError::Closed(_)) => Err(self.connection_closed()),
        }
    }

    /// Ask the writer task to close stdin once the queue ahead is written.
    fn close_writer(&self) {
        let _ = self.writer_tx.try_send(WriterCommand::Shutdown);
    }

    /// Open `uri`, wait up to `wait` for its diagnostics, then close it.
    ///
    /// Silence within `wait` is a clean file, not an error. The connection
    /// closing during the wait is an error.
    pub async fn check_document(
        &self,
        uri: &url::Url,
        language_id: &str,
        text: &str,
        wait: Duration,
    ) -> Result<Vec<Diagnostic>, LspError> {
        self.ensure_not_stopped()?;

        // A fresh receiver marked up to date: anything already in the slot
        // is stale.
        let mut updates = self.diagnostics.clone();
        updates.borrow_and_update();

        self.send_notification(
            protocol::DID_OPEN,
            Some(protocol::did_open_params(
                uri.as_str(),
                language_id,
                DOCUMENT_VERSION,
                text,
            )),
        )
        .await?;

        let outcome = tokio::time::timeout(wait, wait_for_document(&mut updates, uri)).await;

        if let Err(e) = self
            .send_notification(
                protocol::DID_CLOSE,
                Some(protocol::did_close_params(uri.as_str())),
            )
            .await
        {
            tracing::debug!("LSP '{}': didClose for {uri} failed: {e}", self.name);
        }

        match outcome {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(_)) => Err(self.connection_closed()),
            Err(_) => {
                tracing::debug!(
                    "LSP '{}' published nothing for {uri} within {wait:?}",
                    self.name
                );
                Ok(Vec::new())
            }
        }
    }

    fn connection_closed(&self) -> LspError {
        LspError::ConnectionClosed {
            server: self.name.clone(),
        }
    }

    /// Queue a reply without waiting; a full queue drops it.
    fn queue_reply(&self, reply: &ErrorResponse) {
        let frame = match encode_message(reply) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("LSP '{}': failed to encode reply: {e}", self.name);
                return;
            }
        };
        if let Err(e) = self.writer_tx.try_send(WriterCommand::Send(frame)) {
            tracing::warn!("LSP '{}': dropping reply to server request: {e}", self.name);
        }
    }
}

/// Background task: the only writer of the server's stdin.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut commands: mpsc::Receiver<WriterCommand>,
    name: String,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.write_frame(&frame).await {
                    tracing::warn!("LSP write error for '{name}': {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    tracing::debug!("LSP '{name}' writer finished");
}

/// Wait for a push addressed to `uri`, skipping pushes for other documents.
async fn wait_for_document(
    updates: &mut watch::Receiver<DiagnosticsSlot>,
    uri: &url::Url,
) -> Result<Vec<Diagnostic>, watch::error::RecvError> {
    loop {
        updates.changed().await?;
        let batch = updates.borrow_and_update().clone();
        match batch {
            Some(batch) if protocol::same_document(&batch.uri, uri) => {
                return Ok(batch.items.clone());
            }
            Some(batch) => {
                tracing::trace!("Skipping diagnostics for {} while waiting on {uri}", batch.uri);
            }
            None => {}
        }
    }
}

/// Background task: decode frames until the stream ends or desyncs.
///
/// On exit the connection is marked closed and stopped, every pending
/// waiter is released, and dropping `diag_tx` wakes diagnostics waiters.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    conn: Arc<Connection>,
    diag_tx: watch::Sender<DiagnosticsSlot>,
) {
    let failure = loop {
        match reader.read_frame().await {
            Ok(Some(body)) => {
                if let Some(reply) = dispatch_frame(&body, &conn.pending, &diag_tx, &conn.name).await
                {
                    conn.queue_reply(&reply);
                }
            }
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };

    conn.closed.store(true, Ordering::SeqCst);
    let unexpected = conn.lifecycle.mark_stopped();
    match (&failure, unexpected) {
        (Some(e), true) => tracing::warn!("LSP reader error for '{}': {e}", conn.name),
        (None, true) => tracing::warn!("LSP server '{}' closed stdout", conn.name),
        (_, false) => tracing::debug!("LSP server '{}' reader finished", conn.name),
    }

    let released: Vec<_> = conn.pending.lock().await.drain().collect();
    if !released.is_empty() {
        tracing::debug!(
            "LSP '{}': releasing {} pending request(s)",
            conn.name,
            released.len()
        );
    }
    // Dropping the senders wakes every waiter with an error.
    drop(released);
    drop(diag_tx);
}

/// Route one frame body. Returns a reply to write back, if any.
async fn dispatch_frame(
    body: &[u8],
    pending: &PendingMap,
    diag_tx: &watch::Sender<DiagnosticsSlot>,
    server_name: &str,
) -> Option<ErrorResponse> {
    let message: IncomingMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Dropping undecodable message from '{server_name}': {e}");
            return None;
        }
    };

    let Some(incoming) = message.classify() else {
        tracing::trace!("Ignoring unroutable JSON-RPC message from '{server_name}'");
        return None;
    };

    match incoming {
        Incoming::Response { id, response } => {
            let sender = pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => tracing::debug!("LSP '{server_name}': dropping late response id={id}"),
            }
            None
        }
        Incoming::ServerRequest { id, method } => {
            // Servers block on workspace/configuration and friends until
            // answered.
            tracing::debug!("LSP '{server_name}' sent request: {method}, replying method not found");
            Some(ErrorResponse::method_not_found(id, &method))
        }
        Incoming::Notification { method, params } => {
            if method == protocol::PUBLISH_DIAGNOSTICS {
                publish(server_name, params, diag_tx);
            } else {
                tracing::trace!("Ignoring notification from '{server_name}': {method}");
            }
            None
        }
    }
}

fn publish(
    server_name: &str,
    params: Option<serde_json::Value>,
    diag_tx: &watch::Sender<DiagnosticsSlot>,
) {
    let Some(params) = params else { return };
    match serde_json::from_value::<PublishDiagnosticsParams>(params) {
        Ok(params) => {
            tracing::debug!(
                "LSP '{server_name}' published {} diagnostic(s) for {}",
                params.diagnostics.len(),
                params.uri
            );
            let batch = PublishedDiagnostics {
                uri: params.uri,
                items: params
                    .diagnostics
                    .into_iter()
                    .map(protocol::LspDiagnostic::into_diagnostic)
                    .collect(),
            };
            // Overwrites any undelivered batch.
            diag_tx.send_replace(Some(Arc::new(batch)));
        }
        Err(e) => {
            tracing::warn!("Failed to parse publishDiagnostics from '{server_name}': {e}");
        }
    }
}

/// One analyzer subprocess, handshaked and ready for documents.
pub(crate) struct RunningServer {
    descriptor: Arc<ServerDescriptor>,
    timeouts: LspTimeouts,
    conn: Arc<Connection>,
    /// Taken by the first `stop`.
    child: Mutex<Option<Child>>,
    tasks: ConnectionTasks,
}

impl RunningServer {
    /// Spawn the analyzer in `workspace_root` and complete the handshake.
    ///
    /// The child's `PATH` is `search`, so helpers the analyzer launches by
    /// bare name resolve the same way the analyzer itself did. On any
    /// failure the process is killed before returning.
    pub async fn start(
        descriptor: Arc<ServerDescriptor>,
        workspace_root: &Path,
        search: &SearchPath,
        timeouts: LspTimeouts,
    ) -> Result<Self, LspError> {
        let mut cmd = Command::new(descriptor.command());
        cmd.args(descriptor.args())
            .current_dir(workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(path) = search.env_value() {
            cmd.env("PATH", path);
        }
        for (key, _) in std::env::vars_os() {
            if let Some(name) = key.to_str()
                && is_secret_env(name)
            {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd.spawn().map_err(|source| LspError::Spawn {
            command: descriptor.command().display().to_string(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or(LspError::MissingPipe("stdout"))?;
        let stdin = child.stdin.take().ok_or(LspError::MissingPipe("stdin"))?;

        // The read loop runs before the first write so the initialize
        // response cannot be missed.
        let (conn, tasks) = Connection::spawn(descriptor.name().to_string(), stdout, stdin);

        let server = Self {
            descriptor,
            timeouts,
            conn,
            child: Mutex::new(Some(child)),
            tasks,
        };

        if let Err(e) = server.initialize(workspace_root).await {
            server.kill().await;
            return Err(LspError::Handshake {
                server: server.name().to_string(),
                source: Box::new(e),
            });
        }
        server.conn.lifecycle.mark_running();
        tracing::info!("LSP '{}' handshake complete", server.name());
        Ok(server)
    }

    async fn initialize(&self, workspace_root: &Path) -> Result<(), LspError> {
        let root_uri = protocol::path_to_file_uri(workspace_root)?;
        let params = protocol::initialize_params(root_uri.as_str());

        tracing::debug!("Sending initialize to '{}'", self.name());
        self.conn
            .send_request(protocol::INITIALIZE, Some(params), self.timeouts.request)
            .await?;
        self.conn
            .send_notification(protocol::INITIALIZED, Some(serde_json::json!({})))
            .await
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn state(&self) -> ServerState {
        self.conn.state()
    }

    /// Whether the instance can still take documents.
    pub fn is_alive(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// One open / diagnose / close cycle for an in-memory document.
    pub async fn check_file(&self, path: &Path, content: &str) -> Result<Vec<Diagnostic>, LspError> {
        let uri = protocol::path_to_file_uri(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        self.conn
            .check_document(
                &uri,
                protocol::language_id(extension),
                content,
                self.timeouts.diagnostics,
            )
            .await
    }

    /// Gracefully shut down the server. Idempotent.
    ///
    /// Sends `shutdown` then `exit` and waits for the process, all within
    /// the shutdown timeout plus a short exit grace. Kills it if any step
    /// fails or the bound runs out, including when stdin is stalled.
    pub async fn stop(&self) {
        let was_running = self.conn.lifecycle.mark_stopped();
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if was_running && !self.conn.is_closed() {
            let bound = self.timeouts.shutdown + EXIT_GRACE;
            match tokio::time::timeout(bound, self.exit_gracefully(&mut child)).await {
                Ok(Ok(())) => {
                    tracing::debug!("LSP '{}' exited cleanly", self.name());
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!("LSP '{}' shutdown failed ({e}), killing", self.name());
                }
                Err(_) => {
                    tracing::debug!("LSP '{}' didn't exit in time, killing", self.name());
                }
            }
        }

        terminate(self.name(), &mut child).await;
    }

    async fn exit_gracefully(&self, child: &mut Child) -> Result<(), LspError> {
        self.conn
            .request_unchecked(protocol::SHUTDOWN, None, self.timeouts.shutdown)
            .await?;
        self.conn.notify_unchecked(protocol::EXIT, None).await?;
        self.conn.close_writer();
        if let Err(e) = child.wait().await {
            tracing::debug!("LSP '{}': waiting for exit failed: {e}", self.name());
        }
        Ok(())
    }

    /// Kill without the graceful exchange. Used when the handshake fails.
    async fn kill(&self) {
        self.conn.lifecycle.mark_stopped();
        if let Some(mut child) = self.child.lock().await.take() {
            terminate(self.name(), &mut child).await;
        }
    }
}

async fn terminate(name: &str, child: &mut Child) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!("LSP '{name}' already exited: {status}");
        return;
    }
    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill LSP '{name}': {e}");
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        // The child itself is reaped by kill_on_drop.
        self.tasks.abort();
    }
}
