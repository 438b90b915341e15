//! The Analysis Backend collaborator (§1): an external process that parses
//! source and answers semantic queries. The core orchestrates it; it does
//! not re-implement a parser. `AnalysisBackend` is the seam — the facade
//! (`facade.rs`) is the only caller, and every call is funneled through the
//! single analysis worker (§5).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use crate::error::{BackendError, CoreError};
use crate::jsonrpc::{self, Request, Response};
use crate::model::Platform;

/// A fully-resolved set of inputs the backend needs to build one session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub platform: Platform,
    pub source_roots: Vec<PathBuf>,
    pub classpath: Vec<PathBuf>,
    pub jdk_home: Option<PathBuf>,
}

/// The language-neutral collaborator interface. Every method is a single
/// bounded-time round trip; callers (the facade) are responsible for
/// serializing calls through the analysis worker.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Build (or replace) the session for `spec.platform`.
    async fn build_session(&self, spec: SessionSpec) -> std::result::Result<(), CoreError>;

    /// Tear down every session. Idempotent.
    async fn dispose_all_sessions(&self) -> std::result::Result<(), CoreError>;

    /// Generic JSON-RPC call into the backend, used by the facade for every
    /// semantic query (`resolveAtPosition`, `getCompletions`, …). `params`
    /// and the returned `Value` are method-specific; the facade owns the
    /// shapes (§4.6).
    async fn request(&self, method: &str, params: Value) -> std::result::Result<Value, CoreError>;

    /// Best-effort notification; no response expected (buffer updates).
    async fn notify(&self, method: &str, params: Value);

    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SidecarState {
    Starting,
    Ready,
    Degraded,
    Restarting,
    Stopped,
}

struct PendingRequest {
    id: u64,
    response_tx: oneshot::Sender<std::result::Result<Value, CoreError>>,
}

/// Drives the Analysis Backend as a JVM subprocess talking Content-Length
/// framed JSON-RPC over stdio, generalized from a single-purpose LSP bridge
/// into the full `AnalysisBackend` surface.
pub struct ProcessBackend {
    state: Arc<Mutex<SidecarState>>,
    request_id: AtomicU64,
    pending: Arc<Mutex<Vec<PendingRequest>>>,
    request_tx: mpsc::Sender<Request>,
    shutdown_notify: Arc<Notify>,
    _child_guard: Arc<Mutex<Option<Child>>>,
}

impl ProcessBackend {
    /// Spawn the backend process and perform the initial handshake. `jvm_args`
    /// are opaque, per §6.4's `server.jvm-args`.
    pub async fn start(
        java_path: PathBuf,
        sidecar_jar: PathBuf,
        jvm_args: &[String],
    ) -> std::result::Result<Self, CoreError> {
        let mut command = Command::new(&java_path);
        command
            .args(jvm_args)
            .arg("-jar")
            .arg(&sidecar_jar)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            CoreError::Backend(BackendError::SpawnFailed(e.to_string()))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            CoreError::Backend(BackendError::SpawnFailed("no stdin".into()))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::Backend(BackendError::SpawnFailed("no stdout".into()))
        })?;

        let state = Arc::new(Mutex::new(SidecarState::Starting));
        let pending: Arc<Mutex<Vec<PendingRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let shutdown_notify = Arc::new(Notify::new());

        let (request_tx, mut request_rx) = mpsc::channel::<Request>(64);

        // writer task
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(req) = request_rx.recv().await {
                if jsonrpc::write_message(&mut stdin, &req).await.is_err() {
                    break;
                }
            }
        });

        // reader task
        let reader_pending = Arc::clone(&pending);
        let reader_state = Arc::clone(&state);
        let reader_shutdown = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            loop {
                tokio::select! {
                    result = jsonrpc::read_message(&mut reader) => {
                        match result {
                            Ok(value) => {
                                if let Ok(response) = serde_json::from_value::<Response>(value) {
                                    dispatch_response(&reader_pending, response).await;
                                }
                            }
                            Err(_) => {
                                *reader_state.lock().await = SidecarState::Degraded;
                                break;
                            }
                        }
                    }
                    _ = reader_shutdown.notified() => {
                        break;
                    }
                }
            }
        });

        let backend = ProcessBackend {
            state,
            request_id: AtomicU64::new(1),
            pending,
            request_tx,
            shutdown_notify,
            _child_guard: Arc::new(Mutex::new(Some(child))),
        };

        backend
            .request_with_timeout("initialize", json!({}), Duration::from_secs(30))
            .await?;
        *backend.state.lock().await = SidecarState::Ready;

        Ok(backend)
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> std::result::Result<Value, CoreError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .push(PendingRequest { id, response_tx: tx });

        let req = Request::new(id, method, params);
        self.request_tx
            .send(req)
            .await
            .map_err(|_| CoreError::Backend(BackendError::NotReady("writer closed".into())))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Backend(BackendError::Crashed(
                "response channel dropped".into(),
            ))),
            Err(_) => Err(CoreError::Backend(BackendError::Timeout(timeout.as_millis() as u64))),
        }
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        // Signal the reader task to stop, and kill the JVM directly in case
        // `shutdown()` was never called (crash, hang, protocol mismatch) —
        // `kill_on_drop` on the Command only fires once the `Child` itself
        // drops, which we want to force now rather than leave to chance.
        self.shutdown_notify.notify_waiters();
        if let Ok(mut guard) = self._child_guard.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

async fn dispatch_response(pending: &Arc<Mutex<Vec<PendingRequest>>>, response: Response) {
    let Some(id) = response.id else { return };
    let mut guard = pending.lock().await;
    if let Some(pos) = guard.iter().position(|p| p.id == id) {
        let entry = guard.remove(pos);
        let result = match (response.result, response.error) {
            (Some(value), _) => Ok(value),
            (None, Some(err)) => Err(CoreError::Backend(BackendError::MalformedResponse(
                err.message,
            ))),
            (None, None) => Ok(Value::Null),
        };
        let _ = entry.response_tx.send(result);
    }
}

#[async_trait]
impl AnalysisBackend for ProcessBackend {
    async fn build_session(&self, spec: SessionSpec) -> std::result::Result<(), CoreError> {
        let params = json!({
            "platform": spec.platform.as_str(),
            "sourceRoots": spec.source_roots,
            "classpath": spec.classpath,
            "jdkHome": spec.jdk_home,
        });
        self.request_with_timeout("buildSession", params, Duration::from_secs(60))
            .await?;
        Ok(())
    }

    async fn dispose_all_sessions(&self) -> std::result::Result<(), CoreError> {
        self.request_with_timeout("disposeAllSessions", json!({}), Duration::from_secs(30))
            .await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> std::result::Result<Value, CoreError> {
        self.request_with_timeout(method, params, Duration::from_secs(10))
            .await
    }

    async fn notify(&self, method: &str, params: Value) {
        let req = Request::notification(method, params);
        let _ = self.request_tx.send(req).await;
    }

    async fn shutdown(&self) {
        self.shutdown_notify.notify_waiters();
        let _ = self
            .request_with_timeout("shutdown", json!({}), Duration::from_secs(5))
            .await;
        *self.state.lock().await = SidecarState::Stopped;
    }
}

/// Locates a JDK for `java`, honoring an explicit override before falling
/// back to environment discovery (§6.4's `java.home`).
pub fn find_java(java_home_override: Option<&str>) -> Option<PathBuf> {
    if let Some(home) = java_home_override {
        let candidate = PathBuf::from(home).join("bin").join("java");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    if let Ok(home) = std::env::var("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join("java");
        if candidate.exists() {
            return Some(candidate);
        }
    }
    which_java()
}

fn which_java() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join("java"))
        .find(|candidate| candidate.exists())
}
