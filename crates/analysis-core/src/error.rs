use thiserror::Error;

/// Top-level error type for the core. Never crosses the `CompilerFacade`
/// boundary — facade methods log and swallow instead (§7 of the design doc).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("resolve: {0}")]
    Resolve(#[from] ResolveError),

    #[error("session build: {0}")]
    SessionBuild(#[from] SessionBuildError),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no build system found under {0}")]
    NoBuildSystem(String),

    #[error("build tool invocation failed: {0}")]
    BuildToolFailed(String),

    #[error("init-script record stream malformed: {0}")]
    MalformedRecord(String),

    #[error("unknown kmp target name: {0}")]
    UnknownTargetName(String),
}

#[derive(Debug, Error)]
pub enum SessionBuildError {
    #[error("backend refused to build session for platform {0:?}")]
    BackendRefused(String),

    #[error("no modules available to build a session from")]
    NoModules,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend not ready: {0}")]
    NotReady(String),

    #[error("backend crashed: {0}")]
    Crashed(String),

    #[error("backend response timeout after {0}ms")]
    Timeout(u64),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("zip open failed: {0}")]
    ZipOpen(String),

    #[error("inner entry {0} missing from archive")]
    MissingEntry(String),

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json-rpc: {0}")]
    InvalidJsonRpc(String),

    #[error("missing content-length header")]
    MissingContentLength,

    #[error("content-length mismatch: expected {expected}, got {actual}")]
    ContentLengthMismatch { expected: usize, actual: usize },

    #[error("json parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
