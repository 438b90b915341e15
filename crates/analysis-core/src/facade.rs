//! CompilerFacade (§4.6): the stable, language-neutral surface used by
//! feature providers. Every operation is strictly typed; no backend-specific
//! shape or `CoreError` ever crosses this boundary — failures are logged and
//! swallowed, returning an empty/null result (§7 "Propagation policy").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::AnalysisBackend;
use crate::buffer::BufferMirror;
use crate::cache::SymbolCache;
use crate::config::Config;
use crate::model::{Platform, ProjectModel};
use crate::resolver::resolve_project;
use crate::routing::{platform_name_for_file, route_for_path};
use crate::session::{build_sessions, Session};

// ---------------------------------------------------------------------------
// Semantic types (§3 "Semantic entities")
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymbolKind {
    Class,
    Interface,
    Object,
    Enum,
    EnumEntry,
    Function,
    Property,
    Constructor,
    TypeAlias,
    TypeParameter,
    Package,
    File,
    LocalVariable,
    Parameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub path: PathBuf,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub location: SourceLocation,
    pub containing_class: Option<String>,
    pub signature: Option<String>,
    pub fq_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub fq_name: String,
    pub short_name: String,
    pub nullable: bool,
    pub type_arguments: Vec<TypeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticInfo {
    pub severity: Severity,
    pub message: String,
    pub range: SourceRange,
    pub code: Option<String>,
    pub quick_fixes: Vec<QuickFix>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickFix {
    pub title: String,
    pub edits: Vec<FileEdit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: PathBuf,
    pub range: SourceRange,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionCandidate {
    pub label: String,
    pub kind: SymbolKind,
    pub detail: Option<String>,
    pub insert_text: String,
    pub is_deprecated: bool,
    pub sort_priority: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameContext {
    pub symbol: ResolvedSymbol,
    pub range: SourceRange,
}

// ---------------------------------------------------------------------------
// CompilerFacade trait (§4.6 operation table)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CompilerFacade: Send + Sync {
    async fn update_file_content(&self, path: &Path, text: String);
    async fn get_diagnostics(&self, path: &Path) -> Vec<DiagnosticInfo>;
    async fn resolve_at_position(&self, path: &Path, line: u32, col: u32) -> Option<ResolvedSymbol>;
    async fn get_type(&self, path: &Path, line: u32, col: u32) -> Option<TypeInfo>;
    async fn get_documentation(&self, symbol: &ResolvedSymbol) -> Option<String>;
    async fn get_file_symbols(&self, path: &Path) -> Vec<ResolvedSymbol>;
    async fn find_references(&self, symbol: &ResolvedSymbol) -> Vec<SourceLocation>;
    async fn find_implementations(&self, symbol: &ResolvedSymbol) -> Vec<SourceLocation>;
    async fn get_type_definition_location(&self, path: &Path, line: u32, col: u32) -> Option<SourceLocation>;
    async fn get_completions(&self, path: &Path, line: u32, col: u32) -> Vec<CompletionCandidate>;
    async fn prepare_rename(&self, path: &Path, line: u32, col: u32) -> Option<RenameContext>;
    async fn compute_rename(&self, ctx: &RenameContext, new_name: &str) -> Vec<FileEdit>;
    async fn find_expect_actual_counterparts(&self, path: &Path, line: u32, col: u32) -> Vec<ResolvedSymbol>;
    async fn platform_for_file(&self, path: &Path) -> Option<String>;
    async fn get_available_targets(&self) -> Vec<String>;
    async fn refresh_analysis(&self);
    async fn dispose(&self);
}

// ---------------------------------------------------------------------------
// §4.6.4 Signature extraction
// ---------------------------------------------------------------------------

const DECLARATION_KEYWORDS: &[&str] = &[
    "val", "var", "fun", "class", "interface", "object", "enum", "typealias", "constructor",
];

const MODIFIER_KEYWORDS: &[&str] = &[
    "abstract", "open", "override", "private", "protected", "internal", "public", "lateinit",
    "const", "suspend", "inline", "data", "sealed", "annotation", "inner", "companion", "expect",
    "actual", "external", "tailrec", "operator", "infix", "crossinline", "noinline", "reified",
    "vararg",
];

fn leading_token(line: &str) -> Option<&str> {
    line.trim().split(|c: char| c.is_whitespace() || c == '(' || c == '<').next()
}

fn is_declaration_line(line: &str) -> bool {
    match leading_token(line) {
        Some(tok) => DECLARATION_KEYWORDS.contains(&tok) || MODIFIER_KEYWORDS.contains(&tok),
        None => false,
    }
}

/// Skips leading annotation lines (including multi-line annotations with
/// parenthesized arguments) and returns the first declaration-keyword line,
/// trimmed and truncated to 120 characters (§4.6.4).
pub fn extract_signature(source_text: &str) -> String {
    let mut in_annotation_parens = false;
    let mut fallback: Option<&str> = None;
    for raw_line in source_text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if in_annotation_parens {
            if line.contains(')') {
                in_annotation_parens = false;
            }
            continue;
        }
        if line.starts_with('@') {
            if line.contains('(') && !line.contains(')') {
                in_annotation_parens = true;
            }
            continue;
        }
        if is_declaration_line(line) {
            return truncate(line, 120);
        }
        if fallback.is_none() {
            fallback = Some(line);
        }
    }
    truncate(fallback.unwrap_or(""), 120)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// ---------------------------------------------------------------------------
// §4.7 Completion helpers — prefix extraction and dot detection are pure
// string processing against the buffer mirror; no backend call needed.
// ---------------------------------------------------------------------------

struct CompletionContext {
    prefix: String,
    receiver_name: Option<String>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn completion_context(text: &str, line: u32, col: u32) -> CompletionContext {
    let Some(line_text) = text.lines().nth(line as usize) else {
        return CompletionContext { prefix: String::new(), receiver_name: None };
    };
    let chars: Vec<char> = line_text.chars().collect();
    let col = (col as usize).min(chars.len());

    let mut start = col;
    while start > 0 && is_ident_char(chars[start - 1]) {
        start -= 1;
    }
    let prefix: String = chars[start..col].iter().collect();

    let mut before = start;
    if before > 0 && chars[before - 1] == '?' {
        before -= 1;
    }
    let receiver_name = if before > 0 && chars[before - 1] == '.' {
        let mut recv_start = before - 1;
        while recv_start > 0 && is_ident_char(chars[recv_start - 1]) {
            recv_start -= 1;
        }
        let name: String = chars[recv_start..before - 1].iter().collect();
        if name.is_empty() { None } else { Some(name) }
    } else {
        None
    };

    CompletionContext { prefix, receiver_name }
}

fn scope_priority(scope_kind: &str) -> u8 {
    match scope_kind {
        "local" => 0,
        "type" | "package" | "static_member" | "type_parameter" => 1,
        "explicit_import" => 2,
        "default_import" => 3,
        _ => 5,
    }
}

fn shape_insert_text(name: &str, kind: SymbolKind, has_params: bool, no_params_function: bool) -> String {
    match kind {
        SymbolKind::Function | SymbolKind::Constructor => {
            if has_params {
                format!("{name}(")
            } else if no_params_function {
                format!("{name}()")
            } else {
                name.to_string()
            }
        }
        _ => name.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Backend-facing wire shapes — owned by the core, not leaked past the facade.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BackendSymbol {
    #[serde(default)]
    matched: Option<String>,
    name: String,
    kind: SymbolKind,
    path: PathBuf,
    line: u32,
    column: u32,
    #[serde(default)]
    containing_class: Option<String>,
    #[serde(default)]
    fq_name: Option<String>,
    #[serde(default)]
    source_text: Option<String>,
    #[serde(default)]
    synthetic_signature: Option<String>,
}

impl BackendSymbol {
    fn into_resolved(self) -> ResolvedSymbol {
        let signature = match self.matched.as_deref() {
            Some("annotation") => self.fq_name.clone().map(|fq| format!("annotation class {fq}")),
            _ => self
                .source_text
                .as_deref()
                .map(extract_signature)
                .or(self.synthetic_signature),
        };
        ResolvedSymbol {
            name: self.name,
            kind: self.kind,
            location: SourceLocation { path: self.path, line: self.line, column: self.column },
            containing_class: self.containing_class,
            signature,
            fq_name: self.fq_name,
        }
    }
}

// ---------------------------------------------------------------------------
// The concrete facade implementation
// ---------------------------------------------------------------------------

/// Live state the facade mediates access to. The sessions map is a single
/// value behind an `RwLock` (§5 "single value ... behind an atomic pointer");
/// readers clone the `Arc`, writers (only the worker, via `refresh_analysis`)
/// replace it wholesale.
pub struct AnalysisCoreFacade {
    backend: Arc<dyn AnalysisBackend>,
    sessions: RwLock<Arc<HashMap<Platform, Session>>>,
    project_model: RwLock<Arc<ProjectModel>>,
    buffer_mirror: Arc<BufferMirror>,
    symbol_cache: Arc<SymbolCache>,
    config: RwLock<Config>,
    project_root: PathBuf,
    temp_dirs: Mutex<Vec<PathBuf>>,
    worker_lock: Mutex<()>,
}

impl AnalysisCoreFacade {
    pub fn new(backend: Arc<dyn AnalysisBackend>, project_root: PathBuf, config: Config) -> Self {
        AnalysisCoreFacade {
            backend,
            sessions: RwLock::new(Arc::new(HashMap::new())),
            project_model: RwLock::new(Arc::new(
                ProjectModel::source_only(&project_root, "debug").unwrap_or_else(|_| ProjectModel {
                    modules: Vec::new(),
                    project_dir: Some(project_root.clone()),
                    variant: "debug".to_string(),
                    is_multiplatform: false,
                }),
            )),
            buffer_mirror: Arc::new(BufferMirror::default()),
            symbol_cache: Arc::new(SymbolCache::default()),
            config: RwLock::new(config),
            project_root,
            temp_dirs: Mutex::new(Vec::new()),
            worker_lock: Mutex::new(()),
        }
    }

    pub fn buffer_mirror(&self) -> Arc<BufferMirror> {
        Arc::clone(&self.buffer_mirror)
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap() = config;
    }

    fn available_platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.sessions.read().unwrap().keys().copied().collect();
        platforms.sort();
        platforms
    }

    fn primary_override(&self) -> Option<Platform> {
        let cfg = self.config.read().unwrap();
        cfg.primary_target.as_deref().and_then(|name| crate::model::platform_for_target_name(name).ok())
    }

    /// Reads a file's current text: the buffer mirror (editor-authoritative)
    /// takes priority over disk (§4.7's contract for completion, generalized
    /// to every read path that should see live edits).
    fn read_source(&self, path: &Path) -> Option<String> {
        if let Some(doc) = self.buffer_mirror.get(path) {
            return Some(doc.text);
        }
        std::fs::read_to_string(path).ok()
    }

    fn session_for_path(&self, path: &Path) -> Option<Platform> {
        let available = self.available_platforms();
        if available.is_empty() {
            return None;
        }
        route_for_path(path, &available, self.primary_override())
    }

    async fn backend_request(&self, method: &str, params: Value) -> Option<Value> {
        match self.backend.request(method, params).await {
            Ok(value) if !value.is_null() => Some(value),
            Ok(_) => None,
            Err(e) => {
                warn!(method, error = %e, "backend request failed");
                None
            }
        }
    }

    async fn resolve_backend_symbol(&self, path: &Path, line: u32, col: u32) -> Option<ResolvedSymbol> {
        let platform = self.session_for_path(path)?;
        let params = json!({
            "platform": platform.as_str(),
            "path": path,
            "line": line,
            "column": col,
        });
        let value = self.backend_request("resolveAtPosition", params).await?;
        let symbol: BackendSymbol = serde_json::from_value(value).ok()?;
        Some(symbol.into_resolved())
    }

    /// Every `.kt`/`.kts` file under a session's source roots, preferring
    /// buffer-mirror text for files currently open (§4.6.2).
    fn session_source_files(&self, platform: Platform) -> Vec<(PathBuf, String)> {
        let sessions = Arc::clone(&self.sessions.read().unwrap());
        let Some(session) = sessions.get(&platform) else { return Vec::new() };
        let mut files = Vec::new();
        for root in &session.source_roots {
            collect_kotlin_files(root, &mut files);
        }
        files
            .into_iter()
            .filter_map(|p| self.read_source(&p).map(|text| (p, text)))
            .collect()
    }

    async fn dispose_temp_dirs(&self) {
        let mut dirs = self.temp_dirs.lock().await;
        for dir in dirs.drain(..) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(path = %dir.display(), error = %e, "failed to remove temp dir during dispose");
            }
        }
    }

    fn register_temp_dirs(&self, sessions: &HashMap<Platform, Session>) {
        let mut discovered = Vec::new();
        let mut note = |p: &Path| {
            if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                if name.starts_with("klib-stubs-") || name.starts_with("aar-extract-") {
                    discovered.push(p.to_path_buf());
                }
            }
        };
        for session in sessions.values() {
            for root in &session.source_roots {
                note(root);
            }
            // aar unwrapping yields a jar file inside the temp dir, not the
            // dir itself — check the parent too.
            for entry in &session.classpath {
                if let Some(parent) = entry.parent() {
                    note(parent);
                }
            }
        }
        if let Ok(mut dirs) = self.temp_dirs.try_lock() {
            dirs.extend(discovered);
        }
    }
}

fn collect_kotlin_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_kotlin_files(&path, out);
        } else if matches!(path.extension().and_then(|e| e.to_str()), Some("kt") | Some("kts")) {
            out.push(path);
        }
    }
}

/// Finds every occurrence of `name` as a whole identifier in `text`,
/// returning 0-based (line, column) pairs.
fn find_identifier_occurrences(text: &str, name: &str) -> Vec<(u32, u32)> {
    let mut hits = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        let bytes: Vec<char> = line.chars().collect();
        let mut start = 0;
        while let Some(rel) = line[start..].find(name) {
            let byte_pos = start + rel;
            let col = line[..byte_pos].chars().count();
            let before_ok = col == 0 || !is_ident_char(bytes[col - 1]);
            let end_col = col + name.chars().count();
            let after_ok = end_col >= bytes.len() || !is_ident_char(bytes[end_col]);
            if before_ok && after_ok {
                hits.push((line_idx as u32, col as u32));
            }
            start = byte_pos + name.len().max(1);
        }
    }
    hits
}

#[async_trait]
impl CompilerFacade for AnalysisCoreFacade {
    async fn update_file_content(&self, path: &Path, text: String) {
        self.buffer_mirror.update(path, text.clone(), 0);
        self.symbol_cache.invalidate(path);
        self.backend.notify("updateFileContent", json!({ "path": path, "text": text })).await;
    }

    async fn get_diagnostics(&self, path: &Path) -> Vec<DiagnosticInfo> {
        let Some(platform) = self.session_for_path(path) else { return Vec::new() };
        let params = json!({ "platform": platform.as_str(), "path": path });
        let Some(value) = self.backend_request("getDiagnostics", params).await else {
            return Vec::new();
        };
        serde_json::from_value(value).unwrap_or_default()
    }

    async fn resolve_at_position(&self, path: &Path, line: u32, col: u32) -> Option<ResolvedSymbol> {
        self.resolve_backend_symbol(path, line, col).await
    }

    async fn get_type(&self, path: &Path, line: u32, col: u32) -> Option<TypeInfo> {
        let platform = self.session_for_path(path)?;
        let params = json!({ "platform": platform.as_str(), "path": path, "line": line, "column": col });
        let value = self.backend_request("getType", params).await?;
        serde_json::from_value(value).ok()
    }

    async fn get_documentation(&self, symbol: &ResolvedSymbol) -> Option<String> {
        let text = self.read_source(&symbol.location.path)?;
        let lines: Vec<&str> = text.lines().collect();
        let decl_line = symbol.location.line as usize;
        if decl_line == 0 || decl_line > lines.len() {
            return None;
        }
        let mut doc_lines = Vec::new();
        let mut idx = decl_line;
        // walk upward over blank lines and annotations to find a doc comment
        while idx > 0 {
            let line = lines[idx - 1].trim();
            if line.is_empty() || line.starts_with('@') {
                idx -= 1;
                continue;
            }
            break;
        }
        if idx > 0 && lines[idx - 1].trim_end().ends_with("*/") {
            let mut cursor = idx;
            while cursor > 0 {
                cursor -= 1;
                doc_lines.push(lines[cursor]);
                if lines[cursor].trim_start().starts_with("/**") || lines[cursor].trim_start().starts_with("/*") {
                    break;
                }
            }
            doc_lines.reverse();
            return Some(doc_lines.join("\n"));
        }
        None
    }

    async fn get_file_symbols(&self, path: &Path) -> Vec<ResolvedSymbol> {
        if let Some(cached) = self.symbol_cache.get(path) {
            return cached;
        }
        let Some(platform) = self.session_for_path(path) else { return Vec::new() };
        let params = json!({ "platform": platform.as_str(), "path": path });
        let Some(value) = self.backend_request("getFileSymbols", params).await else {
            return Vec::new();
        };
        let symbols: Vec<BackendSymbol> = serde_json::from_value(value).unwrap_or_default();
        let resolved: Vec<ResolvedSymbol> = symbols.into_iter().map(BackendSymbol::into_resolved).collect();
        self.symbol_cache.put(path.to_path_buf(), resolved.clone());
        resolved
    }

    /// §4.6.2: pure source-search + resolver confirmation.
    async fn find_references(&self, symbol: &ResolvedSymbol) -> Vec<SourceLocation> {
        let available = self.available_platforms();
        let mut matches = Vec::new();
        for platform in available {
            for (path, text) in self.session_source_files(platform) {
                for (line, col) in find_identifier_occurrences(&text, &symbol.name) {
                    if let Some(resolved) = self.resolve_backend_symbol(&path, line, col).await {
                        if resolved.location == symbol.location {
                            matches.push(SourceLocation { path: path.clone(), line, column: col });
                        }
                    }
                }
            }
        }
        matches
    }

    /// §4.6.3: only meaningful for CLASS/INTERFACE symbols.
    async fn find_implementations(&self, symbol: &ResolvedSymbol) -> Vec<SourceLocation> {
        if !matches!(symbol.kind, SymbolKind::Class | SymbolKind::Interface) {
            return Vec::new();
        }
        let target_name = symbol
            .fq_name
            .as_deref()
            .and_then(|fq| fq.rsplit('.').next())
            .unwrap_or(&symbol.name);

        let available = self.available_platforms();
        let mut matches = Vec::new();
        for platform in available {
            for (path, text) in self.session_source_files(platform) {
                for (decl_line, decl_col) in find_class_declarations_mentioning(&text, target_name) {
                    let params = json!({
                        "platform": platform.as_str(),
                        "path": path,
                        "line": decl_line,
                        "column": decl_col,
                    });
                    let Some(value) = self.backend_request("declarationSupertypeFqNames", params).await
                    else {
                        continue;
                    };
                    let supertype_fqns: Vec<String> = serde_json::from_value(value).unwrap_or_default();
                    let declares_target = match &symbol.fq_name {
                        Some(fq) => supertype_fqns.iter().any(|s| s == fq),
                        None => true,
                    };
                    if declares_target {
                        matches.push(SourceLocation { path: path.clone(), line: decl_line, column: decl_col });
                    }
                }
            }
        }
        matches
    }

    async fn get_type_definition_location(&self, path: &Path, line: u32, col: u32) -> Option<SourceLocation> {
        let ty = self.get_type(path, line, col).await?;
        let platform = self.session_for_path(path)?;
        let params = json!({ "platform": platform.as_str(), "fqName": ty.fq_name });
        let value = self.backend_request("locationForFqName", params).await?;
        serde_json::from_value(value).ok()
    }

    async fn get_completions(&self, path: &Path, line: u32, col: u32) -> Vec<CompletionCandidate> {
        let Some(platform) = self.session_for_path(path) else { return Vec::new() };
        let Some(text) = self.read_source(path) else { return Vec::new() };
        let ctx = completion_context(&text, line, col);

        let raw_candidates: Vec<Value> = if let Some(receiver) = ctx.receiver_name {
            let params = json!({
                "platform": platform.as_str(), "path": path, "line": line, "column": col, "receiverName": receiver,
            });
            match self.backend_request("memberCompletions", params).await {
                Some(value) => serde_json::from_value(value).unwrap_or_default(),
                None => Vec::new(),
            }
        } else {
            if ctx.prefix.is_empty() {
                // suppress import-level scopes when the prefix is empty (§4.7 step 4)
            }
            let params = json!({
                "platform": platform.as_str(), "path": path, "line": line, "column": col,
                "suppressImports": ctx.prefix.is_empty(),
            });
            match self.backend_request("scopeCompletions", params).await {
                Some(value) => serde_json::from_value(value).unwrap_or_default(),
                None => Vec::new(),
            }
        };

        #[derive(Deserialize)]
        struct RawCandidate {
            name: String,
            kind: SymbolKind,
            #[serde(default)]
            detail: Option<String>,
            #[serde(default)]
            is_deprecated: bool,
            #[serde(default)]
            has_parameters: bool,
            #[serde(default)]
            is_no_param_function: bool,
            #[serde(default)]
            scope_kind: String,
        }

        let mut candidates: Vec<CompletionCandidate> = raw_candidates
            .into_iter()
            .filter_map(|v| serde_json::from_value::<RawCandidate>(v).ok())
            .filter(|c| c.name.starts_with(&ctx.prefix))
            .map(|c| {
                let priority = if c.is_deprecated { 9 } else { scope_priority(&c.scope_kind) };
                CompletionCandidate {
                    insert_text: shape_insert_text(&c.name, c.kind, c.has_parameters, c.is_no_param_function),
                    label: c.name,
                    kind: c.kind,
                    detail: c.detail,
                    is_deprecated: c.is_deprecated,
                    sort_priority: priority,
                }
            })
            .collect();

        candidates.sort_by_key(|c| c.sort_priority);
        candidates.truncate(150);
        candidates
    }

    async fn prepare_rename(&self, path: &Path, line: u32, col: u32) -> Option<RenameContext> {
        let Some(text) = self.read_source(path) else { return None };
        if let Some(line_text) = text.lines().nth(line as usize) {
            if line_text.trim_start().starts_with("package ") {
                return None;
            }
        }
        let symbol = self.resolve_backend_symbol(path, line, col).await?;
        let range = SourceRange {
            path: symbol.location.path.clone(),
            start_line: symbol.location.line,
            start_column: symbol.location.column,
            end_line: symbol.location.line,
            end_column: symbol.location.column + symbol.name.chars().count() as u32,
        };
        Some(RenameContext { symbol, range })
    }

    /// §8 property 4: `n` references ⇒ `n+1` edits (declaration + each
    /// confirmed reference).
    async fn compute_rename(&self, ctx: &RenameContext, new_name: &str) -> Vec<FileEdit> {
        let mut edits = vec![FileEdit {
            path: ctx.range.path.clone(),
            range: ctx.range.clone(),
            new_text: new_name.to_string(),
        }];
        let references = self.find_references(&ctx.symbol).await;
        let name_len = ctx.symbol.name.chars().count() as u32;
        for reference in references {
            if reference == ctx.symbol.location {
                continue; // declaration already covered above
            }
            edits.push(FileEdit {
                path: reference.path.clone(),
                range: SourceRange {
                    path: reference.path,
                    start_line: reference.line,
                    start_column: reference.column,
                    end_line: reference.line,
                    end_column: reference.column + name_len,
                },
                new_text: new_name.to_string(),
            });
        }
        edits
    }

    /// §4.8 Expect/Actual navigation.
    async fn find_expect_actual_counterparts(&self, path: &Path, line: u32, col: u32) -> Vec<ResolvedSymbol> {
        let model = Arc::clone(&self.project_model.read().unwrap());
        if !model.is_multiplatform {
            return Vec::new();
        }
        let Some(current_platform) = self.session_for_path(path) else { return Vec::new() };
        let Some(current) = self.resolve_backend_symbol(path, line, col).await else { return Vec::new() };
        let Some(fq_name) = current.fq_name.clone() else { return Vec::new() };
        let Some(modifier) = declaration_modifier(&self.read_source(path).unwrap_or_default(), current.location.line)
        else {
            return Vec::new();
        };

        let available = self.available_platforms();
        let mut results = Vec::new();

        if modifier == "expect" {
            for platform in available {
                if platform == current_platform {
                    continue;
                }
                for (decl_path, text) in self.session_source_files(platform) {
                    for (decl_line, _) in find_fq_name_declarations(&text, &fq_name) {
                        if declaration_modifier(&text, decl_line).as_deref() == Some("actual") {
                            if let Some(symbol) = self
                                .resolve_backend_symbol(&decl_path, decl_line, 0)
                                .await
                                .filter(|s| s.fq_name.as_deref() == Some(fq_name.as_str()))
                            {
                                results.push(symbol);
                            }
                        }
                    }
                }
            }
        } else if modifier == "actual" {
            let primary = self
                .primary_override()
                .filter(|p| available.contains(p))
                .or_else(|| crate::routing::route_for_path(Path::new(""), &available, None));
            if let Some(primary) = primary {
                for (decl_path, text) in self.session_source_files(primary) {
                    for (decl_line, _) in find_fq_name_declarations(&text, &fq_name) {
                        if declaration_modifier(&text, decl_line).as_deref() == Some("expect") {
                            if let Some(symbol) = self
                                .resolve_backend_symbol(&decl_path, decl_line, 0)
                                .await
                                .filter(|s| s.fq_name.as_deref() == Some(fq_name.as_str()))
                            {
                                results.push(symbol);
                            }
                        }
                    }
                }
            }
        }
        results
    }

    async fn platform_for_file(&self, path: &Path) -> Option<String> {
        let model = Arc::clone(&self.project_model.read().unwrap());
        platform_name_for_file(path, &self.available_platforms(), self.primary_override(), model.is_multiplatform)
    }

    async fn get_available_targets(&self) -> Vec<String> {
        let model = Arc::clone(&self.project_model.read().unwrap());
        if !model.is_multiplatform {
            return Vec::new();
        }
        self.available_platforms().iter().map(|p| p.as_str().to_string()).collect()
    }

    /// §4.9: clear the cache, drop all sessions, rebuild from the current
    /// model, all on the analysis worker (serialized via `worker_lock`).
    async fn refresh_analysis(&self) {
        let _permit = self.worker_lock.lock().await;
        self.symbol_cache.clear();

        let variant = self.config.read().unwrap().variant.clone();
        let model = resolve_project(&self.project_root, &variant);
        let java_home_override = self.config.read().unwrap().java_home.clone();
        let jdk_home = crate::backend::find_java(java_home_override.as_deref())
            .and_then(|java_bin| java_bin.parent().and_then(|b| b.parent()).map(|p| p.to_path_buf()));

        if self.backend.dispose_all_sessions().await.is_err() {
            warn!("backend refused to dispose sessions before rebuild");
        }
        // Drop the old handle before building the new one, keeping peak
        // memory down during rebuild (§4.4 "Construction contract").
        *self.sessions.write().unwrap() = Arc::new(HashMap::new());

        let new_sessions = build_sessions(&model, jdk_home);
        self.register_temp_dirs(&new_sessions);

        for session in new_sessions.values() {
            if let Err(e) = self.backend.build_session(session.to_backend_spec()).await {
                warn!(platform = ?session.platform, error = %e, "session build failed; facade will return empty results for it");
            }
        }

        info!(platform_count = new_sessions.len(), "rebuilt analysis sessions");
        *self.sessions.write().unwrap() = Arc::new(new_sessions);
        *self.project_model.write().unwrap() = Arc::new(model);
    }

    async fn dispose(&self) {
        self.backend.shutdown().await;
        self.dispose_temp_dirs().await;
    }
}

fn find_class_declarations_mentioning(text: &str, supertype_name: &str) -> Vec<(u32, u32)> {
    let mut hits = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim_start();
        let is_class_like = ["class ", "interface ", "object "]
            .iter()
            .any(|kw| trimmed.starts_with(kw) || trimmed.contains(&format!(" {kw}")));
        if is_class_like && line.contains(':') && line.contains(supertype_name) {
            let col = line.len() - line.trim_start().len();
            hits.push((idx as u32, col as u32));
        }
    }
    hits
}

fn find_fq_name_declarations(text: &str, fq_name: &str) -> Vec<(u32, u32)> {
    let simple_name = fq_name.rsplit('.').next().unwrap_or(fq_name);
    find_identifier_occurrences(text, simple_name)
        .into_iter()
        .filter(|&(line, _)| {
            text.lines().nth(line as usize).map(is_declaration_line).unwrap_or(false)
        })
        .collect()
}

fn declaration_modifier(text: &str, line: u32) -> Option<String> {
    let line_text = text.lines().nth(line as usize)?;
    let trimmed = line_text.trim_start();
    if trimmed.starts_with("expect ") || trimmed.contains(" expect ") {
        Some("expect".to_string())
    } else if trimmed.starts_with("actual ") || trimmed.contains(" actual ") {
        Some("actual".to_string())
    } else {
        None
    }
}
