//! Thin `tower_lsp::LanguageServer` shim. Every handler converts `lsp_types`
//! request shapes into `analysis_core::facade` calls and converts the neutral
//! result back; no semantic logic lives here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use analysis_core::backend::{find_java, ProcessBackend};
use analysis_core::config::Config;
use analysis_core::facade::{CompilerFacade, DiagnosticInfo, FileEdit, ResolvedSymbol, Severity, SymbolKind};
use analysis_core::AnalysisCoreFacade;
use lsp_types::request::{GotoImplementationParams, GotoImplementationResponse};
use lsp_types::*;
use tokio::sync::{mpsc, RwLock};
use tower_lsp::jsonrpc::Result as LspResult;
use tower_lsp::{Client, LanguageServer};

const SIDECAR_JAR_ENV: &str = "KOTLIN_ANALYZER_SIDECAR_JAR";

pub struct KotlinAnalysisServer {
    client: Client,
    facade: RwLock<Option<Arc<AnalysisCoreFacade>>>,
    config: RwLock<Config>,
    project_root: RwLock<Option<PathBuf>>,
    debounce_tx: RwLock<Option<mpsc::Sender<()>>>,
}

impl KotlinAnalysisServer {
    pub fn new(client: Client) -> Self {
        KotlinAnalysisServer {
            client,
            facade: RwLock::new(None),
            config: RwLock::new(Config::default()),
            project_root: RwLock::new(None),
            debounce_tx: RwLock::new(None),
        }
    }

    async fn facade(&self) -> Option<Arc<AnalysisCoreFacade>> {
        self.facade.read().await.clone()
    }

    /// Coalesces bursts of build-file/generated-source change events into a
    /// single `refresh_analysis` roughly 2s after the last one (§4.9).
    fn start_debounce_loop(&self, facade: Arc<AnalysisCoreFacade>) -> mpsc::Sender<()> {
        let (tx, mut rx) = mpsc::channel::<()>(8);
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut pending = false;
            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(()) => pending = true,
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(2000)), if pending => {
                        pending = false;
                        facade.refresh_analysis().await;
                        client.log_message(MessageType::LOG, "analysis sessions rebuilt").await;
                    }
                }
            }
        });
        tx
    }

    fn position_of(position: Position) -> (u32, u32) {
        (position.line, position.character)
    }

    fn location_to_lsp(loc: &analysis_core::facade::SourceLocation) -> Option<Location> {
        let uri = Url::from_file_path(&loc.path).ok()?;
        Some(Location {
            uri,
            range: Range {
                start: Position::new(loc.line, loc.column),
                end: Position::new(loc.line, loc.column),
            },
        })
    }

    fn severity_to_lsp(severity: Severity) -> DiagnosticSeverity {
        match severity {
            Severity::Error => DiagnosticSeverity::ERROR,
            Severity::Warning => DiagnosticSeverity::WARNING,
            Severity::Info => DiagnosticSeverity::INFORMATION,
        }
    }

    fn diagnostic_to_lsp(info: &DiagnosticInfo) -> Diagnostic {
        Diagnostic {
            range: Range {
                start: Position::new(info.range.start_line, info.range.start_column),
                end: Position::new(info.range.end_line, info.range.end_column),
            },
            severity: Some(Self::severity_to_lsp(info.severity)),
            code: info.code.clone().map(NumberOrString::String),
            source: Some("kotlin-analysis-server".into()),
            message: info.message.clone(),
            ..Default::default()
        }
    }

    fn symbol_kind_to_lsp(kind: SymbolKind) -> lsp_types::SymbolKind {
        match kind {
            SymbolKind::Class => lsp_types::SymbolKind::CLASS,
            SymbolKind::Interface => lsp_types::SymbolKind::INTERFACE,
            SymbolKind::Object => lsp_types::SymbolKind::OBJECT,
            SymbolKind::Enum => lsp_types::SymbolKind::ENUM,
            SymbolKind::EnumEntry => lsp_types::SymbolKind::ENUM_MEMBER,
            SymbolKind::Function | SymbolKind::Constructor => lsp_types::SymbolKind::FUNCTION,
            SymbolKind::Property => lsp_types::SymbolKind::PROPERTY,
            SymbolKind::TypeAlias => lsp_types::SymbolKind::TYPE_PARAMETER,
            SymbolKind::TypeParameter => lsp_types::SymbolKind::TYPE_PARAMETER,
            SymbolKind::Package => lsp_types::SymbolKind::PACKAGE,
            SymbolKind::File => lsp_types::SymbolKind::FILE,
            SymbolKind::LocalVariable => lsp_types::SymbolKind::VARIABLE,
            SymbolKind::Parameter => lsp_types::SymbolKind::VARIABLE,
        }
    }

    fn completion_item_kind(kind: SymbolKind) -> CompletionItemKind {
        match kind {
            SymbolKind::Function | SymbolKind::Constructor => CompletionItemKind::FUNCTION,
            SymbolKind::Property => CompletionItemKind::FIELD,
            SymbolKind::Class => CompletionItemKind::CLASS,
            SymbolKind::Interface => CompletionItemKind::INTERFACE,
            SymbolKind::Object => CompletionItemKind::MODULE,
            SymbolKind::Enum => CompletionItemKind::ENUM,
            SymbolKind::EnumEntry => CompletionItemKind::ENUM_MEMBER,
            SymbolKind::TypeAlias | SymbolKind::TypeParameter => CompletionItemKind::TYPE_PARAMETER,
            SymbolKind::Package => CompletionItemKind::MODULE,
            SymbolKind::File => CompletionItemKind::FILE,
            SymbolKind::LocalVariable | SymbolKind::Parameter => CompletionItemKind::VARIABLE,
        }
    }

    async fn publish_diagnostics_for(&self, facade: &Arc<AnalysisCoreFacade>, uri: Url) {
        let Ok(path) = uri.to_file_path() else { return };
        let diagnostics = facade.get_diagnostics(&path).await;
        let lsp_diagnostics = diagnostics.iter().map(Self::diagnostic_to_lsp).collect();
        self.client.publish_diagnostics(uri, lsp_diagnostics, None).await;
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for KotlinAnalysisServer {
    async fn initialize(&self, params: InitializeParams) -> LspResult<InitializeResult> {
        tracing::info!("kotlin-analysis-server: initializing");

        if let Some(options) = params.initialization_options {
            if let Ok(config) = serde_json::from_value::<Config>(options) {
                *self.config.write().await = config;
            }
        }

        if let Some(root_uri) = params.root_uri {
            if let Ok(path) = root_uri.to_file_path() {
                *self.project_root.write().await = Some(path);
            }
        }

        let file_watchers = vec![
            FileSystemWatcher { glob_pattern: GlobPattern::String("**/*.gradle.kts".into()), kind: None },
            FileSystemWatcher { glob_pattern: GlobPattern::String("**/*.gradle".into()), kind: None },
            FileSystemWatcher { glob_pattern: GlobPattern::String("**/pom.xml".into()), kind: None },
            FileSystemWatcher { glob_pattern: GlobPattern::String("**/.kotlin-analyzer.json".into()), kind: None },
        ];
        let client = self.client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let registration = Registration {
                id: "watch-build-files".to_string(),
                method: "workspace/didChangeWatchedFiles".to_string(),
                register_options: Some(
                    serde_json::to_value(DidChangeWatchedFilesRegistrationOptions { watchers: file_watchers })
                        .unwrap(),
                ),
            };
            if let Err(e) = client.register_capability(vec![registration]).await {
                tracing::warn!("failed to register file watchers: {:?}", e);
            }
        });

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![".".into(), "?".into()]),
                    resolve_provider: Some(false),
                    ..Default::default()
                }),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: Default::default(),
                })),
                document_symbol_provider: Some(OneOf::Left(true)),
                implementation_provider: Some(ImplementationProviderCapability::Simple(true)),
                code_action_provider: Some(CodeActionProviderCapability::Simple(true)),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: "kotlin-analysis-server".into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        tracing::info!("kotlin-analysis-server: initialized");

        let Some(project_root) = self.project_root.read().await.clone() else {
            tracing::warn!("no project root; analysis disabled");
            return;
        };

        let java_home = self.config.read().await.java_home.clone();
        let Some(java_path) = find_java(java_home.as_deref()) else {
            self.client
                .show_message(
                    MessageType::ERROR,
                    "kotlin-analysis-server: JDK 17+ required but not found. Set java.home or JAVA_HOME.",
                )
                .await;
            return;
        };

        let sidecar_jar = std::env::var(SIDECAR_JAR_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(find_sidecar_jar);
        let Some(sidecar_jar) = sidecar_jar else {
            self.client
                .show_message(
                    MessageType::WARNING,
                    "kotlin-analysis-server: analysis sidecar jar not found; semantic features unavailable.",
                )
                .await;
            return;
        };

        let jvm_args = self.config.read().await.jvm_args.clone();
        match ProcessBackend::start(java_path, sidecar_jar, &jvm_args).await {
            Ok(backend) => {
                let config = self.config.read().await.clone();
                let facade = Arc::new(AnalysisCoreFacade::new(Arc::new(backend), project_root, config));
                facade.refresh_analysis().await;
                let tx = self.start_debounce_loop(Arc::clone(&facade));
                *self.debounce_tx.write().await = Some(tx);
                *self.facade.write().await = Some(facade);
                tracing::info!("analysis backend ready");
            }
            Err(e) => {
                tracing::error!("failed to start analysis backend: {}", e);
                self.client
                    .show_message(MessageType::ERROR, format!("kotlin-analysis-server: {e}"))
                    .await;
            }
        }
    }

    async fn shutdown(&self) -> LspResult<()> {
        if let Some(facade) = self.facade().await {
            facade.dispose().await;
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let Some(facade) = self.facade().await else { return };
        let uri = params.text_document.uri.clone();
        let Ok(path) = uri.to_file_path() else { return };
        facade.update_file_content(&path, params.text_document.text).await;
        self.publish_diagnostics_for(&facade, uri).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let Some(facade) = self.facade().await else { return };
        let uri = params.text_document.uri.clone();
        let Ok(path) = uri.to_file_path() else { return };
        if let Some(change) = params.content_changes.into_iter().last() {
            facade.update_file_content(&path, change.text).await;
        }
        // intra-file edits never trigger diagnostics on their own (§4.9); the
        // editor re-requests diagnostics explicitly via the pull model, or
        // they arrive again on the next open/rebuild.
        let _ = uri;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        // Closing a buffer stops mirroring its in-editor text (future reads
        // fall back to disk), but it must not clear diagnostics — the
        // problems panel should keep showing them until the file changes
        // again or the project is rebuilt.
        let Ok(path) = params.text_document.uri.to_file_path() else { return };
        if let Some(facade) = self.facade().await {
            facade.buffer_mirror().close(&path);
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        if let Ok(config) = serde_json::from_value::<Config>(params.settings) {
            *self.config.write().await = config.clone();
            if let Some(facade) = self.facade().await {
                facade.set_config(config);
            }
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let is_build_file = params.changes.iter().any(|change| {
            let path = change.uri.to_string();
            path.ends_with(".gradle") || path.ends_with(".gradle.kts") || path.ends_with("pom.xml")
                || path.ends_with(".kotlin-analyzer.json")
        });
        if !is_build_file {
            return;
        }
        if let Some(tx) = self.debounce_tx.read().await.as_ref() {
            let _ = tx.send(()).await;
        }
    }

    async fn completion(&self, params: CompletionParams) -> LspResult<Option<CompletionResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position.position);

        let candidates = facade.get_completions(&path, line, col).await;
        let items = candidates
            .into_iter()
            .map(|c| CompletionItem {
                label: c.label,
                kind: Some(Self::completion_item_kind(c.kind)),
                detail: c.detail,
                insert_text: Some(c.insert_text),
                deprecated: Some(c.is_deprecated),
                sort_text: Some(format!("{:03}", c.sort_priority)),
                ..Default::default()
            })
            .collect();
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn hover(&self, params: HoverParams) -> LspResult<Option<Hover>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position_params.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position_params.position);

        let Some(symbol) = facade.resolve_at_position(&path, line, col).await else { return Ok(None) };
        let ty = facade.get_type(&path, line, col).await;
        let doc = facade.get_documentation(&symbol).await;

        let mut sections = Vec::new();
        if let Some(sig) = &symbol.signature {
            sections.push(format!("```kotlin\n{sig}\n```"));
        }
        if let Some(ty) = ty {
            sections.push(format!("Type: `{}`", ty.fq_name));
        }
        if let Some(doc) = doc {
            sections.push(doc);
        }
        if sections.is_empty() {
            return Ok(None);
        }

        Ok(Some(Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: sections.join("\n\n"),
            }),
            range: None,
        }))
    }

    async fn goto_definition(&self, params: GotoDefinitionParams) -> LspResult<Option<GotoDefinitionResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position_params.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position_params.position);

        let Some(loc) = facade.get_type_definition_location(&path, line, col).await else {
            return Ok(None);
        };
        Self::location_to_lsp(&loc)
            .map(|l| Ok(Some(GotoDefinitionResponse::Scalar(l))))
            .unwrap_or(Ok(None))
    }

    async fn references(&self, params: ReferenceParams) -> LspResult<Option<Vec<Location>>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position.position);

        let Some(symbol) = facade.resolve_at_position(&path, line, col).await else { return Ok(None) };
        let mut locations = facade.find_references(&symbol).await;
        if params.context.include_declaration {
            locations.push(symbol.location.clone());
        }
        let lsp_locations: Vec<Location> = locations.iter().filter_map(Self::location_to_lsp).collect();
        if lsp_locations.is_empty() {
            Ok(None)
        } else {
            Ok(Some(lsp_locations))
        }
    }

    async fn goto_implementation(
        &self,
        params: GotoImplementationParams,
    ) -> LspResult<Option<GotoImplementationResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position_params.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position_params.position);

        let Some(symbol) = facade.resolve_at_position(&path, line, col).await else { return Ok(None) };
        let locations: Vec<Location> = facade
            .find_implementations(&symbol)
            .await
            .iter()
            .filter_map(Self::location_to_lsp)
            .collect();
        if locations.is_empty() {
            Ok(None)
        } else {
            Ok(Some(GotoImplementationResponse::Array(locations)))
        }
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> LspResult<Option<PrepareRenameResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let Ok(path) = params.text_document.uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.position);

        let Some(ctx) = facade.prepare_rename(&path, line, col).await else { return Ok(None) };
        Ok(Some(PrepareRenameResponse::Range(Range {
            start: Position::new(ctx.range.start_line, ctx.range.start_column),
            end: Position::new(ctx.range.end_line, ctx.range.end_column),
        })))
    }

    async fn rename(&self, params: RenameParams) -> LspResult<Option<WorkspaceEdit>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let uri = params.text_document_position.text_document.uri;
        let Ok(path) = uri.to_file_path() else { return Ok(None) };
        let (line, col) = Self::position_of(params.text_document_position.position);

        let Some(ctx) = facade.prepare_rename(&path, line, col).await else { return Ok(None) };
        let edits = facade.compute_rename(&ctx, &params.new_name).await;
        let changes = group_edits_by_file(edits);
        if changes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(WorkspaceEdit { changes: Some(changes), document_changes: None, change_annotations: None }))
        }
    }

    async fn document_symbol(&self, params: DocumentSymbolParams) -> LspResult<Option<DocumentSymbolResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let Ok(path) = params.text_document.uri.to_file_path() else { return Ok(None) };
        let symbols = facade.get_file_symbols(&path).await;
        if symbols.is_empty() {
            return Ok(None);
        }
        let infos: Vec<SymbolInformation> = symbols
            .iter()
            .filter_map(|s| symbol_information(s))
            .collect();
        if infos.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DocumentSymbolResponse::Flat(infos)))
        }
    }

    async fn code_action(&self, params: CodeActionParams) -> LspResult<Option<CodeActionResponse>> {
        let Some(facade) = self.facade().await else { return Ok(None) };
        let Ok(path) = params.text_document.uri.to_file_path() else { return Ok(None) };
        let diagnostics = facade.get_diagnostics(&path).await;

        let actions: Vec<CodeActionOrCommand> = diagnostics
            .iter()
            .flat_map(|d| d.quick_fixes.iter())
            .map(|fix| {
                let changes = group_edits_by_file(fix.edits.clone());
                CodeActionOrCommand::CodeAction(CodeAction {
                    title: fix.title.clone(),
                    kind: Some(CodeActionKind::QUICKFIX),
                    diagnostics: None,
                    edit: Some(WorkspaceEdit { changes: Some(changes), document_changes: None, change_annotations: None }),
                    command: None,
                    is_preferred: None,
                    disabled: None,
                    data: None,
                })
            })
            .collect();

        if actions.is_empty() {
            Ok(None)
        } else {
            Ok(Some(actions))
        }
    }
}

fn group_edits_by_file(edits: Vec<FileEdit>) -> std::collections::HashMap<Url, Vec<TextEdit>> {
    let mut changes: std::collections::HashMap<Url, Vec<TextEdit>> = std::collections::HashMap::new();
    for edit in edits {
        let Ok(uri) = Url::from_file_path(&edit.path) else { continue };
        changes.entry(uri).or_default().push(TextEdit {
            range: Range {
                start: Position::new(edit.range.start_line, edit.range.start_column),
                end: Position::new(edit.range.end_line, edit.range.end_column),
            },
            new_text: edit.new_text,
        });
    }
    changes
}

fn symbol_information(symbol: &ResolvedSymbol) -> Option<SymbolInformation> {
    let uri = Url::from_file_path(&symbol.location.path).ok()?;
    #[allow(deprecated)]
    Some(SymbolInformation {
        name: symbol.name.clone(),
        kind: KotlinAnalysisServer::symbol_kind_to_lsp(symbol.kind),
        tags: None,
        deprecated: None,
        location: Location {
            uri,
            range: Range {
                start: Position::new(symbol.location.line, symbol.location.column),
                end: Position::new(symbol.location.line, symbol.location.column),
            },
        },
        container_name: symbol.containing_class.clone(),
    })
}

fn find_sidecar_jar() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let exe_dir = exe.parent()?;
    let jar = exe_dir.join("analysis-sidecar.jar");
    if jar.exists() {
        return Some(jar);
    }
    let dev_jar = exe_dir.parent()?.parent()?.parent()?.join("sidecar/build/libs/analysis-sidecar-all.jar");
    if dev_jar.exists() {
        return Some(dev_jar);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::facade::{SourceLocation, SourceRange};
    use std::path::PathBuf;

    #[test]
    fn severity_maps_error_to_lsp_error() {
        assert_eq!(KotlinAnalysisServer::severity_to_lsp(Severity::Error), DiagnosticSeverity::ERROR);
        assert_eq!(KotlinAnalysisServer::severity_to_lsp(Severity::Warning), DiagnosticSeverity::WARNING);
    }

    #[test]
    fn group_edits_by_file_buckets_by_path() {
        let edits = vec![
            FileEdit {
                path: PathBuf::from("/a.kt"),
                range: SourceRange { path: PathBuf::from("/a.kt"), start_line: 0, start_column: 0, end_line: 0, end_column: 3 },
                new_text: "foo".into(),
            },
            FileEdit {
                path: PathBuf::from("/a.kt"),
                range: SourceRange { path: PathBuf::from("/a.kt"), start_line: 5, start_column: 0, end_line: 5, end_column: 3 },
                new_text: "foo".into(),
            },
        ];
        let changes = group_edits_by_file(edits);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.values().next().unwrap().len(), 2);
    }

    #[test]
    fn location_to_lsp_builds_zero_width_range() {
        let loc = SourceLocation { path: PathBuf::from("/a.kt"), line: 4, column: 2 };
        let lsp_loc = KotlinAnalysisServer::location_to_lsp(&loc).unwrap();
        assert_eq!(lsp_loc.range.start, Position::new(4, 2));
        assert_eq!(lsp_loc.range.end, Position::new(4, 2));
    }
}
