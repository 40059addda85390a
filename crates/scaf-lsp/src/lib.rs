#![doc = include_str!("../README.md")]

//! Language Server Protocol implementation for the scaf DSL.
//!
//! The semantic core (analysis, position resolution, cross-file loading,
//! completion, references and rename) lives in the modules below;
//! [`ScafLspBackend`] only adapts it to `tower-lsp`.

pub mod analysis;
pub mod code_actions;
pub mod completion;
pub mod config;
pub mod diagnostics;
pub mod document;
pub mod folding;
pub mod hover;
pub mod loader;
pub mod navigation;
pub mod references;
pub mod rename;
pub mod resolve;
pub mod symbols;
pub mod utils;
pub mod workspace;

use std::sync::Arc;

use tower_lsp::jsonrpc::{Error, Result};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer};

use crate::config::ServerConfig;
use crate::document::{uri_to_path, Document};
use crate::rename::RenameError;
use crate::workspace::Workspace;

/// LSP backend implementation for `.scaf` files.
pub struct ScafLspBackend {
    client: Client,
    workspace: Workspace,
}

impl ScafLspBackend {
    /// Construct a new backend bound to the given LSP client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            workspace: Workspace::default(),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn document(&self, uri: &Url) -> Option<Arc<Document>> {
        let doc = self.workspace.documents.get(uri);
        if doc.is_none() {
            tracing::debug!(%uri, "request for unknown document");
        }
        doc
    }

    async fn publish(&self, doc: &Document) {
        let diagnostics = diagnostics::document_diagnostics(doc);
        self.client
            .publish_diagnostics(doc.uri.clone(), diagnostics, Some(doc.version))
            .await;
    }
}

fn workspace_root(params: &InitializeParams) -> Option<std::path::PathBuf> {
    #[allow(deprecated)]
    let root_uri = params.root_uri.as_ref();
    root_uri
        .and_then(uri_to_path)
        .or_else(|| {
            params
                .workspace_folders
                .as_ref()?
                .first()
                .and_then(|folder| uri_to_path(&folder.uri))
        })
}

fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Kind(TextDocumentSyncKind::FULL)),
        completion_provider: Some(CompletionOptions {
            trigger_characters: Some(vec![".".into(), "$".into(), " ".into()]),
            ..Default::default()
        }),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        definition_provider: Some(OneOf::Left(true)),
        references_provider: Some(OneOf::Left(true)),
        rename_provider: Some(OneOf::Right(RenameOptions {
            prepare_provider: Some(true),
            work_done_progress_options: Default::default(),
        })),
        code_action_provider: Some(CodeActionProviderCapability::Options(CodeActionOptions {
            code_action_kinds: Some(vec![CodeActionKind::QUICKFIX]),
            ..Default::default()
        })),
        document_symbol_provider: Some(OneOf::Left(true)),
        folding_range_provider: Some(FoldingRangeProviderCapability::Simple(true)),
        ..Default::default()
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for ScafLspBackend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let config = ServerConfig::from_init_options(params.initialization_options.clone());
        let root = workspace_root(&params);
        tracing::info!(
            root = ?root,
            dialect = %config.dialect,
            workspace_references = config.workspace_references,
            "initialize"
        );
        self.workspace.set_config(config);
        self.workspace.set_root(root);

        Ok(InitializeResult {
            capabilities: server_capabilities(),
            server_info: Some(ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        tracing::info!("scaf-lsp initialized");
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let item = params.text_document;
        let doc = self.workspace.update(item.uri, item.version, item.text);
        self.publish(&doc).await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        // Full sync: the last change carries the whole text.
        let Some(change) = params.content_changes.into_iter().last() else {
            return;
        };
        let doc = self.workspace.update(
            params.text_document.uri,
            params.text_document.version,
            change.text,
        );
        self.publish(&doc).await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.workspace.close(&uri);
        self.client.publish_diagnostics(uri, vec![], None).await;
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        for change in &params.changes {
            if let Some(path) = uri_to_path(&change.uri) {
                tracing::debug!(path = %path.display(), kind = ?change.typ, "watched file changed");
                self.workspace.file_changed(&path);
            }
        }
        for doc in self.workspace.reanalyze_open() {
            self.publish(&doc).await;
        }
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let position = params.text_document_position;
        let Some(doc) = self.document(&position.text_document.uri) else {
            return Ok(None);
        };
        let trigger = params.context.and_then(|c| c.trigger_character);
        let items = completion::completions(&self.workspace, &doc, position.position, trigger.as_deref());
        Ok(Some(CompletionResponse::Array(items)))
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let position = params.text_document_position_params;
        let Some(doc) = self.document(&position.text_document.uri) else {
            return Ok(None);
        };
        Ok(hover::hover(&self.workspace, &doc, position.position))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        let position = params.text_document_position_params;
        let Some(doc) = self.document(&position.text_document.uri) else {
            return Ok(None);
        };
        Ok(navigation::goto_definition(&self.workspace, &doc, position.position))
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        let position = params.text_document_position;
        let Some(doc) = self.document(&position.text_document.uri) else {
            return Ok(None);
        };
        let locations = references::find_references(
            &self.workspace,
            &doc,
            position.position,
            params.context.include_declaration,
        );
        Ok((!locations.is_empty()).then_some(locations))
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let Some(doc) = self.document(&params.text_document.uri) else {
            return Ok(None);
        };
        Ok(rename::prepare_rename(&doc, params.position))
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let position = params.text_document_position;
        let result = match self.document(&position.text_document.uri) {
            Some(doc) => rename::rename(&self.workspace, &doc, position.position, &params.new_name),
            None => Err(RenameError::DocumentNotFound(position.text_document.uri)),
        };
        match result {
            Ok(edit) => Ok(Some(edit)),
            Err(err) => {
                tracing::info!(error = %err, "rename rejected");
                Err(Error::invalid_params(err.to_string()))
            }
        }
    }

    async fn code_action(&self, params: CodeActionParams) -> Result<Option<CodeActionResponse>> {
        let Some(doc) = self.document(&params.text_document.uri) else {
            return Ok(None);
        };
        let actions = code_actions::code_actions(&doc, &params.context.diagnostics);
        Ok((!actions.is_empty()).then_some(actions))
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let Some(doc) = self.document(&params.text_document.uri) else {
            return Ok(None);
        };
        let symbols = symbols::document_symbols(&doc.content, &doc.analysis.suite);
        Ok(Some(DocumentSymbolResponse::Nested(symbols)))
    }

    async fn folding_range(&self, params: FoldingRangeParams) -> Result<Option<Vec<FoldingRange>>> {
        let Some(doc) = self.document(&params.text_document.uri) else {
            return Ok(None);
        };
        Ok(Some(folding::folding_ranges(&doc.analysis.suite)))
    }
}
