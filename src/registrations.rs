//! Applying dynamic capability (un)registrations to a capabilities snapshot.
//!
//! Servers announce feature support after the handshake through
//! `client/registerCapability` and retract it through
//! `client/unregisterCapability`. This module folds those announcements into
//! a `ServerCapabilities` value so the rest of the driver can keep treating
//! the snapshot as the single source of truth.

use lsp_types::{
    CodeActionProviderCapability, CodeLensOptions, CompletionOptions, DeclarationCapability,
    DiagnosticOptions, DiagnosticServerCapabilities, DocumentLinkOptions, ExecuteCommandOptions,
    FoldingRangeProviderCapability, HoverProviderCapability, ImplementationProviderCapability,
    InlayHintOptions, InlayHintServerCapabilities, OneOf, Registration, RenameOptions,
    SelectionRangeProviderCapability, SemanticTokensOptions, SemanticTokensServerCapabilities,
    ServerCapabilities, SignatureHelpOptions, TypeDefinitionProviderCapability, Unregistration,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// A single (un)registration that could not be applied. The caller logs and
/// swallows these; the capabilities snapshot is left untouched by the
/// failing entry.
#[derive(Debug, Error)]
#[error("cannot apply `{method}` registration: {reason}")]
pub struct RegistrationError {
    method: String,
    reason: String,
}

impl RegistrationError {
    fn new(method: &str, reason: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

/// Apply a list of registrations in order. Stops at the first malformed
/// entry; earlier entries stay applied.
pub fn apply_registrations(
    capabilities: &mut ServerCapabilities,
    registrations: &[Registration],
) -> Result<(), RegistrationError> {
    for registration in registrations {
        apply_registration(capabilities, registration)?;
    }
    Ok(())
}

/// Apply a list of unregistrations in order.
pub fn apply_unregistrations(
    capabilities: &mut ServerCapabilities,
    unregistrations: &[Unregistration],
) -> Result<(), RegistrationError> {
    for unregistration in unregistrations {
        apply_unregistration(capabilities, &unregistration.method);
    }
    Ok(())
}

fn apply_registration(
    capabilities: &mut ServerCapabilities,
    registration: &Registration,
) -> Result<(), RegistrationError> {
    let method = registration.method.as_str();
    let options = registration.register_options.clone();
    match method {
        "textDocument/hover" => {
            capabilities.hover_provider = Some(HoverProviderCapability::Simple(true));
        }
        "textDocument/completion" => {
            capabilities.completion_provider = Some(decode::<CompletionOptions>(method, options)?);
        }
        "textDocument/signatureHelp" => {
            capabilities.signature_help_provider =
                Some(decode::<SignatureHelpOptions>(method, options)?);
        }
        "textDocument/definition" => {
            capabilities.definition_provider = Some(OneOf::Left(true));
        }
        "textDocument/typeDefinition" => {
            capabilities.type_definition_provider =
                Some(TypeDefinitionProviderCapability::Simple(true));
        }
        "textDocument/implementation" => {
            capabilities.implementation_provider =
                Some(ImplementationProviderCapability::Simple(true));
        }
        "textDocument/declaration" => {
            capabilities.declaration_provider = Some(DeclarationCapability::Simple(true));
        }
        "textDocument/references" => {
            capabilities.references_provider = Some(OneOf::Left(true));
        }
        "textDocument/documentHighlight" => {
            capabilities.document_highlight_provider = Some(OneOf::Left(true));
        }
        "textDocument/documentSymbol" => {
            capabilities.document_symbol_provider = Some(OneOf::Left(true));
        }
        "workspace/symbol" => {
            capabilities.workspace_symbol_provider = Some(OneOf::Left(true));
        }
        "workspace/executeCommand" => {
            capabilities.execute_command_provider =
                Some(decode::<ExecuteCommandOptions>(method, options)?);
        }
        "textDocument/codeAction" => {
            capabilities.code_action_provider = Some(CodeActionProviderCapability::Simple(true));
        }
        "textDocument/codeLens" => {
            capabilities.code_lens_provider = Some(decode::<CodeLensOptions>(method, options)?);
        }
        "textDocument/documentLink" => {
            capabilities.document_link_provider =
                Some(decode::<DocumentLinkOptions>(method, options)?);
        }
        "textDocument/formatting" => {
            capabilities.document_formatting_provider = Some(OneOf::Left(true));
        }
        "textDocument/rangeFormatting" => {
            capabilities.document_range_formatting_provider = Some(OneOf::Left(true));
        }
        "textDocument/rename" => {
            capabilities.rename_provider = Some(match options {
                Some(_) => OneOf::Right(decode::<RenameOptions>(method, options)?),
                None => OneOf::Left(true),
            });
        }
        "textDocument/foldingRange" => {
            capabilities.folding_range_provider = Some(FoldingRangeProviderCapability::Simple(true));
        }
        "textDocument/selectionRange" => {
            capabilities.selection_range_provider =
                Some(SelectionRangeProviderCapability::Simple(true));
        }
        "textDocument/semanticTokens" => {
            capabilities.semantic_tokens_provider =
                Some(SemanticTokensServerCapabilities::SemanticTokensOptions(
                    decode::<SemanticTokensOptions>(method, options)?,
                ));
        }
        "textDocument/inlayHint" => {
            capabilities.inlay_hint_provider = Some(match options {
                Some(_) => {
                    let decoded = decode::<InlayHintOptions>(method, options)?;
                    OneOf::Right(InlayHintServerCapabilities::Options(decoded))
                }
                None => OneOf::Left(true),
            });
        }
        "textDocument/diagnostic" => {
            capabilities.diagnostic_provider = Some(DiagnosticServerCapabilities::Options(
                decode::<DiagnosticOptions>(method, options)?,
            ));
        }
        other => {
            // Methods with no ServerCapabilities counterpart (file watchers,
            // text sync variants) are legal to register; nothing to fold in.
            debug!(method = other, "ignoring capability registration with no snapshot field");
        }
    }
    Ok(())
}

fn apply_unregistration(capabilities: &mut ServerCapabilities, method: &str) {
    match method {
        "textDocument/hover" => capabilities.hover_provider = None,
        "textDocument/completion" => capabilities.completion_provider = None,
        "textDocument/signatureHelp" => capabilities.signature_help_provider = None,
        "textDocument/definition" => capabilities.definition_provider = None,
        "textDocument/typeDefinition" => capabilities.type_definition_provider = None,
        "textDocument/implementation" => capabilities.implementation_provider = None,
        "textDocument/declaration" => capabilities.declaration_provider = None,
        "textDocument/references" => capabilities.references_provider = None,
        "textDocument/documentHighlight" => capabilities.document_highlight_provider = None,
        "textDocument/documentSymbol" => capabilities.document_symbol_provider = None,
        "workspace/symbol" => capabilities.workspace_symbol_provider = None,
        "workspace/executeCommand" => capabilities.execute_command_provider = None,
        "textDocument/codeAction" => capabilities.code_action_provider = None,
        "textDocument/codeLens" => capabilities.code_lens_provider = None,
        "textDocument/documentLink" => capabilities.document_link_provider = None,
        "textDocument/formatting" => capabilities.document_formatting_provider = None,
        "textDocument/rangeFormatting" => capabilities.document_range_formatting_provider = None,
        "textDocument/rename" => capabilities.rename_provider = None,
        "textDocument/foldingRange" => capabilities.folding_range_provider = None,
        "textDocument/selectionRange" => capabilities.selection_range_provider = None,
        "textDocument/semanticTokens" => capabilities.semantic_tokens_provider = None,
        "textDocument/inlayHint" => capabilities.inlay_hint_provider = None,
        "textDocument/diagnostic" => capabilities.diagnostic_provider = None,
        other => {
            debug!(method = other, "ignoring capability unregistration with no snapshot field");
        }
    }
}

/// Decode per-method registration options. Registrations without options
/// decode an empty object, so option structs whose fields are all optional
/// fall back to their defaults, while structs with required fields (legend,
/// command lists) reject the entry as malformed.
fn decode<T: DeserializeOwned>(
    method: &str,
    options: Option<Value>,
) -> Result<T, RegistrationError> {
    let value = options.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|error| RegistrationError::new(method, error.to_string()))
}
