//! Ready-made `initialize` parameters for embedders that do not need to
//! hand-craft their client capability announcement.

use lsp_types::{
    ClientCapabilities, ClientInfo, GeneralClientCapabilities, InitializeParams,
    RenameClientCapabilities, TextDocumentClientCapabilities, WindowClientCapabilities,
    WorkspaceClientCapabilities, WorkspaceEditClientCapabilities, WorkspaceFolder, Uri,
};

/// The client capability set a typical editor integration advertises:
/// work-done progress, workspace edits, and dynamic rename registration.
pub fn default_client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            ..Default::default()
        }),
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            rename: Some(RenameClientCapabilities {
                dynamic_registration: Some(true),
                prepare_support: Some(true),
                honors_change_annotations: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        general: Some(GeneralClientCapabilities {
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build `InitializeParams` for the given workspace root, deriving a
/// workspace folder from the last path segment of the root URI.
// root_uri is deprecated in the protocol but widely read by servers.
#[allow(deprecated)]
pub fn default_initialize_params(root_uri: Option<Uri>) -> InitializeParams {
    let workspace_folders = root_uri.as_ref().map(|uri| {
        let name = uri
            .path()
            .as_str()
            .split('/')
            .next_back()
            .filter(|segment| !segment.is_empty())
            .unwrap_or("workspace")
            .to_string();
        vec![WorkspaceFolder {
            uri: uri.clone(),
            name,
        }]
    });

    InitializeParams {
        process_id: Some(std::process::id()),
        capabilities: default_client_capabilities(),
        root_uri,
        workspace_folders,
        client_info: Some(ClientInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        ..Default::default()
    }
}
