//! Negotiated server capabilities
//!
//! Interprets the `initialize` response into a queryable structure. Feature
//! gates call [`Capabilities::supports`] before issuing a request; an
//! unsupported feature is a local caller error and never reaches the wire.

use serde_json::Value;

use crate::proto::{InitializeResult, ServerInfo};

/// Feature names the gate understands, paired with the provider field each
/// maps to in the server capability object. Both the short name ("hover")
/// and the wire method ("textDocument/hover") resolve.
const FEATURES: &[(&str, &str)] = &[
    ("hover", "hoverProvider"),
    ("completion", "completionProvider"),
    ("signatureHelp", "signatureHelpProvider"),
    ("declaration", "declarationProvider"),
    ("definition", "definitionProvider"),
    ("typeDefinition", "typeDefinitionProvider"),
    ("implementation", "implementationProvider"),
    ("references", "referencesProvider"),
    ("documentHighlight", "documentHighlightProvider"),
    ("documentSymbol", "documentSymbolProvider"),
    ("workspaceSymbol", "workspaceSymbolProvider"),
    ("codeAction", "codeActionProvider"),
    ("codeLens", "codeLensProvider"),
    ("documentLink", "documentLinkProvider"),
    ("formatting", "documentFormattingProvider"),
    ("rangeFormatting", "documentRangeFormattingProvider"),
    ("onTypeFormatting", "documentOnTypeFormattingProvider"),
    ("rename", "renameProvider"),
    ("foldingRange", "foldingRangeProvider"),
    ("selectionRange", "selectionRangeProvider"),
    ("callHierarchy", "callHierarchyProvider"),
    ("typeHierarchy", "typeHierarchyProvider"),
    ("semanticTokens", "semanticTokensProvider"),
    ("inlayHint", "inlayHintProvider"),
    ("inlineValue", "inlineValueProvider"),
    ("diagnostic", "diagnosticProvider"),
    ("moniker", "monikerProvider"),
    ("executeCommand", "executeCommandProvider"),
    ("textDocumentSync", "textDocumentSync"),
];

fn provider_field(feature: &str) -> Option<&'static str> {
    let short = normalize(feature);
    FEATURES
        .iter()
        .find(|(name, _)| *name == short)
        .map(|(_, field)| *field)
}

/// Strip the method namespace down to the short feature name.
fn normalize(feature: &str) -> &str {
    match feature {
        "workspace/symbol" => "workspaceSymbol",
        "workspace/executeCommand" => "executeCommand",
        f if f.starts_with("callHierarchy/") => "callHierarchy",
        f if f.starts_with("typeHierarchy/") => "typeHierarchy",
        f => {
            let f = f.strip_prefix("textDocument/").unwrap_or(f);
            // sub-requests like semanticTokens/full gate on the parent
            f.split('/').next().unwrap_or(f)
        }
    }
}

/// The feature a wire method gates on, if it gates at all.
///
/// Lifecycle methods, `$/`-prefixed protocol traffic, and methods this
/// table does not know pass ungated; the core treats them opaquely.
pub fn feature_for_method(method: &str) -> Option<&'static str> {
    if method.starts_with("$/") {
        return None;
    }
    match method {
        "initialize" | "initialized" | "shutdown" | "exit" => None,
        m => provider_field(m).and(Some(normalize_static(m))),
    }
}

fn normalize_static(method: &str) -> &'static str {
    let short = normalize(method);
    FEATURES
        .iter()
        .find(|(name, _)| *name == short)
        .map(|(name, _)| *name)
        .unwrap_or("unknown")
}

/// Read-only view of what a server declared at `initialize` time.
#[derive(Debug, Clone)]
pub struct Capabilities {
    raw: Value,
    server_info: Option<ServerInfo>,
}

impl Capabilities {
    pub fn new(result: InitializeResult) -> Self {
        Self {
            raw: result.capabilities,
            server_info: result.server_info,
        }
    }

    /// An empty capability set; everything reports unsupported.
    pub fn none() -> Self {
        Self {
            raw: Value::Null,
            server_info: None,
        }
    }

    /// Whether the server declared support for a feature.
    ///
    /// Accepts short names (`"hover"`) and wire methods
    /// (`"textDocument/hover"`). A provider field that is absent, `null`,
    /// or `false` means unsupported; `true` or an options object means
    /// supported. Unknown names report unsupported.
    pub fn supports(&self, feature: &str) -> bool {
        let Some(field) = provider_field(feature) else {
            return false;
        };
        match self.raw.get(field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    /// Raw provider value for callers that need the options object, e.g.
    /// trigger characters from `completionProvider`.
    pub fn get(&self, feature: &str) -> Option<&Value> {
        provider_field(feature)
            .and_then(|field| self.raw.get(field))
            .filter(|v| !v.is_null())
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_info.as_ref().map(|info| info.name.as_str())
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}
