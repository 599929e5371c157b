//! Live language-server connection
//!
//! A [`Client`] is one running server for one (workspace root, language id)
//! pair: the supervised subprocess, the JSON-RPC session on its stdio, and
//! the capabilities it declared during the `initialize` handshake.
//!
//! Clients are created and destroyed only by [`crate::registry::Registry`];
//! everything else receives references.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::capabilities::{Capabilities, feature_for_method};
use crate::config::ClientConfig;
use crate::error::{LspError, LspResult};
use crate::process::{Launcher, ProcessExit, ServerHandle, ServerProcess};
use crate::proto::{
    ClientCapabilities, ClientInfo, InitializeParams, MessageType, ResponseError, path_to_uri,
};
use crate::session::{Session, SessionState};
use crate::settings::Settings;

/// Identity of one client: the workspace it serves and the language id its
/// server handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub workspace_root: PathBuf,
    pub language_id: String,
}

impl ClientKey {
    pub fn new(workspace_root: impl Into<PathBuf>, language_id: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            language_id: language_id.into(),
        }
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} @ {}",
            self.language_id,
            self.workspace_root.display()
        )
    }
}

pub struct Client {
    key: ClientKey,
    config: ClientConfig,
    session: Arc<Session>,
    capabilities: Capabilities,
    process: Option<ServerProcess>,
    exit: watch::Receiver<Option<ProcessExit>>,
    shutdown_grace: Duration,
    stopping: AtomicBool,
}

impl Client {
    /// Launch the server, run the `initialize` handshake, and return a
    /// ready client. On handshake failure the subprocess is terminated
    /// before the error propagates.
    pub(crate) async fn start(
        key: ClientKey,
        config: ClientConfig,
        launcher: &dyn Launcher,
        settings: &Settings,
    ) -> LspResult<Arc<Self>> {
        let ServerHandle {
            reader,
            writer,
            exit,
            process,
        } = launcher.launch(&config, &key.workspace_root).await?;

        let session = Session::connect(&config.name, reader, writer, settings);
        register_default_handlers(&session, &config.name).await;

        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(path_to_uri(&key.workspace_root)),
            capabilities: ClientCapabilities::baseline(),
            client_info: Some(ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            initialization_options: config.initialization_options.clone(),
        };

        let result = match session.initialize(params).await {
            Ok(result) => result,
            Err(e) => {
                if let Some(process) = process {
                    process.terminate(settings.shutdown_grace()).await;
                }
                return Err(e);
            }
        };

        let capabilities = Capabilities::new(result);
        if let Some(info) = capabilities.server_info() {
            tracing::debug!(
                "{}: connected to {} {}",
                key,
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }

        Ok(Arc::new(Self {
            key,
            config,
            session,
            capabilities,
            process,
            exit,
            shutdown_grace: settings.shutdown_grace(),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Capabilities negotiated at `initialize` time; read-only afterwards.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_active(&self) -> bool {
        self.session.state() == SessionState::Running
    }

    /// Send a feature request. Methods with a known capability gate are
    /// checked locally first; an unsupported feature never reaches the
    /// wire. Unknown methods pass through untouched.
    pub async fn request(&self, method: &str, params: Option<Value>) -> LspResult<Value> {
        self.check_capability(method)?;
        self.session.request(method, params).await
    }

    /// [`Client::request`] with an explicit deadline.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> LspResult<Value> {
        self.check_capability(method)?;
        self.session
            .request_with_timeout(method, params, deadline)
            .await
    }

    /// Fire-and-forget notification to the server.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        self.check_capability(method)?;
        self.session.notify(method, params).await
    }

    /// See [`Session::on_notification`]; one handler per method, replace on
    /// re-registration.
    pub async fn on_notification<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.session.on_notification(method, handler).await;
    }

    /// See [`Session::on_request`].
    pub async fn on_request<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value, ResponseError> + Send + Sync + 'static,
    {
        self.session.on_request(method, handler).await;
    }

    /// One-shot process-exit signal; `Some` exactly once when the backing
    /// server is gone.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Whether teardown was requested, as opposed to the server dying on
    /// its own. The registry's crash monitor uses this to tell the two
    /// apart.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Graceful teardown: the `shutdown`/`exit` sequence, then process
    /// termination with the configured grace period.
    pub(crate) async fn shutdown(&self) {
        self.stopping.store(true, Ordering::Release);

        if let Err(e) = self.session.shutdown().await {
            tracing::debug!("{}: shutdown handshake skipped: {}", self.key, e);
        }

        if let Some(process) = &self.process {
            process.terminate(self.shutdown_grace).await;
        }
    }

    /// Hard teardown after a crash: fail all pending requests, no wire
    /// traffic.
    pub(crate) async fn abort(&self) {
        self.session.close().await;
    }

    fn check_capability(&self, method: &str) -> LspResult<()> {
        if let Some(feature) = feature_for_method(method)
            && !self.capabilities.supports(feature)
        {
            return Err(LspError::CapabilityNotSupported {
                server: self.config.name.clone(),
                feature: feature.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("key", &self.key)
            .field("server", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Baseline handlers every session gets before `initialize`: route server
/// log traffic into tracing and acknowledge the handful of server requests
/// that only exist for bookkeeping.
async fn register_default_handlers(session: &Arc<Session>, server: &str) {
    let name = server.to_string();
    session
        .on_notification("window/logMessage", move |params| {
            log_server_message(&name, &params);
        })
        .await;

    let name = server.to_string();
    session
        .on_notification("window/showMessage", move |params| {
            log_server_message(&name, &params);
        })
        .await;

    session
        .on_request("client/registerCapability", |_| Ok(Value::Null))
        .await;
    session
        .on_request("client/unregisterCapability", |_| Ok(Value::Null))
        .await;
    session
        .on_request("window/workDoneProgress/create", |_| Ok(Value::Null))
        .await;
    // One empty section per requested item, until the shell registers its
    // own handler.
    session
        .on_request("workspace/configuration", |params| {
            let items = params
                .get("items")
                .and_then(|i| i.as_array())
                .map(|arr| arr.len())
                .unwrap_or(0);
            Ok(Value::Array(vec![
                Value::Object(serde_json::Map::new());
                items
            ]))
        })
        .await;
}

fn log_server_message(server: &str, params: &Value) {
    let Some(message) = params.get("message").and_then(|m| m.as_str()) else {
        return;
    };
    let kind = params
        .get("type")
        .and_then(|t| serde_json::from_value::<MessageType>(t.clone()).ok());

    match kind {
        Some(MessageType::Error) => tracing::error!("{}: {}", server, message),
        Some(MessageType::Warning) => tracing::warn!("{}: {}", server, message),
        Some(MessageType::Info) => tracing::info!("{}: {}", server, message),
        _ => tracing::debug!("{}: {}", server, message),
    }
}
