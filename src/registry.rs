//! Client registry
//!
//! The single source of truth mapping (workspace root, language id) to a
//! live [`Client`]. Enforces at-most-one client per key under arbitrary
//! concurrency, owns crash monitoring and the restart circuit breaker, and
//! reports lifecycle events to the embedding shell over a broadcast
//! channel instead of throwing across the boundary.
//!
//! Only this component creates or destroys clients.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify, RwLock, broadcast};

use crate::client::{Client, ClientKey};
use crate::config::ClientConfig;
use crate::defer::Deferred;
use crate::error::{LspError, LspResult};
use crate::process::{Launcher, ProcessExit, RestartDecision, RestartTracker, StdioLauncher};
use crate::settings::Settings;

/// Lifecycle events the shell subscribes to for UI state.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server exited without being asked to. `restarting` tells the
    /// shell whether an automatic restart is coming.
    Exited {
        key: ClientKey,
        exit: Option<ProcessExit>,
        restarting: bool,
    },
    /// An automatic restart brought the client back.
    Restarted { key: ClientKey },
    /// The client is down for good: restart refused by policy or the
    /// restart attempt itself failed. A later `get_or_start` may try again.
    Failed { key: ClientKey, reason: String },
}

enum Entry {
    /// A creation is in flight; waiters park on the `Notify`.
    Initializing(Arc<Notify>),
    Ready(Arc<Client>),
}

pub struct Registry {
    settings: Settings,
    launcher: Arc<dyn Launcher>,
    clients: RwLock<HashMap<ClientKey, Entry>>,
    restarts: Mutex<HashMap<ClientKey, RestartTracker>>,
    pending_restarts: Mutex<HashMap<ClientKey, Deferred>>,
    events: broadcast::Sender<ClientEvent>,
}

impl Registry {
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_launcher(settings, Arc::new(StdioLauncher))
    }

    pub fn with_launcher(settings: Settings, launcher: Arc<dyn Launcher>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            settings,
            launcher,
            clients: RwLock::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            pending_restarts: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to lifecycle events. Subscribers only see events emitted
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Return the live client for a key, starting one if needed.
    ///
    /// Concurrent calls for the same key never race-create two clients:
    /// the first caller inserts an `Initializing` placeholder and runs the
    /// handshake, later callers park until it resolves and then re-read
    /// the map. A resident whose session is already down is evicted and
    /// replaced.
    pub async fn get_or_start(
        self: &Arc<Self>,
        workspace_root: &Path,
        language_id: &str,
        config: &ClientConfig,
    ) -> LspResult<Arc<Client>> {
        let key = ClientKey::new(workspace_root, language_id);

        loop {
            let (client, notify) = {
                let clients = self.clients.read().await;
                match clients.get(&key) {
                    Some(Entry::Ready(client)) => (Some(Arc::clone(client)), None),
                    Some(Entry::Initializing(notify)) => (None, Some(Arc::clone(notify))),
                    None => (None, None),
                }
            };

            if let Some(client) = client {
                if !client.state().is_down() {
                    return Ok(client);
                }
                // Dead resident, evict and recreate.
                let mut clients = self.clients.write().await;
                if let Some(Entry::Ready(current)) = clients.get(&key)
                    && Arc::ptr_eq(current, &client)
                {
                    clients.remove(&key);
                }
                continue;
            }

            if let Some(notify) = notify {
                // Register interest before re-checking the map, so a
                // creation that resolves in between cannot strand us.
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let clients = self.clients.read().await;
                    match clients.get(&key) {
                        Some(Entry::Initializing(current)) if Arc::ptr_eq(current, &notify) => {}
                        _ => continue,
                    }
                }
                notified.await;
                continue;
            }

            let notify = Arc::new(Notify::new());
            {
                let mut clients = self.clients.write().await;
                if clients.contains_key(&key) {
                    continue;
                }
                clients.insert(key.clone(), Entry::Initializing(Arc::clone(&notify)));
            }

            return self.start_entry(key, config.clone(), notify).await;
        }
    }

    async fn start_entry(
        self: &Arc<Self>,
        key: ClientKey,
        config: ClientConfig,
        notify: Arc<Notify>,
    ) -> LspResult<Arc<Client>> {
        let result = Client::start(
            key.clone(),
            config,
            self.launcher.as_ref(),
            &self.settings,
        )
        .await;

        {
            let mut clients = self.clients.write().await;
            match &result {
                Ok(client) => {
                    clients.insert(key.clone(), Entry::Ready(Arc::clone(client)));
                }
                Err(e) => {
                    tracing::warn!("failed to start client for {}: {}", key, e);
                    clients.remove(&key);
                }
            }
        }
        notify.notify_waiters();

        if let Ok(client) = &result {
            tracing::info!("client started for {}", key);
            self.spawn_monitor(Arc::clone(client));
        }
        result
    }

    /// The live client for a key, if any.
    pub async fn client(&self, workspace_root: &Path, language_id: &str) -> Option<Arc<Client>> {
        let key = ClientKey::new(workspace_root, language_id);
        let clients = self.clients.read().await;
        match clients.get(&key) {
            Some(Entry::Ready(client)) if !client.state().is_down() => Some(Arc::clone(client)),
            _ => None,
        }
    }

    /// Keys with a live client.
    pub async fn active_keys(&self) -> Vec<ClientKey> {
        let clients = self.clients.read().await;
        clients
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Ready(client) if !client.state().is_down() => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run the shutdown/exit sequence for one client and remove it.
    /// Idempotent: stopping an absent client is a no-op. A client still
    /// mid-initialization is left to finish; stop it once it resolves.
    pub async fn stop(&self, workspace_root: &Path, language_id: &str) {
        let key = ClientKey::new(workspace_root, language_id);

        self.pending_restarts.lock().await.remove(&key);
        self.restarts.lock().await.remove(&key);

        let client = {
            let mut clients = self.clients.write().await;
            match clients.get(&key) {
                Some(Entry::Ready(_)) => match clients.remove(&key) {
                    Some(Entry::Ready(client)) => Some(client),
                    _ => None,
                },
                _ => None,
            }
        };

        if let Some(client) = client {
            client.shutdown().await;
            tracing::info!("client stopped for {}", key);
        }
    }

    /// Stop every client under a workspace root, used when the workspace
    /// closes.
    pub async fn stop_all_for_workspace(&self, workspace_root: &Path) {
        let keys: Vec<ClientKey> = {
            let clients = self.clients.read().await;
            clients
                .keys()
                .filter(|key| key.workspace_root == workspace_root)
                .cloned()
                .collect()
        };

        futures::future::join_all(
            keys.iter()
                .map(|key| self.stop(&key.workspace_root, &key.language_id)),
        )
        .await;
    }

    /// Tear down everything, for process exit.
    pub async fn shutdown_all(&self) {
        self.pending_restarts.lock().await.clear();
        self.restarts.lock().await.clear();

        let clients: Vec<Arc<Client>> = {
            let mut clients = self.clients.write().await;
            clients
                .drain()
                .filter_map(|(_, entry)| match entry {
                    Entry::Ready(client) => Some(client),
                    Entry::Initializing(_) => None,
                })
                .collect()
        };

        futures::future::join_all(clients.iter().map(|client| client.shutdown())).await;
    }

    /// Watch one client's process-exit signal and run crash handling when
    /// it fires. Holds only a weak registry reference so a dropped
    /// registry ends the watch.
    fn spawn_monitor(self: &Arc<Self>, client: Arc<Client>) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut watch = client.exit_watch();
            let exit = match watch.wait_for(|e| e.is_some()).await {
                Ok(value) => *value,
                // Exit channel gone without a value: connection-backed
                // client with no process, treat as an unknown death.
                Err(_) => None,
            };

            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.handle_exit(client, exit).await;
        });
    }

    async fn handle_exit(self: Arc<Self>, client: Arc<Client>, exit: Option<ProcessExit>) {
        let key = client.key().clone();

        if client.is_stopping() {
            tracing::debug!("{}: server exited after shutdown", key);
            return;
        }

        tracing::warn!(
            "{}: server exited unexpectedly ({})",
            key,
            exit.map(|e| e.to_string()).unwrap_or_else(|| "unknown".to_string())
        );

        // Fail every pending request before anything else sees the entry.
        client.abort().await;

        {
            let mut clients = self.clients.write().await;
            if let Some(Entry::Ready(current)) = clients.get(&key)
                && Arc::ptr_eq(current, &client)
            {
                clients.remove(&key);
            }
        }

        let decision = {
            let mut restarts = self.restarts.lock().await;
            restarts
                .entry(key.clone())
                .or_default()
                .on_crash(&self.settings.restart, Instant::now())
        };

        self.emit(ClientEvent::Exited {
            key: key.clone(),
            exit,
            restarting: decision.is_restart(),
        });

        match decision {
            RestartDecision::Restart { attempt } => {
                tracing::info!("{}: scheduling restart (attempt {})", key, attempt);
                let registry = Arc::downgrade(&self);
                let config = client.config().clone();
                let restart_key = key.clone();

                let deferred = Deferred::spawn(self.settings.restart.restart_delay(), async move {
                    let Some(registry) = registry.upgrade() else {
                        return;
                    };
                    let result = registry
                        .get_or_start(
                            &restart_key.workspace_root,
                            &restart_key.language_id,
                            &config,
                        )
                        .await;
                    match result {
                        Ok(_) => {
                            tracing::info!("{}: restarted", restart_key);
                            registry.emit(ClientEvent::Restarted { key: restart_key });
                        }
                        Err(e) => {
                            tracing::error!("{}: restart failed: {}", restart_key, e);
                            registry.emit(ClientEvent::Failed {
                                key: restart_key,
                                reason: e.to_string(),
                            });
                        }
                    }
                });
                self.pending_restarts.lock().await.insert(key, deferred);
            }
            RestartDecision::GiveUp { crashes } => {
                let reason = LspError::RestartLimitExceeded {
                    name: client.config().name.clone(),
                    crashes,
                    window: self.settings.restart.cooldown(),
                }
                .to_string();
                tracing::error!("{}: {}", key, reason);
                self.emit(ClientEvent::Failed { key, reason });
            }
        }
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine; the shell may not care.
        let _ = self.events.send(event);
    }
}
