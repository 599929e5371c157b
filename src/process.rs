//! Server process supervision
//!
//! Owns subprocess lifetime: spawn with piped stdio, watch for exit,
//! terminate gracefully (SIGTERM on Unix) with a force-kill fallback, and
//! account for crashes against the restart circuit breaker.
//!
//! The [`Launcher`] trait is the seam between "give me a connected server"
//! and how the bytes actually flow; production uses [`StdioLauncher`],
//! tests substitute in-memory streams.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::time::timeout;

use crate::config::{ClientConfig, LaunchCommand};
use crate::error::{LspError, LspResult};
use crate::session::{BoxedReader, BoxedWriter};
use crate::settings::RestartPolicy;

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// One spawned language-server subprocess.
///
/// A dedicated monitor task owns the `Child`; this handle only watches the
/// exit channel and requests termination, so nothing here ever blocks on
/// the process.
pub struct ServerProcess {
    pid: u32,
    kill: Mutex<Option<oneshot::Sender<Duration>>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ServerProcess {
    /// Spawn `command` in `root` with stdio piped. Returns the handle plus
    /// the child's stdin/stdout for the transport. Stderr is drained to the
    /// log at debug level.
    pub async fn spawn(
        name: &str,
        command: &LaunchCommand,
        root: &Path,
    ) -> LspResult<(Self, tokio::process::ChildStdin, tokio::process::ChildStdout)> {
        tracing::info!(
            "starting language server '{}': {} {:?}",
            name,
            command.program,
            command.args
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LspError::Spawn(format!("{}: {}", command.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Spawn("failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Spawn("failed to get stdout".to_string()))?;

        // Drain stderr so the child never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("{} stderr: {}", server, line);
                }
            });
        }

        let pid = child.id().unwrap_or_default();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<Duration>();

        let server = name.to_string();
        tokio::spawn(async move {
            let first = tokio::select! {
                status = child.wait() => Ok(status),
                request = kill_rx => Err(request.ok()),
            };

            let status = match first {
                Ok(status) => status,
                Err(Some(grace)) => {
                    #[cfg(unix)]
                    send_sigterm(pid);
                    #[cfg(not(unix))]
                    let _ = child.start_kill();

                    match timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            tracing::warn!(
                                "'{}' ignored termination for {:?}, killing",
                                server,
                                grace
                            );
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    }
                }
                // Handle dropped without terminate: kill_on_drop semantics.
                Err(None) => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => ProcessExit::from(status),
                Err(e) => {
                    tracing::warn!("'{}' wait error: {}", server, e);
                    ProcessExit::unknown()
                }
            };
            tracing::debug!("'{}' exited: {}", server, exit);
            let _ = exit_tx.send(Some(exit));
        });

        Ok((
            Self {
                pid,
                kill: Mutex::new(Some(kill_tx)),
                exit: exit_rx,
            },
            stdin,
            stdout,
        ))
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    /// One-shot exit notification channel; the value becomes `Some` exactly
    /// once, when the process ends.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Request graceful exit and wait for it, force-killing once the grace
    /// period elapses.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if let Some(tx) = self.kill.lock().await.take() {
            let _ = tx.send(grace);
        }
        self.wait_exited().await
    }

    /// Wait until the process has exited.
    pub async fn wait_exited(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.expect("guarded by wait_for"),
            Err(_) => ProcessExit::unknown(),
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// What to do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { attempt: u32 },
    GiveUp { crashes: u32 },
}

impl RestartDecision {
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart { .. })
    }
}

/// Per-client crash accounting for [`RestartPolicy`].
///
/// Crashes inside one cooldown window count against `max_restarts`; once
/// the window expires the budget resets.
#[derive(Debug, Default)]
pub struct RestartTracker {
    window_start: Option<Instant>,
    restarts: u32,
}

impl RestartTracker {
    pub fn on_crash(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        match self.window_start {
            Some(start) if now.duration_since(start) < policy.cooldown() => {}
            _ => {
                self.window_start = Some(now);
                self.restarts = 0;
            }
        }

        if self.restarts < policy.max_restarts {
            self.restarts += 1;
            RestartDecision::Restart {
                attempt: self.restarts,
            }
        } else {
            RestartDecision::GiveUp {
                crashes: self.restarts + 1,
            }
        }
    }
}

/// Everything a client needs from a freshly started server: the byte
/// streams for the transport and the exit signal. `process` is `None` for
/// connections that have no subprocess behind them (sockets, test fakes).
pub struct ServerHandle {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub exit: watch::Receiver<Option<ProcessExit>>,
    pub process: Option<ServerProcess>,
}

/// Starts a server described by a [`ClientConfig`] and hands back its
/// connected streams.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, config: &ClientConfig, root: &Path) -> LspResult<ServerHandle>;
}

/// The production launcher: one subprocess per client, LSP over stdio.
pub struct StdioLauncher;

#[async_trait]
impl Launcher for StdioLauncher {
    async fn launch(&self, config: &ClientConfig, root: &Path) -> LspResult<ServerHandle> {
        let (process, stdin, stdout) =
            ServerProcess::spawn(&config.name, &config.command, root).await?;
        Ok(ServerHandle {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            exit: process.exit_watch(),
            process: Some(process),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_tracker_allows_one_restart_per_window() {
        let policy = RestartPolicy {
            max_restarts: 1,
            cooldown_secs: 30,
            restart_delay_ms: 0,
        };
        let mut tracker = RestartTracker::default();
        let t0 = Instant::now();

        assert_eq!(
            tracker.on_crash(&policy, t0),
            RestartDecision::Restart { attempt: 1 }
        );
        // Second crash inside the window trips the breaker.
        assert_eq!(
            tracker.on_crash(&policy, t0 + Duration::from_secs(5)),
            RestartDecision::GiveUp { crashes: 2 }
        );
        // Once the window expires the budget resets.
        assert_eq!(
            tracker.on_crash(&policy, t0 + Duration::from_secs(40)),
            RestartDecision::Restart { attempt: 1 }
        );
    }

    #[test]
    fn test_restart_tracker_zero_budget_never_restarts() {
        let policy = RestartPolicy {
            max_restarts: 0,
            cooldown_secs: 30,
            restart_delay_ms: 0,
        };
        let mut tracker = RestartTracker::default();
        assert_eq!(
            tracker.on_crash(&policy, Instant::now()),
            RestartDecision::GiveUp { crashes: 1 }
        );
    }

    #[test]
    fn test_process_exit_display() {
        let coded = ProcessExit {
            code: Some(3),
            signal: None,
        };
        assert_eq!(coded.to_string(), "exit code 3");
        assert!(!coded.clean());

        let signalled = ProcessExit {
            code: None,
            signal: Some(15),
        };
        assert_eq!(signalled.to_string(), "signal 15");

        assert_eq!(ProcessExit::unknown().to_string(), "unknown exit");
        assert!(
            ProcessExit {
                code: Some(0),
                signal: None
            }
            .clean()
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::proto::{Message, Request};
        use crate::transport::{MessageWriter, Transport};

        fn command(program: &str, args: &[&str]) -> LaunchCommand {
            let mut cmd = LaunchCommand::new(program);
            for arg in args {
                cmd = cmd.arg(*arg);
            }
            cmd
        }

        #[tokio::test]
        async fn test_exit_code_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let (process, _stdin, _stdout) =
                ServerProcess::spawn("fake", &command("sh", &["-c", "exit 7"]), dir.path())
                    .await
                    .unwrap();

            let exit = process.wait_exited().await;
            assert_eq!(exit.code, Some(7));
            assert!(process.has_exited());
        }

        #[tokio::test]
        async fn test_terminate_sends_sigterm_then_reports_exit() {
            let dir = tempfile::tempdir().unwrap();
            let (process, _stdin, _stdout) =
                ServerProcess::spawn("fake", &command("cat", &[]), dir.path())
                    .await
                    .unwrap();
            assert!(!process.has_exited());

            let exit = process.terminate(Duration::from_secs(5)).await;
            assert_eq!(exit.signal, Some(15));
        }

        #[tokio::test]
        async fn test_spawn_failure_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let err = ServerProcess::spawn(
                "fake",
                &command("definitely-not-a-real-binary-9f3a", &[]),
                dir.path(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, LspError::Spawn(_)));
        }

        #[tokio::test]
        async fn test_stdio_launcher_round_trips_frames() {
            // `cat` echoes our own frames back: enough to prove the
            // launcher wires real subprocess stdio into the codec.
            let dir = tempfile::tempdir().unwrap();
            let config = ClientConfig::new("echo", command("cat", &[]));

            let handle = StdioLauncher.launch(&config, dir.path()).await.unwrap();
            let mut writer = MessageWriter::new(handle.writer);
            let mut transport = Transport::new(handle.reader);

            let request = Request::new(1, "test/echo", Some(serde_json::json!({"x": 1})));
            writer.write(&request).await.unwrap();

            match transport.read_message().await.unwrap() {
                Message::Request(echoed) => {
                    assert_eq!(echoed.method, "test/echo");
                    assert_eq!(echoed.params, request.params);
                }
                other => panic!("expected request, got {:?}", other),
            }

            handle
                .process
                .unwrap()
                .terminate(Duration::from_secs(5))
                .await;
        }
    }
}
