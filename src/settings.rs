//! Runtime settings
//!
//! One `Settings` value is constructed by the embedding shell (from wherever
//! it keeps configuration) and injected into [`crate::registry::Registry`].
//! Nothing in this crate reads a process-wide singleton.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for sessions and process supervision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default deadline for feature requests.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Deadline for the `initialize` handshake. Servers that index on
    /// startup routinely take far longer than a normal request.
    #[serde(default = "defaults::initialize_timeout_secs")]
    pub initialize_timeout_secs: u64,

    /// How long the `shutdown` request may take before `exit` is sent
    /// anyway, and how long the process gets to die before a force-kill.
    #[serde(default = "defaults::shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub restart: RestartPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            request_timeout_secs: defaults::request_timeout_secs(),
            initialize_timeout_secs: defaults::initialize_timeout_secs(),
            shutdown_grace_secs: defaults::shutdown_grace_secs(),
            restart: RestartPolicy::default(),
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs(self.initialize_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Crash-loop circuit breaker policy.
///
/// A crash during normal operation triggers at most `max_restarts`
/// automatic restarts per cooldown window; further crashes inside the same
/// window are reported as a permanent failure and the client stays down
/// until the shell explicitly starts it again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "defaults::max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "defaults::cooldown_secs")]
    pub cooldown_secs: u64,

    /// Pause before a restart attempt, so a server that dies instantly on
    /// launch does not spin.
    #[serde(default = "defaults::restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: defaults::max_restarts(),
            cooldown_secs: defaults::cooldown_secs(),
            restart_delay_ms: defaults::restart_delay_ms(),
        }
    }
}

impl RestartPolicy {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

mod defaults {
    pub fn request_timeout_secs() -> u64 {
        30
    }
    pub fn initialize_timeout_secs() -> u64 {
        60
    }
    pub fn shutdown_grace_secs() -> u64 {
        5
    }
    pub fn max_restarts() -> u32 {
        1
    }
    pub fn cooldown_secs() -> u64 {
        30
    }
    pub fn restart_delay_ms() -> u64 {
        500
    }
}
