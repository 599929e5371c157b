//! Langport - Language Server Protocol client core
//!
//! The supervision and protocol layer an editor shell builds on: one
//! language-server subprocess per (workspace root, language id) pair,
//! JSON-RPC over stdio with request/response correlation, capability
//! negotiation, and crash recovery with a restart circuit breaker.
//!
//! The shell owns everything user-visible (status UI, persistence,
//! language detection); this crate owns the wire and the processes:
//!
//! ```no_run
//! use langport::{ClientConfig, LaunchCommand, Registry, Settings};
//! # async fn example() -> langport::LspResult<()> {
//! let registry = Registry::new(Settings::default());
//! let config = ClientConfig::new("rust-analyzer", LaunchCommand::new("rust-analyzer"))
//!     .language("rust");
//!
//! let client = registry
//!     .get_or_start("/work/project".as_ref(), "rust", &config)
//!     .await?;
//!
//! if client.capabilities().supports("hover") {
//!     let hover = client
//!         .request("textDocument/hover", Some(serde_json::json!({
//!             "textDocument": { "uri": "file:///work/project/src/lib.rs" },
//!             "position": { "line": 10, "character": 4 }
//!         })))
//!         .await?;
//!     println!("{hover}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod config;
pub mod defer;
pub mod error;
pub mod process;
pub mod proto;
pub mod registry;
pub mod session;
pub mod settings;
pub mod transport;

pub use capabilities::Capabilities;
pub use client::{Client, ClientKey};
pub use config::{ClientConfig, ConfigStore, LaunchCommand};
pub use defer::Deferred;
pub use error::{LspError, LspResult};
pub use process::{Launcher, ProcessExit, ServerHandle, ServerProcess, StdioLauncher};
pub use registry::{ClientEvent, Registry};
pub use session::{Session, SessionState};
pub use settings::{RestartPolicy, Settings};
