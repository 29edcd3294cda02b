//! Orchestration server: sessions, nodes, graphs, workflows, and the proxy pool that
//! fronts terminal-backed LLM clients, wired together behind a command dispatcher and
//! a websocket transport.
//!
//! This crate has no notion of what a node *is* beyond `nodeforge_core::Node` — every
//! concrete backend lives there. What this crate owns is everything above a single
//! node: the session namespace, the per-node proxy lifecycle, the workflow runtime,
//! and the wire protocol a client drives all of it through.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph_run;
pub mod proxy_manager;
pub mod registry;
pub mod script;
pub mod session;
pub mod transport;
pub mod workflow;

pub use config::{ConfigLoader, ServerConfig};
pub use dispatcher::{CommandEnvelope, CommandResponse, Dispatcher};
pub use error::{Result, ServerError};
pub use graph_run::{GraphRun, GraphRunState};
pub use proxy_manager::{ProviderConfig, ProxyManager};
pub use registry::SessionRegistry;
pub use script::ScriptRegistry;
pub use session::Session;
pub use transport::{AppState, BroadcastSink};
