//! Convoy agent server
//!
//! Accepts long-lived agent connections, routes run commands to the agent
//! they are addressed to and relays agent events to whoever watches.

pub mod config;
pub mod orchestrator;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::ServerConfig;
pub use orchestrator::{AgentInfo, Orchestrator};
pub use registry::{AgentCommand, AgentMessage, AgentRegistry, ConnectionStatus};
pub use transport::{split_websocket, TransportError};
