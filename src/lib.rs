pub mod api;
pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod manager;
pub mod registry;
pub mod transport;
pub mod types;

pub use bus::{HistoryFilter, MessageBus};
pub use config::Config;
pub use connector::AgentConnector;
pub use error::{OrchestratorError, Result};
pub use events::{EventStream, OrchestratorEvent};
pub use manager::{AgentManager, HeartbeatAck, RegisterResponse};
pub use registry::AgentRegistry;
pub use transport::{attach_endpoint, AgentEndpoint, HttpEndpoint};
pub use types::*;
