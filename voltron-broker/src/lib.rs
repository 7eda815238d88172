// Voltron request broker
//
// The in-process server a debugger embeds to publish its state:
// - JSON requests over HTTP/1.1 on TCP and a Unix domain socket
// - Immediate dispatch, or parking until the debugger next stops
// - One pluggable adaptor per debugger host

pub mod broker;
pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod protocol;
pub mod queue;
pub mod requests;
pub mod server;

pub use broker::{Broker, BrokerError};
pub use config::BrokerConfig;
pub use dispatcher::Dispatcher;
pub use protocol::{ApiError, ApiResponse, RequestEnvelope};
pub use requests::{Request, RequestKind};
