//! Network side of the agent: login handshake, transport, session state
//! machine and inbound processing.

pub mod auth;
mod pending;
mod processing;
mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthError, Authenticator, Credentials, HttpAuthenticator, KeyManager};
pub use pending::{Delivery, PendingTable};
pub use processing::AgentHandler;
pub use session::{InboundHandler, Session, SessionConfig, SessionError, SessionState};
pub use transport::{Connection, Connector, TransportError, WsConnector};
