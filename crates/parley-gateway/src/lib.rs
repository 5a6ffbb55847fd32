pub mod connection;
pub mod fanout;
pub mod identity;
pub mod registry;

pub use connection::{Gateway, GatewayConfig, HandshakeError, ws_upgrade};
pub use fanout::FanoutReport;
pub use identity::{AuthError, Identity};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound, SendError};
