//! GraphQL subscriptions over WebSocket.
//!
//! [`manager::subscribe`] drives one subscription through connect, handshake,
//! streaming and reconnect. The wire format lives in [`protocol`]; the
//! [`transport`] traits let tests and the demo swap the socket for an
//! in-process [`memory`] pair.

pub mod manager;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use manager::{
    SubscriptionError, SubscriptionHandle, SubscriptionListener, SubscriptionOptions,
    SubscriptionState, subscribe,
};
pub use protocol::Dialect;
pub use transport::{Channel, Connector, WsConnector};
