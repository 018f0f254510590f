// Layer 1 - Transport
// Websocket session ownership for the book channel

pub mod websocket;

pub use websocket::{
    create_ping_message, create_subscribe_message, ConnectionError, ConnectionManager,
    ConnectionStats, SessionControl,
};
