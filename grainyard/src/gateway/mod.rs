//! Client-facing gateway and the client-side connection to it.

mod client;
#[allow(clippy::module_inception)]
mod gateway;

pub use client::ClientConnection;
pub use gateway::{
    gateway_target, ClientState, Gateway, CLIENT_KIND, GATEWAY_INTERFACE_ID, HANDSHAKE_METHOD_ID,
};
