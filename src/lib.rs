//!UDP hole punching with a rendezvous server and end-to-end encrypted peer channels.
//!
//!Two peers behind NAT (such as a home gateway) cannot reach each other directly:
//!each side's firewall only admits return traffic for flows it initiated. A third,
//!publicly reachable rendezvous server observes both peers' external addresses and
//!introduces them to each other, after which both sides punch through by sending
//!datagrams simultaneously.
//!
//!## How it works
//!A client greets the server with its public key and both sides derive a shared
//!secret, so everything after the greeting travels encrypted. The client then
//!registers its identity (a hash of its public key) and username. When a client
//!asks to be introduced to a peer id, the server sends each side the other's
//!record, including the externally observed endpoint. Both clients then fire
//!unsolicited datagrams at each other's endpoint until the NAT bindings open,
//!exchange public keys directly, and derive a second, peer-to-peer secret for
//!the chat itself.
//!
//!All of a process's traffic runs over a single UDP socket; logical connections
//!to the server and to the peer are multiplexed over it by source address.
//!
//!## Feature flags
//!For convenience, the crate includes both client and server code by default.
//!Mostly you only use one of them, set features to `client` or `server` instead.
//!
//!```toml
//!puncher = { version = "0.1", default-features = false, features = ["client"] }
//!```
//!
//!- `client`: the session state machine and handshake
//!- `server`: the rendezvous server

pub mod conn;
pub mod crypto;
pub mod error;
pub mod proto;
pub mod tcp;
pub mod udp;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};
