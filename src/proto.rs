//! Wire envelope and codec.
//!
//! One datagram carries one JSON-encoded [`Message`], optionally wrapped in
//! authenticated ciphertext. There is no header bit saying which: the
//! decoder first tries a plain parse and, when that fails and the
//! connection holds a secret, decrypts and parses again. This lets the
//! unencrypted greeting and all later encrypted traffic share one entry
//! point.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conn::Conn;
use crate::crypto;
use crate::error::{Error, Result};

pub const GREETING: &str = "greeting";
pub const REGISTER: &str = "register";
pub const ESTABLISH: &str = "establish";
pub const CONNECT: &str = "connect";
pub const KEY: &str = "key";
pub const MESSAGE: &str = "message";

/// The one message shape every handler speaks.
///
/// `encrypt` is a local instruction to [`encode`], never serialized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "peerID", default, skip_serializing_if = "String::is_empty")]
    pub peer_id: String,

    /// Non-empty signals a protocol failure that aborts the flow that
    /// sent the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    /// Handler-specific payload.
    #[serde(rename = "data", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    #[serde(skip)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    pub fn resolve(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .ip
            .parse()
            .map_err(|_| Error::protocol(format!("invalid endpoint address {}", self.ip)))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A peer as known to the rendezvous server and to the other side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(default)]
    pub endpoint: Endpoint,

    #[serde(rename = "publicKey", default, skip_serializing_if = "String::is_empty")]
    pub public_key: String,
}

/// Content of a `register` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub username: String,

    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Decode a raw datagram received on `conn`.
///
/// Tries a plain parse first; on failure, falls back to decrypting with
/// the connection secret when one is installed.
pub fn decode(conn: &dyn Conn, buf: &[u8]) -> Result<Message> {
    match serde_json::from_slice(buf) {
        Ok(m) => Ok(m),
        Err(e) => match conn.secret() {
            Some(secret) => {
                let plain = crypto::open(&secret, buf)?;
                Ok(serde_json::from_slice(&plain)?)
            }
            None => Err(e.into()),
        },
    }
}

/// Encode `m` for the wire, sealing it with the connection secret when
/// `m.encrypt` is set. Encrypting without an installed secret is an error;
/// callers are expected to never get that far, but the codec enforces it.
pub fn encode(conn: &dyn Conn, m: &Message) -> Result<Vec<u8>> {
    let buf = serde_json::to_vec(m)?;
    if !m.encrypt {
        return Ok(buf);
    }

    match conn.secret() {
        Some(secret) => crypto::seal(&secret, &buf),
        None => Err(Error::Crypto("cannot encrypt with an empty secret")),
    }
}
