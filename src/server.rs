//! Rendezvous server: greeting, registration, peer introduction.
//!
//! Keeps track of registered peers and cross-introduces two of them on
//! request. All mutable state is the peer registry and the transport's
//! connection table; handler failures are surfaced to the requesting
//! client in the reply's `error` field and never take the server down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::conn::{Conn, ConnTable};
use crate::crypto;
use crate::error::{Error, Result};
use crate::proto::{self, Endpoint, Message, Peer, Registration};
use crate::udp::Transport;

/// Registered peers, keyed by peer id. Registration is idempotent: a
/// peer that registers again overwrites its previous record.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<String, Peer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: Peer) {
        self.inner.lock().unwrap().insert(peer.id.clone(), peer);
    }

    pub fn get(&self, id: &str) -> Option<Peer> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Udp rendezvous server.
pub struct Server {
    transport: Transport,
    registry: Registry,
    public_key: PublicKey,
}

impl Server {
    /// Bind the listen socket and generate this server instance's keypair.
    pub fn new(listen_addr: SocketAddr) -> Result<Self> {
        let transport = Transport::new(listen_addr)?;
        let (secret_key, public_key) = crypto::gen_keypair();
        let registry = Registry::new();

        let reg = registry.clone();
        transport.on_message(move |conns, conn, m| {
            handle(&reg, &secret_key, &public_key, conns, conn, m);
        });

        Ok(Self {
            transport,
            registry,
            public_key,
        })
    }

    /// Start the transport loops and block until they terminate.
    pub fn run(&self) {
        self.start();
        self.transport.wait();
    }

    /// Start the transport loops without blocking.
    pub fn start(&self) {
        self.transport.start();
        log::info!("rendezvous server listening on {}", self.local_addr());
    }

    pub fn stop(&self) {
        self.transport.stop();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn handle(
    registry: &Registry,
    secret_key: &StaticSecret,
    public_key: &PublicKey,
    conns: &ConnTable,
    conn: &Arc<dyn Conn>,
    m: Message,
) {
    log::debug!(
        "request from {} over {} with type {:?}",
        conn.addr(),
        conn.proto(),
        m.kind
    );

    match route(registry, secret_key, public_key, conns, conn.as_ref(), &m) {
        Ok(Some(reply)) => {
            if let Err(e) = conn.send(&reply) {
                log::error!("reply to {} failed: {}", conn.addr(), e);
            }
        }
        Ok(None) => {}
        Err(e) => {
            let _ = conn.send(&Message {
                kind: m.kind,
                error: e.to_string(),
                ..Default::default()
            });
        }
    }
}

fn route(
    registry: &Registry,
    secret_key: &StaticSecret,
    public_key: &PublicKey,
    conns: &ConnTable,
    conn: &dyn Conn,
    m: &Message,
) -> Result<Option<Message>> {
    match m.kind.as_str() {
        proto::GREETING => greeting(secret_key, public_key, conn, m),
        proto::REGISTER => register(registry, conn, m),
        proto::ESTABLISH => establish(registry, conns, m),
        t => Err(Error::protocol(format!("request type {} undefined", t))),
    }
}

/// First contact: install a shared secret for this connection and reply
/// with our public key. The reply stays unencrypted, the client cannot
/// decrypt anything yet.
fn greeting(
    secret_key: &StaticSecret,
    public_key: &PublicKey,
    conn: &dyn Conn,
    m: &Message,
) -> Result<Option<Message>> {
    let encoded = m
        .content
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("greeting must contain the client public key"))?;

    let client_key = crypto::decode_public_key(encoded)?;
    conn.set_secret(crypto::shared_secret(secret_key, &client_key));

    Ok(Some(Message {
        kind: proto::GREETING.into(),
        content: Some(Value::String(crypto::encode_public_key(public_key))),
        ..Default::default()
    }))
}

/// Record the peer under its id, with the endpoint this connection was
/// observed on.
fn register(registry: &Registry, conn: &dyn Conn, m: &Message) -> Result<Option<Message>> {
    if m.peer_id.is_empty() {
        return Err(Error::protocol("registration must carry a peer id"));
    }
    let content = m
        .content
        .clone()
        .ok_or_else(|| Error::protocol("registration content is malformed"))?;
    let registration: Registration = serde_json::from_value(content)?;

    registry.insert(Peer {
        id: m.peer_id.clone(),
        username: registration.username,
        endpoint: Endpoint::from_addr(conn.addr()),
        public_key: registration.public_key,
    });
    log::info!("registered peer {} at {}", m.peer_id, conn.addr());

    Ok(Some(Message {
        kind: proto::REGISTER.into(),
        encrypt: true,
        ..Default::default()
    }))
}

/// Cross-introduce the requester and the target: push the requester's
/// record to the target over its live connection, and return the
/// target's record as the reply. This is the only place two clients
/// learn of each other.
fn establish(registry: &Registry, conns: &ConnTable, m: &Message) -> Result<Option<Message>> {
    let requester = registry
        .get(&m.peer_id)
        .ok_or_else(|| Error::protocol("client is not registered with this server"))?;

    let target_id = m
        .content
        .as_ref()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("establish content is malformed"))?;

    let target = registry.get(target_id).ok_or_else(|| {
        Error::protocol(format!(
            "the peer {} has not registered with the server",
            target_id
        ))
    })?;

    let target_conn = conns.get(&target.endpoint.resolve()?).ok_or_else(|| {
        Error::protocol(format!(
            "could not resolve a connection for the peer {}",
            target_id
        ))
    })?;

    target_conn.send(&Message {
        kind: proto::ESTABLISH.into(),
        content: Some(serde_json::to_value(&requester)?),
        encrypt: true,
        ..Default::default()
    })?;

    Ok(Some(Message {
        kind: proto::ESTABLISH.into(),
        content: Some(serde_json::to_value(&target)?),
        encrypt: true,
        ..Default::default()
    }))
}
