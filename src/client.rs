//! Client session: rendezvous handshake, hole punching, peer key exchange.
//!
//! One session per running client. The session greets the rendezvous
//! server, registers, and, once introduced to a peer, fires unsolicited
//! datagrams at the peer's endpoint until the NAT bindings open, then
//! trades public keys directly so the chat itself never touches the
//! server. Inbound messages arrive on dispatch threads in no particular
//! order, so progress is tracked with an explicit phase rather than with
//! sequence numbers.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{sleep, spawn};
use std::time::Duration;

use serde_json::Value;
use x25519_dalek::StaticSecret;

use crate::conn::{Conn, ConnTable};
use crate::crypto;
use crate::error::{Error, Result};
use crate::proto::{self, Message, Peer, Registration};
use crate::udp::Transport;

const PUNCH_ATTEMPTS: usize = 5;
const PUNCH_INTERVAL: Duration = Duration::from_secs(3);

type Hook = Box<dyn Fn(&Client) + Send + Sync>;
type MessageHook = Box<dyn Fn(&Client, &str) + Send + Sync>;

/// Lifecycle hooks, fixed at construction. Unset slots are no-ops.
#[derive(Default)]
pub struct Callbacks {
    registered: Option<Hook>,
    connecting: Option<Hook>,
    connected: Option<Hook>,
    message: Option<MessageHook>,
    reset: Option<Hook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration with the rendezvous server completed.
    pub fn on_registered<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.registered = Some(Box::new(f));
        self
    }

    /// An introduction arrived and hole punching is starting.
    pub fn on_connecting<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.connecting = Some(Box::new(f));
        self
    }

    /// The peer key exchange completed; the channel is usable.
    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.connected = Some(Box::new(f));
        self
    }

    /// A chat message arrived from the peer.
    pub fn on_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client, &str) + Send + Sync + 'static,
    {
        self.message = Some(Box::new(f));
        self
    }

    /// The handshake failed before registration; the session is dead.
    pub fn on_reset<F>(mut self, f: F) -> Self
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(f));
        self
    }
}

/// Where the session is in its lifecycle. The two key flags only exist
/// while connecting; both the hole-punch thread and the dispatch threads
/// read and write them under the one phase lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Greeting,
    Registering,
    Registered,
    Connecting { key_sent: bool, key_received: bool },
    Connected,
}

pub struct Client {
    transport: Arc<Transport>,
    server_addr: SocketAddr,
    secret_key: StaticSecret,
    self_peer: Peer,
    peer: Mutex<Peer>,
    server_conn: Mutex<Option<Arc<dyn Conn>>>,
    peer_conn: Mutex<Option<Arc<dyn Conn>>>,
    phase: Mutex<Phase>,
    callbacks: Callbacks,
    weak: Weak<Client>,
}

impl Client {
    /// Create a session with a fresh identity on top of `transport`.
    pub fn new(
        transport: Transport,
        server_addr: SocketAddr,
        username: &str,
        callbacks: Callbacks,
    ) -> Arc<Self> {
        let (secret_key, public_key) = crypto::gen_keypair();
        let self_peer = Peer {
            id: crypto::peer_id(&public_key),
            username: username.into(),
            public_key: crypto::encode_public_key(&public_key),
            ..Default::default()
        };

        let transport = Arc::new(transport);
        Arc::new_cyclic(|weak: &Weak<Client>| {
            let w = weak.clone();
            transport.on_message(move |conns, conn, m| {
                if let Some(client) = w.upgrade() {
                    client.handle(conns, conn, m);
                }
            });

            Client {
                transport: transport.clone(),
                server_addr,
                secret_key,
                self_peer,
                peer: Mutex::new(Peer::default()),
                server_conn: Mutex::new(None),
                peer_conn: Mutex::new(None),
                phase: Mutex::new(Phase::Idle),
                callbacks,
                weak: weak.clone(),
            }
        })
    }

    /// Start the transport and greet the rendezvous server with our
    /// public key. The rest of the handshake is driven by replies.
    pub fn start(&self) -> Result<()> {
        let conn = self.transport.create_conn(self.server_addr);
        *self.server_conn.lock().unwrap() = Some(conn.clone());
        self.transport.start();

        *self.phase.lock().unwrap() = Phase::Greeting;
        conn.send(&Message {
            kind: proto::GREETING.into(),
            content: Some(Value::String(self.self_peer.public_key.clone())),
            ..Default::default()
        })
    }

    /// Tear down the transport and both loops.
    pub fn stop(&self) {
        self.transport.stop();
    }

    /// Ask the server for an introduction to `target_id`.
    pub fn establish(&self, target_id: &str) -> Result<()> {
        let conn = self
            .server_conn()
            .ok_or(Error::Transport("no server connection"))?;
        conn.send(&Message {
            kind: proto::ESTABLISH.into(),
            peer_id: self.self_peer.id.clone(),
            content: Some(Value::String(target_id.into())),
            encrypt: true,
            ..Default::default()
        })
    }

    /// Send a chat message over the peer channel.
    pub fn send_message(&self, text: &str) -> Result<()> {
        let conn = self
            .peer_conn()
            .ok_or(Error::Transport("not connected to a peer"))?;
        conn.send(&Message {
            kind: proto::MESSAGE.into(),
            peer_id: self.self_peer.id.clone(),
            content: Some(Value::String(text.into())),
            encrypt: true,
            ..Default::default()
        })
    }

    /// Our own identity and registration record.
    pub fn self_peer(&self) -> &Peer {
        &self.self_peer
    }

    /// What we know about the other side so far.
    pub fn peer(&self) -> Peer {
        self.peer.lock().unwrap().clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap()
    }

    pub fn server_conn(&self) -> Option<Arc<dyn Conn>> {
        self.server_conn.lock().unwrap().clone()
    }

    pub fn peer_conn(&self) -> Option<Arc<dyn Conn>> {
        self.peer_conn.lock().unwrap().clone()
    }

    fn handle(&self, _conns: &ConnTable, conn: &Arc<dyn Conn>, m: Message) {
        match self.route(conn, &m) {
            Ok(Some(reply)) => {
                if let Err(e) = conn.send(&reply) {
                    log::error!("reply to {} failed: {}", conn.addr(), e);
                }
            }
            Ok(None) => {}
            Err(e) => self.fail(e),
        }
    }

    /// Before registration completes there is no recovery path short of
    /// redoing the whole handshake, so those failures kill the session.
    /// Later failures degrade to a dropped message.
    fn fail(&self, e: Error) {
        let mut phase = self.phase.lock().unwrap();
        match *phase {
            Phase::Greeting | Phase::Registering => {
                log::error!("handshake failed: {}", e);
                *phase = Phase::Idle;
                drop(phase);
                if let Some(f) = &self.callbacks.reset {
                    f(self);
                }
            }
            _ => log::warn!("dropping message: {}", e),
        }
    }

    fn route(&self, conn: &Arc<dyn Conn>, m: &Message) -> Result<Option<Message>> {
        match m.kind.as_str() {
            proto::GREETING => self.handle_greeting(conn, m),
            proto::REGISTER => self.handle_register(m),
            proto::ESTABLISH => self.handle_establish(m),
            proto::CONNECT => self.handle_connect(conn, m),
            proto::KEY => self.handle_key(conn, m),
            proto::MESSAGE => self.handle_message(conn, m),
            // not ours to answer
            _ => Ok(None),
        }
    }

    /// Server greeting reply: install the server secret and register.
    fn handle_greeting(&self, conn: &Arc<dyn Conn>, m: &Message) -> Result<Option<Message>> {
        if !m.error.is_empty() {
            return Err(Error::Protocol(m.error.clone()));
        }

        let encoded = m
            .content
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("expected a public key with the greeting"))?;
        let server_key = crypto::decode_public_key(encoded)?;
        conn.set_secret(crypto::shared_secret(&self.secret_key, &server_key));

        *self.phase.lock().unwrap() = Phase::Registering;
        Ok(Some(Message {
            kind: proto::REGISTER.into(),
            peer_id: self.self_peer.id.clone(),
            content: Some(serde_json::to_value(Registration {
                username: self.self_peer.username.clone(),
                public_key: self.self_peer.public_key.clone(),
            })?),
            encrypt: true,
            ..Default::default()
        }))
    }

    fn handle_register(&self, m: &Message) -> Result<Option<Message>> {
        if !m.error.is_empty() {
            return Err(Error::Protocol(m.error.clone()));
        }

        *self.phase.lock().unwrap() = Phase::Registered;
        log::info!("registered with rendezvous server as {}", self.self_peer.id);
        if let Some(f) = &self.callbacks.registered {
            f(self);
        }
        Ok(None)
    }

    /// An introduction: either the reply to our own request, or pushed
    /// because another peer asked for us. Both sides run the same code
    /// from here on.
    fn handle_establish(&self, m: &Message) -> Result<Option<Message>> {
        if !m.error.is_empty() {
            return Err(Error::Protocol(m.error.clone()));
        }

        let content = m
            .content
            .clone()
            .ok_or_else(|| Error::protocol("establish content is malformed"))?;
        let introduced: Peer = serde_json::from_value(content)?;
        let addr = introduced.endpoint.resolve()?;

        // one peer at a time; a second introduction to a different
        // endpoint is ignored, the same endpoint just restarts punching
        if let Some(existing) = self.peer_conn() {
            if existing.addr() != addr {
                log::info!("ignoring establish: already connected to a peer");
                return Ok(None);
            }
        }

        *self.peer.lock().unwrap() = Peer {
            id: introduced.id,
            username: introduced.username,
            ..Default::default()
        };

        let client = match self.weak.upgrade() {
            Some(client) => client,
            None => return Ok(None),
        };
        spawn(move || {
            let conn = client.transport.create_conn(addr);
            *client.peer_conn.lock().unwrap() = Some(conn);
            *client.phase.lock().unwrap() = Phase::Connecting {
                key_sent: false,
                key_received: false,
            };

            if let Some(f) = &client.callbacks.connecting {
                f(&client);
            }

            let puncher = client.clone();
            spawn(move || puncher.punch(PUNCH_ATTEMPTS, PUNCH_INTERVAL));
        });

        Ok(None)
    }

    /// The peer's datagram made it through; mirror our public key back.
    fn handle_connect(&self, conn: &Arc<dyn Conn>, m: &Message) -> Result<Option<Message>> {
        self.verify_origin(conn)
            .ok_or_else(|| Error::protocol("received connect message from unknown peer"))?;

        log::debug!("punch request from peer {}, mirroring key", m.peer_id);

        if let Phase::Connecting {
            ref mut key_sent, ..
        } = *self.phase.lock().unwrap()
        {
            *key_sent = true;
        }

        Ok(Some(Message {
            kind: proto::KEY.into(),
            peer_id: self.self_peer.id.clone(),
            content: Some(Value::String(self.self_peer.public_key.clone())),
            ..Default::default()
        }))
    }

    /// The peer's public key: derive the peer secret and mark progress
    /// so the punch loop can observe success.
    fn handle_key(&self, conn: &Arc<dyn Conn>, m: &Message) -> Result<Option<Message>> {
        let canonical = self
            .verify_origin(conn)
            .ok_or_else(|| Error::protocol("received key message from unknown peer"))?;

        let encoded = m
            .content
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("no public key was sent with the key message"))?;
        let peer_key = crypto::decode_public_key(encoded)?;
        canonical.set_secret(crypto::shared_secret(&self.secret_key, &peer_key));

        self.peer.lock().unwrap().public_key = encoded.to_string();
        if let Phase::Connecting {
            ref mut key_received,
            ..
        } = *self.phase.lock().unwrap()
        {
            *key_received = true;
        }

        log::debug!("received key from peer {}", self.peer().username);
        Ok(None)
    }

    /// Ordinary peer traffic once connected.
    fn handle_message(&self, conn: &Arc<dyn Conn>, m: &Message) -> Result<Option<Message>> {
        self.verify_origin(conn)
            .ok_or_else(|| Error::protocol("received chat message from unknown peer"))?;

        let text = m
            .content
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("chat message must carry text content"))?;

        if let Some(f) = &self.callbacks.message {
            f(self, text);
        }
        Ok(None)
    }

    /// A connect/key/message must come from the current peer connection.
    /// The transport may have lazily created a second object for the
    /// same endpoint; adopt that one as canonical and carry on.
    fn verify_origin(&self, conn: &Arc<dyn Conn>) -> Option<Arc<dyn Conn>> {
        let mut guard = self.peer_conn.lock().unwrap();
        let current = guard.as_ref()?;
        if Arc::ptr_eq(current, conn) {
            return Some(conn.clone());
        }
        if current.addr() == conn.addr() {
            *guard = Some(conn.clone());
            return Some(conn.clone());
        }
        None
    }

    fn key_received(&self) -> bool {
        matches!(
            *self.phase.lock().unwrap(),
            Phase::Connecting {
                key_received: true,
                ..
            }
        )
    }

    fn connected(&self) {
        *self.phase.lock().unwrap() = Phase::Connected;
        log::info!("connected to peer {}", self.peer().username);
        if let Some(f) = &self.callbacks.connected {
            f(self);
        }
    }

    /// The hole-punch loop. Sends an unencrypted `connect` at the peer,
    /// waits, and checks whether the peer's key arrived in the meantime.
    /// Bounded; exhaustion leaves the session unconnected and is not
    /// fatal.
    fn punch(&self, attempts: usize, interval: Duration) {
        for _ in 0..attempts {
            if self.key_received() {
                self.connected();
                return;
            }

            let conn = match self.peer_conn() {
                Some(conn) => conn,
                None => return,
            };
            log::debug!("punching through to peer at {}", conn.addr());
            if let Err(e) = conn.send(&Message {
                kind: proto::CONNECT.into(),
                peer_id: self.self_peer.id.clone(),
                ..Default::default()
            }) {
                log::warn!("punch send failed: {}", e);
            }

            sleep(interval);
        }

        // the key may have landed during the final wait
        if self.key_received() {
            self.connected();
            return;
        }
        log::warn!("could not connect to peer {}", self.peer().username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::testing::MockConn;
    use std::sync::mpsc::{channel, Sender};

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn transport() -> Transport {
        Transport::new("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    fn quiet_client(callbacks: Callbacks) -> Arc<Client> {
        // the transport is never started; queued sends just sit there
        let server_addr = "127.0.0.1:9".parse().unwrap();
        Client::new(transport(), server_addr, "alice", callbacks)
    }

    fn install_peer_conn(client: &Client, conn: &Arc<MockConn>, phase: Phase) {
        let conn: Arc<dyn Conn> = conn.clone();
        *client.peer_conn.lock().unwrap() = Some(conn);
        *client.phase.lock().unwrap() = phase;
    }

    fn notify(tx: Sender<()>) -> impl Fn(&Client) + Send + Sync + 'static {
        move |_: &Client| {
            let _ = tx.send(());
        }
    }

    #[test]
    fn punch_exhausts_against_a_silent_peer() {
        let (connected_tx, connected_rx) = channel();
        let client = quiet_client(Callbacks::new().on_connected(notify(connected_tx)));

        let peer = Arc::new(MockConn::new("127.0.0.1:5000"));
        install_peer_conn(
            &client,
            &peer,
            Phase::Connecting {
                key_sent: false,
                key_received: false,
            },
        );

        client.punch(5, Duration::from_millis(10));

        let sent = peer.sent.lock().unwrap();
        assert_eq!(sent.len(), 5);
        assert!(sent.iter().all(|m| m.kind == proto::CONNECT));
        assert!(connected_rx.try_recv().is_err());
        assert!(matches!(client.phase(), Phase::Connecting { .. }));
    }

    #[test]
    fn punch_stops_once_the_key_arrived() {
        let (connected_tx, connected_rx) = channel();
        let client = quiet_client(Callbacks::new().on_connected(notify(connected_tx)));

        let peer = Arc::new(MockConn::new("127.0.0.1:5000"));
        install_peer_conn(
            &client,
            &peer,
            Phase::Connecting {
                key_sent: true,
                key_received: true,
            },
        );

        client.punch(5, Duration::from_millis(10));

        assert!(peer.sent.lock().unwrap().is_empty());
        connected_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(client.phase(), Phase::Connected);
    }

    #[test]
    fn messages_from_unknown_origins_are_dropped() {
        let (message_tx, message_rx) = channel::<String>();
        let client = quiet_client(Callbacks::new().on_message(move |_, text| {
            let _ = message_tx.send(text.into());
        }));

        let peer = Arc::new(MockConn::new("127.0.0.1:5000"));
        install_peer_conn(&client, &peer, Phase::Connected);

        let stranger: Arc<dyn Conn> = Arc::new(MockConn::new("127.0.0.1:6000"));
        let conns = ConnTable::new();
        client.handle(
            &conns,
            &stranger,
            Message {
                kind: proto::MESSAGE.into(),
                content: Some(Value::String("hi".into())),
                ..Default::default()
            },
        );

        assert!(message_rx.try_recv().is_err());
        // the stranger was not adopted
        let expected: Arc<dyn Conn> = peer.clone();
        assert!(Arc::ptr_eq(&client.peer_conn().unwrap(), &expected));
    }

    #[test]
    fn same_endpoint_different_object_is_adopted() {
        let client = quiet_client(Callbacks::new());

        let original = Arc::new(MockConn::new("127.0.0.1:5000"));
        install_peer_conn(
            &client,
            &original,
            Phase::Connecting {
                key_sent: false,
                key_received: false,
            },
        );

        // the transport lazily created a second conn for the endpoint
        let duplicate = Arc::new(MockConn::new("127.0.0.1:5000"));
        let as_dyn: Arc<dyn Conn> = duplicate.clone();
        let conns = ConnTable::new();
        client.handle(
            &conns,
            &as_dyn,
            Message {
                kind: proto::CONNECT.into(),
                peer_id: "other".into(),
                ..Default::default()
            },
        );

        // adopted as canonical, and the key reply went out over it
        assert!(Arc::ptr_eq(&client.peer_conn().unwrap(), &as_dyn));
        let sent = duplicate.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, proto::KEY);
        assert_eq!(
            client.phase(),
            Phase::Connecting {
                key_sent: true,
                key_received: false,
            }
        );
    }

    #[test]
    fn key_message_installs_the_peer_secret() {
        let client = quiet_client(Callbacks::new());
        let (peer_secret, peer_public) = crypto::gen_keypair();

        let peer = Arc::new(MockConn::new("127.0.0.1:5000"));
        install_peer_conn(
            &client,
            &peer,
            Phase::Connecting {
                key_sent: true,
                key_received: false,
            },
        );

        let as_dyn: Arc<dyn Conn> = peer.clone();
        let conns = ConnTable::new();
        client.handle(
            &conns,
            &as_dyn,
            Message {
                kind: proto::KEY.into(),
                peer_id: "other".into(),
                content: Some(Value::String(crypto::encode_public_key(&peer_public))),
                ..Default::default()
            },
        );

        // both sides derived the same channel secret
        let own_public = crypto::decode_public_key(&client.self_peer().public_key).unwrap();
        assert_eq!(
            peer.secret().unwrap(),
            crypto::shared_secret(&peer_secret, &own_public)
        );
        assert!(client.key_received());
    }

    #[cfg(feature = "server")]
    #[test]
    fn end_to_end_chat() {
        use crate::server::Server;

        let server = Server::new("127.0.0.1:0".parse().unwrap()).unwrap();
        server.start();
        let server_addr = server.local_addr();

        let (a_registered_tx, a_registered_rx) = channel();
        let (a_connected_tx, a_connected_rx) = channel();
        let alice = Client::new(
            transport(),
            server_addr,
            "alice",
            Callbacks::new()
                .on_registered(notify(a_registered_tx))
                .on_connected(notify(a_connected_tx)),
        );

        let (b_registered_tx, b_registered_rx) = channel();
        let (b_connected_tx, b_connected_rx) = channel();
        let (b_message_tx, b_message_rx) = channel::<String>();
        let bob = Client::new(
            transport(),
            server_addr,
            "bob",
            Callbacks::new()
                .on_registered(notify(b_registered_tx))
                .on_connected(notify(b_connected_tx))
                .on_message(move |_, text| {
                    let _ = b_message_tx.send(text.into());
                }),
        );

        alice.start().unwrap();
        bob.start().unwrap();
        a_registered_rx.recv_timeout(TIMEOUT).unwrap();
        b_registered_rx.recv_timeout(TIMEOUT).unwrap();

        alice.establish(&bob.self_peer().id).unwrap();

        a_connected_rx.recv_timeout(TIMEOUT).unwrap();
        b_connected_rx.recv_timeout(TIMEOUT).unwrap();

        assert_eq!(alice.peer().username, "bob");
        assert_eq!(bob.peer().username, "alice");
        assert_eq!(alice.peer().id, bob.self_peer().id);

        alice.send_message("hi").unwrap();
        assert_eq!(b_message_rx.recv_timeout(TIMEOUT).unwrap(), "hi");

        alice.stop();
        bob.stop();
        server.stop();
    }
}
