//! Transport-agnostic connection abstraction.
//!
//! Handlers never touch sockets; they speak to a [`Conn`], which is one
//! remote endpoint's send path plus an optional symmetric secret. The
//! datagram and stream transports both implement it, so the rendezvous
//! and handshake logic stays transport-agnostic.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::proto::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "UDP"),
            Proto::Tcp => write!(f, "TCP"),
        }
    }
}

pub trait Conn: Send + Sync {
    /// Encode `m` (sealing it if requested) and queue it for delivery.
    fn send(&self, m: &Message) -> Result<()>;

    fn proto(&self) -> Proto;

    fn addr(&self) -> SocketAddr;

    /// The installed symmetric secret, if a key agreement has happened.
    fn secret(&self) -> Option<[u8; 32]>;

    /// Install the symmetric secret. Set once per connection; later
    /// writers of the same derived value are harmless.
    fn set_secret(&self, secret: [u8; 32]);
}

/// All live connections of one transport, keyed by remote address.
///
/// Entries are created lazily on the first inbound datagram from an
/// unseen endpoint, or explicitly when a client opens a connection to a
/// known peer. Entries are never evicted per peer; only tearing down the
/// whole transport releases them.
#[derive(Clone, Default)]
pub struct ConnTable {
    inner: Arc<Mutex<HashMap<String, Arc<dyn Conn>>>>,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<dyn Conn>> {
        self.inner.lock().unwrap().get(&addr.to_string()).cloned()
    }

    /// Return the connection for `addr`, creating it with `f` when absent.
    /// Repeated calls for a known endpoint always hand back the existing
    /// object.
    pub fn or_insert_with<F>(&self, addr: SocketAddr, f: F) -> Arc<dyn Conn>
    where
        F: FnOnce() -> Arc<dyn Conn>,
    {
        self.inner
            .lock()
            .unwrap()
            .entry(addr.to_string())
            .or_insert_with(f)
            .clone()
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<Arc<dyn Conn>> {
        self.inner.lock().unwrap().remove(&addr.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockConn;
    use super::*;

    #[test]
    fn lookup_and_reuse() {
        let table = ConnTable::new();
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();

        assert!(table.get(&addr).is_none());

        let first = table.or_insert_with(addr, || Arc::new(MockConn::new("10.0.0.1:9000")));
        let second = table.or_insert_with(addr, || Arc::new(MockConn::new("10.0.0.1:9000")));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
        assert!(table.get(&addr).is_some());
    }

    #[test]
    fn remove_releases_the_entry() {
        let table = ConnTable::new();
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();

        table.or_insert_with(addr, || Arc::new(MockConn::new("10.0.0.1:9000")));
        assert!(table.remove(&addr).is_some());
        assert!(table.is_empty());
    }
}
