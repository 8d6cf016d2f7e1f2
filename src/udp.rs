//! UDP transport: one socket multiplexing many logical connections.
//!
//! The transport owns the socket and two long-running threads. The
//! receiver reads datagrams with a short deadline so the stop signal is
//! observed between reads, resolves (or lazily creates) the [`Conn`] for
//! the source address, and hands decoding plus the message callback to a
//! dispatch thread so a slow handler never blocks the socket. The sender
//! drains a bounded queue and is the only writer, so concurrent senders
//! never interleave datagrams.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{spawn, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::conn::{Conn, ConnTable, Proto};
use crate::error::{Error, Result};
use crate::proto::{self, Message};

const RECV_BUF: usize = 2048;
const SEND_QUEUE: usize = 100;
const LOOP_TIMEOUT: Duration = Duration::from_secs(1);

struct Payload {
    bytes: Vec<u8>,
    addr: SocketAddr,
}

/// One remote endpoint reachable over the shared socket.
pub struct UdpConn {
    tx: SyncSender<Payload>,
    addr: SocketAddr,
    secret: RwLock<Option<[u8; 32]>>,
}

impl UdpConn {
    fn new(tx: SyncSender<Payload>, addr: SocketAddr) -> Self {
        Self {
            tx,
            addr,
            secret: RwLock::new(None),
        }
    }
}

impl Conn for UdpConn {
    fn send(&self, m: &Message) -> Result<()> {
        let bytes = proto::encode(self, m)?;
        self.tx
            .send(Payload {
                bytes,
                addr: self.addr,
            })
            .map_err(|_| Error::Transport("transport has stopped"))
    }

    fn proto(&self) -> Proto {
        Proto::Udp
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn secret(&self) -> Option<[u8; 32]> {
        *self.secret.read().unwrap()
    }

    fn set_secret(&self, secret: [u8; 32]) {
        *self.secret.write().unwrap() = Some(secret);
    }
}

type MessageCallback = dyn Fn(&ConnTable, &Arc<dyn Conn>, Message) + Send + Sync;

/// The shared socket plus its receive and send loops.
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    conns: ConnTable,
    tx: SyncSender<Payload>,
    rx: Mutex<Option<Receiver<Payload>>>,
    callback: Mutex<Arc<MessageCallback>>,
    exit: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr) -> Result<Self> {
        let socket = Self::create_socket(bind_addr)?;
        socket.set_read_timeout(Some(LOOP_TIMEOUT))?;
        let local_addr = socket.local_addr()?;
        let (tx, rx) = sync_channel(SEND_QUEUE);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            conns: ConnTable::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            callback: Mutex::new(Arc::new(|_, _, _| {})),
            exit: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        })
    }

    fn create_socket(bind_addr: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        Ok(socket.into())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conns(&self) -> &ConnTable {
        &self.conns
    }

    /// Register the inbound message callback. One slot; the last
    /// registration before [`start`](Self::start) wins.
    pub fn on_message<F>(&self, f: F)
    where
        F: Fn(&ConnTable, &Arc<dyn Conn>, Message) + Send + Sync + 'static,
    {
        *self.callback.lock().unwrap() = Arc::new(f);
    }

    /// Register a connection to an endpoint learned out-of-band, before
    /// any datagram has arrived from it. Normalizes to the existing
    /// object when the endpoint is already known.
    pub fn create_conn(&self, addr: SocketAddr) -> Arc<dyn Conn> {
        let tx = self.tx.clone();
        self.conns
            .or_insert_with(addr, || Arc::new(UdpConn::new(tx, addr)))
    }

    /// Spawn the receive and send loops. Idempotent.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap();
        if !handles.is_empty() {
            return;
        }
        let rx = match self.rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => return,
        };

        let socket = self.socket.clone();
        let exit = self.exit.clone();
        handles.push(spawn(move || sender(socket, rx, exit)));

        let socket = self.socket.clone();
        let exit = self.exit.clone();
        let conns = self.conns.clone();
        let tx = self.tx.clone();
        let callback = self.callback.lock().unwrap().clone();
        handles.push(spawn(move || receiver(socket, conns, tx, callback, exit)));
    }

    /// Signal both loops to exit and block until they have. The socket
    /// is released only after the receiver has observed the signal, so
    /// shutdown never races an in-flight read.
    pub fn stop(&self) {
        self.exit.store(true, Relaxed);
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        log::debug!("udp transport stopped");
    }

    /// Block until the loops terminate on their own.
    pub fn wait(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

fn sender(socket: Arc<UdpSocket>, rx: Receiver<Payload>, exit: Arc<AtomicBool>) {
    loop {
        match rx.recv_timeout(LOOP_TIMEOUT) {
            Ok(p) => {
                if let Err(e) = socket.send_to(&p.bytes, p.addr) {
                    log::error!("send to {} failed: {}", p.addr, e);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if exit.load(Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("udp sender exited");
}

fn receiver(
    socket: Arc<UdpSocket>,
    conns: ConnTable,
    tx: SyncSender<Payload>,
    callback: Arc<MessageCallback>,
    exit: Arc<AtomicBool>,
) {
    let mut buf = [0u8; RECV_BUF];

    loop {
        if exit.load(Relaxed) {
            break;
        }

        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                log::error!("udp receiver terminated: {}", e);
                break;
            }
        };

        let conn = {
            let tx = tx.clone();
            conns.or_insert_with(addr, || Arc::new(UdpConn::new(tx, addr)))
        };

        let bytes = buf[..n].to_vec();
        let conns = conns.clone();
        let callback = callback.clone();
        spawn(move || dispatch(conns, conn, bytes, callback));
    }
    log::debug!("udp receiver exited");
}

fn dispatch(conns: ConnTable, conn: Arc<dyn Conn>, bytes: Vec<u8>, callback: Arc<MessageCallback>) {
    let m = match proto::decode(conn.as_ref(), &bytes) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("dropping datagram from {}: {}", conn.addr(), e);
            // best effort; the sender may not even speak the protocol
            let _ = conn.send(&Message {
                error: "malformed payload was sent".into(),
                ..Default::default()
            });
            return;
        }
    };

    callback(&conns, &conn, m);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Instant;

    fn transport() -> Transport {
        Transport::new("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn dispatches_inbound_datagrams() {
        let a = transport();
        let (tx, rx) = channel();
        a.on_message(move |conns, conn, m| {
            let _ = tx.send((conns.len(), conn.addr(), m));
        });
        a.start();

        let b = transport();
        b.start();
        let conn = b.create_conn(a.local_addr());
        conn.send(&Message {
            kind: proto::GREETING.into(),
            ..Default::default()
        })
        .unwrap();

        let (len, addr, m) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(m.kind, proto::GREETING);
        assert_eq!(addr, b.local_addr());
        assert_eq!(len, 1);
        // the receiver created the conn lazily
        assert!(a.conns().get(&b.local_addr()).is_some());

        a.stop();
        b.stop();
    }

    #[test]
    fn create_conn_normalizes_repeated_calls() {
        let t = transport();
        let addr = "127.0.0.1:4000".parse().unwrap();

        let first = t.create_conn(addr);
        let second = t.create_conn(addr);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(t.conns().len(), 1);
    }

    #[test]
    fn replies_to_malformed_datagrams() {
        let t = transport();
        t.start();

        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        probe.send_to(b"definitely not json", t.local_addr()).unwrap();

        let mut buf = [0u8; RECV_BUF];
        let (n, _) = probe.recv_from(&mut buf).unwrap();
        let m: Message = serde_json::from_slice(&buf[..n]).unwrap();
        assert!(!m.error.is_empty());

        t.stop();
    }

    #[test]
    fn stop_joins_both_loops() {
        let t = transport();
        t.start();

        let begin = Instant::now();
        t.stop();
        assert!(begin.elapsed() < Duration::from_secs(5));
    }
}
