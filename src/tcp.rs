//! Stream variant of [`Conn`].
//!
//! Implements the same connection capability set over a connected
//! `TcpStream` so handler code stays transport-agnostic. The rendezvous
//! flow itself never constructs one.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, RwLock};

use crate::conn::{Conn, Proto};
use crate::error::Result;
use crate::proto::{self, Message};

pub struct TcpConn {
    stream: Mutex<TcpStream>,
    addr: SocketAddr,
    secret: RwLock<Option<[u8; 32]>>,
}

impl TcpConn {
    pub fn new(stream: TcpStream) -> Result<Self> {
        let addr = stream.peer_addr()?;
        Ok(Self {
            stream: Mutex::new(stream),
            addr,
            secret: RwLock::new(None),
        })
    }
}

impl Conn for TcpConn {
    fn send(&self, m: &Message) -> Result<()> {
        let bytes = proto::encode(self, m)?;
        self.stream.lock().unwrap().write_all(&bytes)?;
        Ok(())
    }

    fn proto(&self) -> Proto {
        Proto::Tcp
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
