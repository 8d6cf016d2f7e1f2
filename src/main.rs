use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::mpsc::channel;

use structopt::StructOpt;

use puncher::client::{Callbacks, Client};
use puncher::server::Server;
use puncher::udp::Transport;
use puncher::Result;

#[derive(StructOpt, Debug)]
#[structopt(name = "puncher")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "username")]
    username: String,

    #[structopt(long = "server-addr")]
    server_addr: SocketAddr,

    /// Request an introduction to this peer; without it, wait for one.
    #[structopt(long = "peer-id")]
    peer_id: Option<String>,

    #[structopt(long = "local-addr", default_value = "0.0.0.0:0")]
    local_addr: SocketAddr,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:9001")]
    listen_addr: SocketAddr,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let server = Server::new(opt.listen_addr)?;
    println!("rendezvous server listening on {}", server.local_addr());
    server.run();
    Ok(())
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let transport = Transport::new(opt.local_addr)?;

    let (connected_tx, connected_rx) = channel();
    let peer_id = opt.peer_id.clone();
    let callbacks = Callbacks::new()
        .on_registered(move |c: &Client| {
            match &peer_id {
                Some(id) => {
                    println!("registered, requesting introduction to {}", id);
                    if let Err(e) = c.establish(id) {
                        eprintln!("establish failed: {}", e);
                    }
                }
                None => println!("registered, waiting for a peer to connect..."),
            };
        })
        .on_connecting(|c: &Client| println!("connecting to peer {}...", c.peer().username))
        .on_connected(move |c: &Client| {
            println!("connected to {}, type away", c.peer().username);
            let _ = connected_tx.send(());
        })
        .on_message(|c: &Client, text: &str| println!("{}: {}", c.peer().username, text))
        .on_reset(|_: &Client| eprintln!("handshake failed, session reset"));

    let client = Client::new(transport, opt.server_addr, &opt.username, callbacks);
    println!("your peer id: {}", client.self_peer().id);
    client.start()?;

    // chat once the channel is up
    connected_rx.recv().ok();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        if let Err(e) = client.send_message(&line) {
            eprintln!("send failed: {}", e);
        }
    }

    client.stop();
    Ok(())
}
