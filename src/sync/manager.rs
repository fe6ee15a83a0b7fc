//! Server link management: the outbound connect scheduler, the
//! handshake driver for both directions, link establishment, and the
//! per-link read/write loop.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use ferric_proto::{Command, LineCodec, Message};

use crate::config::{Config, ConnectBlock};
use crate::state::client::{Client, ServerInfo, Status};
use crate::state::Nexus;
use crate::sync::caps::{self};
use crate::sync::handshake::{Direction, Established, HandshakeMachine};
use crate::sync::link::PeerLink;
use crate::sync::propagation::sendto_server;
use crate::sync::recv;
use crate::sync::split::exit_client;

struct Candidate {
    block: ConnectBlock,
    /// Earliest unix time the next dial may happen.
    hold: i64,
}

/// Rotates through autoconnect blocks, honoring per-class connect
/// frequency and skipping peers that are already linked or whose
/// class is full.
pub struct LinkScheduler {
    candidates: Mutex<VecDeque<Candidate>>,
}

impl LinkScheduler {
    pub fn from_config(config: &Config) -> LinkScheduler {
        LinkScheduler {
            candidates: Mutex::new(
                config
                    .connect
                    .iter()
                    .filter(|b| b.autoconnect)
                    .map(|b| Candidate {
                        block: b.clone(),
                        hold: 0,
                    })
                    .collect(),
            ),
        }
    }

    /// Pick the next candidate due for a dial; it moves to the tail
    /// with its hold pushed out by the class connect frequency.
    pub fn next_due(&self, nexus: &Nexus, now: i64) -> Option<ConnectBlock> {
        let mut candidates = self.candidates.lock();
        let position = candidates.iter().position(|c| {
            if c.hold > now {
                return false;
            }
            if nexus.peers.is_linked(&c.block.name) {
                return false;
            }
            !nexus.classes.find(&c.block.class).is_full()
        })?;
        let mut candidate = candidates.remove(position)?;
        let frequency = nexus
            .classes
            .find(&candidate.block.class)
            .connect_frequency
            .max(60);
        candidate.hold = now + frequency as i64;
        let block = candidate.block.clone();
        candidates.push_back(candidate);
        Some(block)
    }

    pub fn len(&self) -> usize {
        self.candidates.lock().len()
    }
}

/// Dial a peer and bring the link up.
pub async fn outbound_task(nexus: Arc<Nexus>, block: ConnectBlock) {
    let target = format!("{}:{}", block.host, block.port);
    let timeout = Duration::from_secs(nexus.config().general.connect_timeout);
    info!(peer = %block.name, %target, "connecting to server");

    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(peer = %block.name, error = %e, "server connect failed");
            return;
        }
        Err(_) => {
            warn!(peer = %block.name, "server connect timed out");
            return;
        }
    };
    let peer_addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(peer = %block.name, error = %e, "peer address unavailable");
            return;
        }
    };

    let mut framed = Framed::new(stream, LineCodec::new());
    for cmd in HandshakeMachine::opening(&block, &nexus.me.name, &nexus.me.sid, &nexus.me.info) {
        if framed.send(Message::new(cmd)).await.is_err() {
            return;
        }
    }

    let machine = HandshakeMachine::new(
        Direction::Outbound,
        &nexus.me.name,
        &nexus.me.sid,
        &nexus.me.info,
        Some(&block.host),
        &peer_addr.ip().to_string(),
        block.tls,
    );
    drive_link(nexus, framed, peer_addr, machine).await;
}

/// Serve an inbound server connection from the S2S listener.
pub async fn inbound_task(nexus: Arc<Nexus>, stream: TcpStream, peer_addr: SocketAddr) {
    let framed = Framed::new(stream, LineCodec::new());
    let machine = HandshakeMachine::new(
        Direction::Inbound,
        &nexus.me.name,
        &nexus.me.sid,
        &nexus.me.info,
        None,
        &peer_addr.ip().to_string(),
        false,
    );
    drive_link(nexus, framed, peer_addr, machine).await;
}

/// Run the handshake to completion, then the established link loop.
async fn drive_link(
    nexus: Arc<Nexus>,
    mut framed: Framed<TcpStream, LineCodec>,
    peer_addr: SocketAddr,
    mut machine: HandshakeMachine,
) {
    let timeout = Duration::from_secs(nexus.config().general.connect_timeout);

    let established: Established = loop {
        let msg = match tokio::time::timeout(timeout, framed.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                warn!(peer = %peer_addr, error = %e, "handshake framing error");
                return;
            }
            Ok(None) => return,
            Err(_) => {
                warn!(peer = %peer_addr, "handshake timed out");
                return;
            }
        };
        let out = match machine.step(msg.command, &nexus.config(), nexus.now(), |name| {
            nexus.peers.is_linked(name)
        }) {
            Ok(out) => out,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "handshake rejected");
                let _ = framed
                    .send(Message::new(Command::Error(format!("Closing Link: {e}"))))
                    .await;
                return;
            }
        };
        for cmd in out.send {
            if framed.send(Message::new(cmd)).await.is_err() {
                return;
            }
        }
        if let Some(established) = out.established {
            break established;
        }
    };

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let class = nexus.classes.find(&established.block.class);
    let client = Client::new_local(
        nexus.connids.alloc(),
        tx,
        peer_addr.ip(),
        nexus.now(),
        class.sendq.max(1 << 21),
    );
    nexus.registry.add_unknown(client.clone());

    let peer = server_estab(&nexus, &client, established);
    run_link(nexus, peer, framed, rx).await;
}

/// Finalize a verified link: flip the client to server status, index
/// it, announce it to the rest of the mesh, and stream the burst.
pub fn server_estab(nexus: &Nexus, client: &Arc<Client>, established: Established) -> Arc<PeerLink> {
    {
        let mut info = client.info.write();
        info.nick = established.name.clone();
        info.host = established.name.clone();
        info.orig_host = established.name.clone();
        info.uid = Some(established.sid.clone());
        info.realname = established.info.clone();
        info.status = Status::Server;
        info.hopcount = 1;
    }
    *client.server.write() = Some(ServerInfo {
        sid: established.sid.clone(),
        fullcaps: established.fullcaps.clone(),
        caps: established.caps,
        by: None,
    });
    if let Some(local) = &client.local {
        *local.att_connect.lock() = Some(Arc::new(established.block.clone()));
        let class = nexus.classes.find(&established.block.class);
        if let Some(ip) = client.info.read().ip {
            class.try_add_ip(ip);
        }
        *local.att_class.lock() = Some(class);
    }
    nexus.registry.promote_local_server(client);
    nexus
        .scache
        .connect(&established.name, &established.info, false, nexus.now());

    info!(
        peer = %established.name,
        sid = %established.sid,
        caps = %caps::caps_to_names(established.caps).join(" "),
        "server link established"
    );

    // Tell the rest of the mesh about the newcomer, and forward its
    // full capability string.
    sendto_server(
        nexus,
        Some(&established.sid),
        0,
        0,
        &Message::from_server(
            &nexus.me.sid,
            Command::Sid {
                name: established.name.clone(),
                hopcount: 2,
                sid: established.sid.clone(),
                info: established.info.clone(),
            },
        ),
    );
    sendto_server(
        nexus,
        Some(&established.sid),
        crate::sync::caps::cap::ENCAP,
        0,
        &Message::from_server(
            &established.sid,
            Command::Encap {
                target: "*".into(),
                subcommand: "GCAP".into(),
                params: vec![established.fullcaps.clone()],
            },
        ),
    );

    let peer = Arc::new(PeerLink::new(
        client.clone(),
        &established.name,
        &established.sid,
        established.caps,
        established.block,
    ));
    nexus.peers.insert(peer.clone());

    for msg in crate::sync::burst::generate_burst(nexus, peer.caps()) {
        if !peer.send(msg) {
            nexus
                .registry
                .abort_client(&peer.client, "Max SendQ exceeded");
            break;
        }
    }
    peer
}

/// The established-link loop: drain the outbound queue, process
/// inbound traffic, and tear down on error or close.
async fn run_link(
    nexus: Arc<Nexus>,
    peer: Arc<PeerLink>,
    mut framed: Framed<TcpStream, LineCodec>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
) {
    use std::sync::atomic::Ordering;

    let client = peer.client.clone();
    let local = match &client.local {
        Some(local) => local,
        None => return,
    };
    let mut shutdown_rx = nexus.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        let wire_len = msg.to_string().len() as u64 + 2;
                        local.bytes_recv.fetch_add(wire_len, Ordering::Relaxed);
                        local.messages_recv.fetch_add(1, Ordering::Relaxed);
                        peer.bytes_recv.fetch_add(wire_len, Ordering::Relaxed);
                        local.touch(nexus.now());
                        if let Err(e) = recv::handle(&nexus, &peer, msg) {
                            warn!(peer = %peer.name, error = %e, "fatal link error");
                            exit_client(&nexus, &client, None, &e.to_string());
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        exit_client(&nexus, &client, None, &format!("Read error: {e}"));
                        break;
                    }
                    None => {
                        exit_client(&nexus, &client, None, "Remote host closed the connection");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let wire_len = msg.to_string().len() + 2;
                        local.drain(wire_len);
                        peer.bytes_sent.fetch_add(wire_len as u64, Ordering::Relaxed);
                        if framed.send(msg).await.is_err() {
                            exit_client(&nexus, &client, None, "Write error");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = local.closed.notified() => {
                // Exit path already ran; flush what is queued and go.
                while let Ok(msg) = rx.try_recv() {
                    if framed.send(msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
            _ = shutdown_rx.recv() => {
                let _ = framed
                    .send(Message::new(Command::Error("Closing Link: server shutting down".into())))
                    .await;
                break;
            }
        }
    }
}
