//! Listening sockets and the accept gates.
//!
//! Every accept passes the cheap gates before a Client is even
//! allocated: the throttle cache, the D-line table (exemptions
//! first), the reject cache, and the global per-CIDR cap. Ordering is
//! deliberate: each gate may refuse on its own, and the first refusal
//! is the one counted.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::bans::ConfKind;
use crate::error::CoreError;
use crate::network::conn;
use crate::network::dns::DnsService;
use crate::state::stats::ServerStats;
use crate::state::Nexus;

pub struct Gateway {
    nexus: Arc<Nexus>,
    dns: Arc<DnsService>,
}

impl Gateway {
    pub fn new(nexus: Arc<Nexus>, dns: Arc<DnsService>) -> Gateway {
        Gateway { nexus, dns }
    }

    /// Bind every configured listener and spawn its accept loop.
    pub async fn bind(&self) -> Result<(), CoreError> {
        let config = self.nexus.config();
        if config.listen.is_empty() {
            warn!("no listen blocks configured");
        }
        for block in &config.listen {
            let listener = TcpListener::bind(block.addr()).await?;
            info!(addr = %block.addr(), server = block.server, "listening");
            let nexus = self.nexus.clone();
            let dns = self.dns.clone();
            let is_server_port = block.server;
            tokio::spawn(async move {
                accept_loop(nexus, dns, listener, is_server_port).await;
            });
        }
        Ok(())
    }
}

async fn accept_loop(
    nexus: Arc<Nexus>,
    dns: Arc<DnsService>,
    listener: TcpListener,
    server_port: bool,
) {
    let mut shutdown_rx = nexus.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                ServerStats::bump(&nexus.stats.accepts);

                if server_port {
                    let nexus = nexus.clone();
                    tokio::spawn(async move {
                        crate::sync::manager::inbound_task(nexus, stream, addr).await;
                    });
                    continue;
                }

                if let Some(stream) = run_gates(&nexus, stream, addr.ip()) {
                    let nexus = nexus.clone();
                    let dns = dns.clone();
                    tokio::spawn(async move {
                        conn::client_task(nexus, dns, stream, addr).await;
                    });
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// The pre-Client gates. Returns the stream when the connection may
/// proceed to the pipeline; a refused stream is either dropped or
/// parked on the delayed-exit queue.
fn run_gates(nexus: &Nexus, stream: TcpStream, ip: std::net::IpAddr) -> Option<TcpStream> {
    let now = nexus.now();

    if !nexus.throttle.check(ip, now) {
        refuse(nexus, stream, ip, now, "Too rapid reconnects, slow down");
        return None;
    }

    match crate::hostmask::find_dline(&nexus.matcher, ip) {
        Some(conf) if conf.kind == ConfKind::Dline => {
            refuse(nexus, stream, ip, now, "D-Lined");
            return None;
        }
        // An exemption shadows any D-line underneath; fall through.
        _ => {}
    }

    if nexus.reject.is_rejected(ip, now) {
        // Recently-refused repeat offender: the canned line goes out
        // now, the close lands after the floor.
        ServerStats::bump(&nexus.stats.refused);
        let _ = stream.try_write(b"ERROR :Closing Link: (*** Banned (cache))\r\n");
        let delay = nexus.config().general.reject_delay.max(10) as i64;
        nexus.delayed_exits.push(stream, now + delay);
        return None;
    }

    if !nexus.global_cidr.try_add(ip) {
        refuse(nexus, stream, ip, now, "Too many connections from your network");
        return None;
    }

    Some(stream)
}

fn refuse(nexus: &Nexus, stream: TcpStream, ip: std::net::IpAddr, now: i64, reason: &str) {
    ServerStats::bump(&nexus.stats.refused);
    nexus.reject.note_refused(ip, now);
    let line = format!("ERROR :Closing Link: {ip} ({reason})\r\n");
    let _ = stream.try_write(line.as_bytes());
}
