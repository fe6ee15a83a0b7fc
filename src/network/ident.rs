//! RFC 1413 ident lookup.
//!
//! Opens a stream from our side of the client's connection to port
//! 113 on theirs, asks who owns the remote port pair, and sanitizes
//! the answer. Failure of any kind just means the username keeps its
//! `~` prefix.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;
use tracing::debug;

use ferric_proto::validation::USERLEN;

/// Query the client's identd. `local` and `remote` are the two ends
/// of the client's connection.
pub async fn query(local: SocketAddr, remote: SocketAddr, timeout_secs: u64) -> Option<String> {
    let timeout = Duration::from_secs(timeout_secs.max(1));
    let result = tokio::time::timeout(timeout, run_query(local, remote)).await;
    match result {
        Ok(Some(username)) => Some(username),
        Ok(None) => None,
        Err(_) => {
            debug!(%remote, "ident query timed out");
            None
        }
    }
}

async fn run_query(local: SocketAddr, remote: SocketAddr) -> Option<String> {
    // Bind our side of the client connection, any port.
    let mut bind_addr = local;
    bind_addr.set_port(0);
    let socket = match bind_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4().ok()?,
        SocketAddr::V6(_) => TcpSocket::new_v6().ok()?,
    };
    socket.bind(bind_addr).ok()?;

    let mut ident_addr = remote;
    ident_addr.set_port(113);
    let mut stream = socket.connect(ident_addr).await.ok()?;

    let request = format!("{} , {}\r\n", remote.port(), local.port());
    stream.write_all(request.as_bytes()).await.ok()?;

    let mut buf = [0u8; 512];
    let n = stream.read(&mut buf).await.ok()?;
    let response = std::str::from_utf8(&buf[..n]).ok()?;
    parse_response(response)
}

/// Parse `port , port : USERID : <os> : <username>`, sanitizing the
/// username the way registration expects it.
pub fn parse_response(response: &str) -> Option<String> {
    let mut fields = response.splitn(4, ':');
    let _ports = fields.next()?;
    let verdict = fields.next()?.trim();
    if !verdict.eq_ignore_ascii_case("USERID") {
        return None;
    }
    let _os = fields.next()?;
    let raw = fields.next()?.trim();

    // Some identds prefix an encryption marker; drop it, then cut at
    // the first address separator or space.
    let raw = raw.strip_prefix(['~', '^']).unwrap_or(raw);
    let cut = raw.find(['@', ' ', '\r', '\n']).unwrap_or(raw.len());
    let username = &raw[..cut];
    if username.is_empty() {
        return None;
    }
    Some(username.chars().take(USERLEN).collect())
}
