//! Peer link state.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ferric_proto::{irc_eq, Message};

use crate::config::ConnectBlock;
use crate::state::client::Client;

/// A fully-established link to a directly-connected server.
pub struct PeerLink {
    /// The server's Client entry.
    pub client: Arc<Client>,
    pub name: String,
    pub sid: String,
    /// The connect block the link authenticated against; hub and leaf
    /// rules for introductions come from here.
    pub block: ConnectBlock,
    /// Negotiated capability set (ours AND theirs).
    caps: AtomicU32,
    /// Send side of the burst still in flight.
    pub bursting: AtomicBool,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
}

impl PeerLink {
    pub fn new(client: Arc<Client>, name: &str, sid: &str, caps: u32, block: ConnectBlock) -> PeerLink {
        PeerLink {
            client,
            name: name.to_string(),
            sid: sid.to_string(),
            block,
            caps: AtomicU32::new(caps),
            bursting: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
        }
    }

    pub fn caps(&self) -> u32 {
        self.caps.load(Ordering::Relaxed)
    }

    pub fn has_cap(&self, bit: u32) -> bool {
        self.caps() & bit != 0
    }

    pub fn strip_cap(&self, bit: u32) {
        self.caps.fetch_and(!bit, Ordering::Relaxed);
    }

    /// Queue a message on the link. False means the sendq overflowed
    /// and the link must be scheduled for exit.
    pub fn send(&self, msg: Message) -> bool {
        self.client.send(msg)
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("name", &self.name)
            .field("sid", &self.sid)
            .field("caps", &self.caps())
            .finish()
    }
}

/// Directly-connected peers, by SID.
#[derive(Debug, Default)]
pub struct PeerMap {
    by_sid: DashMap<String, Arc<PeerLink>>,
}

impl PeerMap {
    pub fn new() -> PeerMap {
        PeerMap::default()
    }

    pub fn insert(&self, link: Arc<PeerLink>) {
        self.by_sid.insert(link.sid.clone(), link);
    }

    pub fn remove(&self, sid: &str) -> Option<Arc<PeerLink>> {
        self.by_sid.remove(sid).map(|(_, link)| link)
    }

    pub fn get(&self, sid: &str) -> Option<Arc<PeerLink>> {
        self.by_sid.get(sid).map(|e| e.value().clone())
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<PeerLink>> {
        self.by_sid
            .iter()
            .find(|e| irc_eq(&e.value().name, name))
            .map(|e| e.value().clone())
    }

    pub fn is_linked(&self, name_or_sid: &str) -> bool {
        self.get(name_or_sid).is_some() || self.by_name(name_or_sid).is_some()
    }

    /// Snapshot for safe iteration while links drop out mid-walk.
    pub fn snapshot(&self) -> Vec<Arc<PeerLink>> {
        self.by_sid.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_sid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_sid.is_empty()
    }
}
