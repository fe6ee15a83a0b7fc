//! Global client registry.
//!
//! Three primary hashes (casemapped nick, UID, original hostname) plus
//! the connid map, and the lifecycle lists: unknowns, local clients,
//! local server links, the global list, and the dead lists drained by
//! the periodic free sweep.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use ferric_proto::irc_to_lower;

use crate::state::client::{Client, Status};

#[derive(Default)]
pub struct Registry {
    by_nick: DashMap<String, Arc<Client>>,
    by_uid: DashMap<String, Arc<Client>>,
    by_host: DashMap<String, Vec<Arc<Client>>>,
    by_connid: DashMap<u32, Arc<Client>>,

    /// Every registered client and server, network-wide.
    pub global: Mutex<Vec<Arc<Client>>>,
    /// Local registered users.
    pub lclients: Mutex<Vec<Arc<Client>>>,
    /// Local connections not yet registered.
    pub unknowns: Mutex<Vec<Arc<Client>>>,
    /// Directly-connected servers.
    pub servers: Mutex<Vec<Arc<Client>>>,
    /// All servers, network-wide.
    pub global_servers: Mutex<Vec<Arc<Client>>>,

    /// Exited locals awaiting the free sweep.
    pub dead: Mutex<Vec<Arc<Client>>>,
    /// Exited remotes awaiting the free sweep.
    pub dead_remote: Mutex<Vec<Arc<Client>>>,
    /// Clients whose write failed mid-processing; exited by the
    /// 1-second sweep rather than inline.
    pub abort: Mutex<Vec<(Arc<Client>, String)>>,
}

fn remove_ptr(list: &Mutex<Vec<Arc<Client>>>, client: &Arc<Client>) {
    list.lock().retain(|c| !Arc::ptr_eq(c, client));
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn find_nick(&self, nick: &str) -> Option<Arc<Client>> {
        self.by_nick.get(&irc_to_lower(nick)).map(|e| e.value().clone())
    }

    pub fn find_uid(&self, uid: &str) -> Option<Arc<Client>> {
        self.by_uid.get(uid).map(|e| e.value().clone())
    }

    /// Find by UID when the name is ID-shaped, otherwise by nick.
    pub fn find_any(&self, name: &str) -> Option<Arc<Client>> {
        if name.as_bytes().first().is_some_and(u8::is_ascii_digit) {
            self.find_uid(name)
        } else {
            self.find_nick(name)
        }
    }

    /// Find a directly-connected or remote server by name or SID.
    pub fn find_server(&self, name: &str) -> Option<Arc<Client>> {
        if name.len() == 3 && name.as_bytes()[0].is_ascii_digit() {
            return self.find_uid(name);
        }
        self.global_servers
            .lock()
            .iter()
            .find(|s| ferric_proto::irc_eq(&s.info.read().nick, name))
            .cloned()
    }

    pub fn find_connid(&self, connid: u32) -> Option<Arc<Client>> {
        self.by_connid.get(&connid).map(|e| e.value().clone())
    }

    /// All clients whose original hostname matches, for per-host caps.
    pub fn clients_on_host(&self, host: &str) -> Vec<Arc<Client>> {
        self.by_host
            .get(&irc_to_lower(host))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn nick_in_use(&self, nick: &str) -> bool {
        self.by_nick.contains_key(&irc_to_lower(nick))
    }

    pub fn uid_in_use(&self, uid: &str) -> bool {
        self.by_uid.contains_key(uid)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Track a freshly-accepted connection.
    pub fn add_unknown(&self, client: Arc<Client>) {
        if let Some(local) = &client.local {
            self.by_connid.insert(local.connid, client.clone());
        }
        self.unknowns.lock().push(client);
    }

    /// Promote a pre-registration connection to a registered local
    /// user. The caller has already assigned nick and UID.
    pub fn promote_local_user(&self, client: &Arc<Client>) {
        remove_ptr(&self.unknowns, client);
        self.index_user(client);
        self.lclients.lock().push(client.clone());
        self.global.lock().push(client.clone());
    }

    /// Insert a remote user learned from the mesh.
    pub fn add_remote_user(&self, client: &Arc<Client>) {
        self.index_user(client);
        self.global.lock().push(client.clone());
    }

    /// Promote a handshaking connection to a directly-connected server.
    pub fn promote_local_server(&self, client: &Arc<Client>) {
        remove_ptr(&self.unknowns, client);
        let info = client.info.read();
        if let Some(uid) = &info.uid {
            self.by_uid.insert(uid.clone(), client.clone());
        }
        self.by_nick.insert(irc_to_lower(&info.nick), client.clone());
        drop(info);
        self.servers.lock().push(client.clone());
        self.global_servers.lock().push(client.clone());
        self.global.lock().push(client.clone());
    }

    /// Insert a remote server learned from the mesh.
    pub fn add_remote_server(&self, client: &Arc<Client>) {
        let info = client.info.read();
        if let Some(uid) = &info.uid {
            self.by_uid.insert(uid.clone(), client.clone());
        }
        self.by_nick.insert(irc_to_lower(&info.nick), client.clone());
        drop(info);
        self.global_servers.lock().push(client.clone());
        self.global.lock().push(client.clone());
    }

    fn index_user(&self, client: &Arc<Client>) {
        let info = client.info.read();
        self.by_nick.insert(irc_to_lower(&info.nick), client.clone());
        if let Some(uid) = &info.uid {
            self.by_uid.insert(uid.clone(), client.clone());
        }
        self.by_host
            .entry(irc_to_lower(&info.orig_host))
            .or_default()
            .push(client.clone());
    }

    /// Rekey a nick change.
    pub fn change_nick(&self, client: &Arc<Client>, new_nick: &str) {
        let old = irc_to_lower(&client.info.read().nick);
        self.by_nick.remove(&old);
        client.info.write().nick = new_nick.to_string();
        self.by_nick.insert(irc_to_lower(new_nick), client.clone());
    }

    /// Unlink a client from every hash and list and park it on the
    /// dead list. The caller must not dereference it afterward; the
    /// free sweep drops the final references.
    pub fn unlink(&self, client: &Arc<Client>) {
        let (nick, uid, host, connids, was_local) = {
            let info = client.info.read();
            (
                irc_to_lower(&info.nick),
                info.uid.clone(),
                irc_to_lower(&info.orig_host),
                client
                    .local
                    .as_ref()
                    .map(|l| l.connids.lock().clone())
                    .unwrap_or_default(),
                client.local.is_some(),
            )
        };

        // Only drop the hash entries if they still point at us; a
        // newer client may have taken the nick during a collision.
        self.by_nick.remove_if(&nick, |_, v| Arc::ptr_eq(v, client));
        if let Some(uid) = uid {
            self.by_uid.remove_if(&uid, |_, v| Arc::ptr_eq(v, client));
        }
        if let Some(mut entry) = self.by_host.get_mut(&host) {
            entry.value_mut().retain(|c| !Arc::ptr_eq(c, client));
            let empty = entry.value().is_empty();
            drop(entry);
            if empty {
                self.by_host.remove_if(&host, |_, v| v.is_empty());
            }
        }
        for connid in connids {
            self.by_connid.remove(&connid);
        }

        remove_ptr(&self.unknowns, client);
        remove_ptr(&self.lclients, client);
        remove_ptr(&self.servers, client);
        remove_ptr(&self.global_servers, client);
        remove_ptr(&self.global, client);

        client.info.write().status = Status::Dead;
        if was_local {
            self.dead.lock().push(client.clone());
        } else {
            self.dead_remote.lock().push(client.clone());
        }
    }

    /// Drop everything parked on the dead lists. Returns how many.
    pub fn reap_dead(&self) -> usize {
        let mut count = 0;
        count += self.dead.lock().drain(..).count();
        count += self.dead_remote.lock().drain(..).count();
        count
    }

    /// Schedule an exit from a failed write; drained by the abort sweep.
    pub fn abort_client(&self, client: &Arc<Client>, reason: &str) {
        let mut abort = self.abort.lock();
        if !abort.iter().any(|(c, _)| Arc::ptr_eq(c, client)) {
            abort.push((client.clone(), reason.to_string()));
        }
    }

    // ------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------

    pub fn local_user_count(&self) -> usize {
        self.lclients.lock().len()
    }

    pub fn global_user_count(&self) -> usize {
        self.global
            .lock()
            .iter()
            .filter(|c| c.status() == Status::Client)
            .count()
    }

    /// Snapshot a list for safe iteration while callbacks mutate it.
    pub fn snapshot(list: &Mutex<Vec<Arc<Client>>>) -> Vec<Arc<Client>> {
        list.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn local_client(nick: &str, uid: &str, host: &str) -> Arc<Client> {
        let (tx, _rx) = mpsc::unbounded_channel();
        std::mem::forget(_rx);
        let client = Client::new_local(1, tx, "192.0.2.7".parse().unwrap(), 1000, 4096);
        {
            let mut info = client.info.write();
            info.nick = nick.to_string();
            info.uid = Some(uid.to_string());
            info.orig_host = host.to_string();
            info.status = Status::Client;
        }
        client
    }

    #[test]
    fn promote_indexes_all_hashes() {
        let registry = Registry::new();
        let client = local_client("Alice", "42XAAAAAA", "host.example");
        registry.add_unknown(client.clone());
        registry.promote_local_user(&client);

        assert!(Arc::ptr_eq(&registry.find_nick("alice").unwrap(), &client));
        assert!(Arc::ptr_eq(&registry.find_uid("42XAAAAAA").unwrap(), &client));
        assert!(Arc::ptr_eq(&registry.find_any("42XAAAAAA").unwrap(), &client));
        assert_eq!(registry.clients_on_host("HOST.example").len(), 1);
        assert_eq!(registry.local_user_count(), 1);
        assert!(registry.unknowns.lock().is_empty());
    }

    #[test]
    fn global_list_holds_each_registered_client_once() {
        let registry = Registry::new();
        let client = local_client("Alice", "42XAAAAAA", "host.example");
        registry.add_unknown(client.clone());
        registry.promote_local_user(&client);

        let count = registry
            .global
            .lock()
            .iter()
            .filter(|c| Arc::ptr_eq(c, &client))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn unlink_removes_everything_and_parks_on_dead() {
        let registry = Registry::new();
        let client = local_client("Alice", "42XAAAAAA", "host.example");
        registry.add_unknown(client.clone());
        registry.promote_local_user(&client);

        registry.unlink(&client);
        assert!(registry.find_nick("alice").is_none());
        assert!(registry.find_uid("42XAAAAAA").is_none());
        assert!(registry.clients_on_host("host.example").is_empty());
        assert_eq!(client.status(), Status::Dead);
        assert_eq!(registry.dead.lock().len(), 1);
        assert_eq!(registry.reap_dead(), 1);
    }

    #[test]
    fn unlink_leaves_a_newer_nick_holder_alone() {
        let registry = Registry::new();
        let old = local_client("Alice", "42XAAAAAA", "a.example");
        let new = local_client("Alice", "42XAAAAAB", "b.example");
        registry.add_unknown(old.clone());
        registry.promote_local_user(&old);
        // Collision winner takes the hash slot.
        registry.add_remote_user(&new);

        registry.unlink(&old);
        assert!(Arc::ptr_eq(&registry.find_nick("alice").unwrap(), &new));
    }

    #[test]
    fn abort_list_deduplicates() {
        let registry = Registry::new();
        let client = local_client("Alice", "42XAAAAAA", "host.example");
        registry.abort_client(&client, "write error");
        registry.abort_client(&client, "write error again");
        assert_eq!(registry.abort.lock().len(), 1);
    }

    #[test]
    fn change_nick_rekeys() {
        let registry = Registry::new();
        let client = local_client("Alice", "42XAAAAAA", "host.example");
        registry.add_unknown(client.clone());
        registry.promote_local_user(&client);
        registry.change_nick(&client, "Alicia");
        assert!(registry.find_nick("alice").is_none());
        assert!(Arc::ptr_eq(&registry.find_nick("ALICIA").unwrap(), &client));
    }
}
