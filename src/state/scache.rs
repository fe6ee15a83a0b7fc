//! Server-name cache.
//!
//! Remembers every server name ever seen on the mesh, with when it
//! was last linked and last split, so /LINKS can be flattened after a
//! delay and /MAP can report recent splits without keeping the
//! original client around.

use parking_lot::RwLock;
use std::collections::HashMap;

use ferric_proto::irc_to_lower;

#[derive(Debug, Clone)]
pub struct ScacheEntry {
    pub name: String,
    pub info: String,
    pub hidden: bool,
    /// Unix time the server was last seen online; 0 if never.
    pub last_online: i64,
    /// Unix time of the most recent split; 0 if currently linked.
    pub last_split: i64,
}

#[derive(Debug, Default)]
pub struct ServerNameCache {
    map: RwLock<HashMap<String, ScacheEntry>>,
}

impl ServerNameCache {
    pub fn new() -> ServerNameCache {
        ServerNameCache::default()
    }

    /// Record a server coming online. Creates or refreshes the entry.
    pub fn connect(&self, name: &str, info: &str, hidden: bool, now: i64) {
        let key = irc_to_lower(name);
        let mut map = self.map.write();
        let entry = map.entry(key).or_insert_with(|| ScacheEntry {
            name: name.to_string(),
            info: String::new(),
            hidden,
            last_online: 0,
            last_split: 0,
        });
        entry.info = info.to_string();
        entry.hidden = hidden;
        entry.last_online = now;
        entry.last_split = 0;
    }

    /// Record a server splitting away.
    pub fn split(&self, name: &str, now: i64) {
        let mut map = self.map.write();
        if let Some(entry) = map.get_mut(&irc_to_lower(name)) {
            entry.last_online = now;
            entry.last_split = now;
        }
    }

    pub fn find(&self, name: &str) -> Option<ScacheEntry> {
        self.map.read().get(&irc_to_lower(name)).cloned()
    }

    /// Non-hidden names, for flattened /LINKS output.
    pub fn visible_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .map
            .read()
            .values()
            .filter(|e| !e.hidden)
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Servers that split within the last `window` seconds.
    pub fn recent_splits(&self, now: i64, window: i64) -> Vec<ScacheEntry> {
        self.map
            .read()
            .values()
            .filter(|e| e.last_split != 0 && now - e.last_split <= window)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_then_split_is_remembered() {
        let cache = ServerNameCache::new();
        cache.connect("Leaf.Example", "a leaf", false, 1000);
        cache.split("leaf.example", 2000);

        let entry = cache.find("LEAF.example").unwrap();
        assert_eq!(entry.name, "Leaf.Example");
        assert_eq!(entry.last_split, 2000);
        assert_eq!(cache.recent_splits(2100, 300).len(), 1);
        assert!(cache.recent_splits(9999, 300).is_empty());
    }

    #[test]
    fn relink_clears_split_mark() {
        let cache = ServerNameCache::new();
        cache.connect("leaf.example", "a leaf", false, 1000);
        cache.split("leaf.example", 2000);
        cache.connect("leaf.example", "a leaf", false, 3000);
        assert_eq!(cache.find("leaf.example").unwrap().last_split, 0);
    }

    #[test]
    fn hidden_servers_stay_out_of_links() {
        let cache = ServerNameCache::new();
        cache.connect("visible.example", "", false, 1);
        cache.connect("hidden.example", "", true, 1);
        assert_eq!(cache.visible_names(), vec!["visible.example".to_string()]);
    }
}
