//! Channel state carried for mesh synchronization.
//!
//! Channel mode *logic* lives outside the core; what the mesh needs
//! is the data: creation TS, simple modes, members with their status
//! prefixes, the four mask lists, the topic and any mode lock. That
//! is exactly what SJOIN/BMASK/TB/MLOCK carry.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use ferric_proto::irc_to_lower;

/// A topic with its attribution.
#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

/// Channel mask-list selector, matching the BMASK letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskList {
    Ban,
    Except,
    Invex,
    Quiet,
}

impl MaskList {
    pub fn letter(self) -> char {
        match self {
            MaskList::Ban => 'b',
            MaskList::Except => 'e',
            MaskList::Invex => 'I',
            MaskList::Quiet => 'q',
        }
    }

    pub fn from_letter(c: char) -> Option<MaskList> {
        match c {
            'b' => Some(MaskList::Ban),
            'e' => Some(MaskList::Except),
            'I' => Some(MaskList::Invex),
            'q' => Some(MaskList::Quiet),
            _ => None,
        }
    }
}

/// One channel's synchronizable state.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    /// Creation timestamp; conflict currency for SJOIN.
    pub ts: i64,
    /// Simple mode letters without `+`.
    pub modes: String,
    /// Arguments for key/limit style modes, in mode order.
    pub mode_args: Vec<String>,
    /// UID -> status prefixes ("@", "+", "@+", "").
    pub members: HashMap<String, String>,
    pub bans: Vec<String>,
    pub excepts: Vec<String>,
    pub invexes: Vec<String>,
    pub quiets: Vec<String>,
    pub topic: Option<Topic>,
    pub mlock: Option<String>,
}

impl Channel {
    pub fn new(name: &str, ts: i64) -> Channel {
        Channel {
            name: name.to_string(),
            ts,
            modes: "nt".into(),
            mode_args: Vec::new(),
            members: HashMap::new(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invexes: Vec::new(),
            quiets: Vec::new(),
            topic: None,
            mlock: None,
        }
    }

    pub fn list(&self, which: MaskList) -> &Vec<String> {
        match which {
            MaskList::Ban => &self.bans,
            MaskList::Except => &self.excepts,
            MaskList::Invex => &self.invexes,
            MaskList::Quiet => &self.quiets,
        }
    }

    pub fn list_mut(&mut self, which: MaskList) -> &mut Vec<String> {
        match which {
            MaskList::Ban => &mut self.bans,
            MaskList::Except => &mut self.excepts,
            MaskList::Invex => &mut self.invexes,
            MaskList::Quiet => &mut self.quiets,
        }
    }

    /// `+modes args...` as sent in SJOIN.
    pub fn mode_string(&self) -> String {
        if self.modes.is_empty() {
            "+".to_string()
        } else {
            format!("+{}", self.modes)
        }
    }

    /// Drop all modes and mask lists, keeping members; applied to the
    /// losing side of a TS conflict.
    pub fn strip_modes(&mut self) {
        self.modes.clear();
        self.mode_args.clear();
        self.bans.clear();
        self.excepts.clear();
        self.invexes.clear();
        self.quiets.clear();
        self.members.values_mut().for_each(String::clear);
    }

    /// Remove a member; true when the channel emptied.
    pub fn remove_member(&mut self, uid: &str) -> bool {
        self.members.remove(uid);
        self.members.is_empty()
    }
}

/// The channel table.
#[derive(Debug, Default)]
pub struct ChannelMap {
    channels: DashMap<String, Arc<RwLock<Channel>>>,
}

impl ChannelMap {
    pub fn new() -> ChannelMap {
        ChannelMap::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RwLock<Channel>>> {
        self.channels.get(&irc_to_lower(name)).map(|e| e.value().clone())
    }

    pub fn get_or_create(&self, name: &str, ts: i64) -> Arc<RwLock<Channel>> {
        self.channels
            .entry(irc_to_lower(name))
            .or_insert_with(|| Arc::new(RwLock::new(Channel::new(name, ts))))
            .clone()
    }

    pub fn remove(&self, name: &str) {
        self.channels.remove(&irc_to_lower(name));
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Snapshot for safe iteration during burst or split walks.
    pub fn snapshot(&self) -> Vec<Arc<RwLock<Channel>>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop `uid` from every channel, destroying emptied ones.
    /// Returns the names of channels the member was in.
    pub fn remove_member_everywhere(&self, uid: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let mut emptied = Vec::new();
        for entry in self.channels.iter() {
            let mut chan = entry.value().write();
            if chan.members.contains_key(uid) {
                affected.push(chan.name.clone());
                if chan.remove_member(uid) {
                    emptied.push(entry.key().clone());
                }
            }
        }
        for name in emptied {
            self.channels.remove_if(&name, |_, c| c.read().members.is_empty());
        }
        affected
    }
}
