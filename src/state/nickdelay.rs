//! Nick-delay reservations.
//!
//! After a collision kill, the losing nickname is reserved for a
//! configured window so the colliding identities cannot immediately
//! reappear. The delay is constant, so insertion order equals expiry
//! order and expiry walks from the front.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use ferric_proto::irc_to_lower;

#[derive(Debug, Default)]
pub struct NickDelay {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// (expiry, casemapped nick), expiry monotonically nondecreasing.
    queue: VecDeque<(i64, String)>,
    held: HashSet<String>,
}

impl NickDelay {
    pub fn new() -> NickDelay {
        NickDelay::default()
    }

    /// Reserve `nick` until `expires_at`. Re-adding extends nothing;
    /// the original reservation stands.
    pub fn add(&self, nick: &str, expires_at: i64) {
        let key = irc_to_lower(nick);
        let mut inner = self.inner.lock();
        if inner.held.insert(key.clone()) {
            inner.queue.push_back((expires_at, key));
        }
    }

    /// Is `nick` currently reserved?
    pub fn is_delayed(&self, nick: &str, now: i64) -> bool {
        let key = irc_to_lower(nick);
        let mut inner = self.inner.lock();
        Self::expire_locked(&mut inner, now);
        inner.held.contains(&key)
    }

    /// Drop reservations whose window has passed. Returns how many.
    pub fn expire(&self, now: i64) -> usize {
        let mut inner = self.inner.lock();
        Self::expire_locked(&mut inner, now)
    }

    fn expire_locked(inner: &mut Inner, now: i64) -> usize {
        let mut removed = 0;
        while let Some((expiry, _)) = inner.queue.front() {
            if *expiry > now {
                break;
            }
            if let Some((_, nick)) = inner.queue.pop_front() {
                inner.held.remove(&nick);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
