//! TS6 UID generation.
//!
//! A UID is nine characters: the server's SID followed by a
//! six-character odometer. The first odometer position cycles `A-Z`,
//! the rest `A-Z0-9`, incrementing right-to-left with carries. When
//! the whole odometer wraps, the generator remembers it and from then
//! on verifies every candidate against the live-UID set, so IDs are
//! never reused within a daemon lifetime.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct UidGenerator {
    sid: String,
    current: Mutex<[u8; 6]>,
    /// Set once the odometer has wrapped; collision checks required.
    flipped: AtomicBool,
}

impl UidGenerator {
    pub fn new(sid: &str) -> UidGenerator {
        UidGenerator {
            sid: sid.to_string(),
            current: Mutex::new(*b"AAAAAA"),
            flipped: AtomicBool::new(false),
        }
    }

    /// True once the odometer has wrapped at least once.
    pub fn has_flipped(&self) -> bool {
        self.flipped.load(Ordering::Relaxed)
    }

    /// Produce the next UID. `in_use` reports whether a candidate is
    /// already live; it is consulted only after a full wrap.
    pub fn next<F>(&self, mut in_use: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        loop {
            let candidate = {
                let mut cur = self.current.lock();
                let candidate = format!("{}{}", self.sid, std::str::from_utf8(&cur[..]).unwrap_or("AAAAAA"));
                if self.increment(&mut cur) {
                    self.flipped.store(true, Ordering::Relaxed);
                }
                candidate
            };
            if !self.flipped.load(Ordering::Relaxed) || !in_use(&candidate) {
                return candidate;
            }
        }
    }

    /// Advance the odometer one step. Returns true on full wrap.
    fn increment(&self, cur: &mut [u8; 6]) -> bool {
        for i in (0..6).rev() {
            if i == 0 {
                // First position holds letters only; Z wraps the lot.
                if cur[0] == b'Z' {
                    cur[0] = b'A';
                    return true;
                }
                cur[0] += 1;
                return false;
            }
            match cur[i] {
                b'Z' => {
                    cur[i] = b'0';
                    return false;
                }
                b'9' => {
                    // 9 -> A and carry left.
                    cur[i] = b'A';
                }
                _ => {
                    cur[i] += 1;
                    return false;
                }
            }
        }
        false
    }
}
