//! Eviction policies for reclaiming pages under pressure.
//!
//! Each policy tracks key recency/ordering metadata only; the cache body
//! owns the actual entries and calls back into the policy on every insert,
//! access, and removal. `select_victim` may rearrange internal scan state
//! (SIEVE and CLOCK hands) but never removes the entry itself — the cache
//! drives the removal and reports it via `on_remove`.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which entry to sacrifice when the pool cannot satisfy an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used.
    Lru,
    /// Oldest insertion, access-agnostic.
    Fifo,
    /// Visited-bit queue: the hand walks from the oldest entry toward the
    /// newest, clearing visited bits, and evicts the first unvisited one.
    Sieve,
    /// Circular second-chance scan over reference bits.
    Clock,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lru => "lru",
            Self::Fifo => "fifo",
            Self::Sieve => "sieve",
            Self::Clock => "clock",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown eviction policy: {0}")]
pub struct UnknownPolicy(String);

impl FromStr for EvictionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "fifo" => Ok(Self::Fifo),
            "sieve" => Ok(Self::Sieve),
            "clock" => Ok(Self::Clock),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// Recency/ordering state behind an [`EvictionPolicy`].
pub trait PolicyState: fmt::Debug {
    fn on_insert(&mut self, key: &str);
    fn on_access(&mut self, key: &str);
    fn on_remove(&mut self, key: &str);
    /// The key the policy would evict next, `None` when empty.
    fn select_victim(&mut self) -> Option<String>;
}

/// Fresh state for `policy`.
#[must_use]
pub fn policy_state(policy: EvictionPolicy) -> Box<dyn PolicyState> {
    match policy {
        EvictionPolicy::Lru => Box::new(Lru::default()),
        EvictionPolicy::Fifo => Box::new(Fifo::default()),
        EvictionPolicy::Sieve => Box::new(Sieve::default()),
        EvictionPolicy::Clock => Box::new(Clock::default()),
    }
}

// ── LRU ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Lru {
    stamps: HashMap<String, u64>,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, key: &str) {
        self.stamps.insert(key.to_owned(), self.tick);
        self.tick += 1;
    }
}

impl PolicyState for Lru {
    fn on_insert(&mut self, key: &str) {
        self.touch(key);
    }

    fn on_access(&mut self, key: &str) {
        self.touch(key);
    }

    fn on_remove(&mut self, key: &str) {
        self.stamps.remove(key);
    }

    fn select_victim(&mut self) -> Option<String> {
        self.stamps
            .iter()
            .min_by_key(|&(_, &stamp)| stamp)
            .map(|(key, _)| key.clone())
    }
}

// ── FIFO ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Fifo {
    order: HashMap<String, u64>,
    counter: u64,
}

impl PolicyState for Fifo {
    fn on_insert(&mut self, key: &str) {
        self.order.insert(key.to_owned(), self.counter);
        self.counter += 1;
    }

    fn on_access(&mut self, _key: &str) {}

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn select_victim(&mut self) -> Option<String> {
        self.order
            .iter()
            .min_by_key(|&(_, &order)| order)
            .map(|(key, _)| key.clone())
    }
}

// ── SIEVE ───────────────────────────────────────────────────────────────────

/// Queue front holds the newest entry; the hand sweeps from the back
/// (oldest) toward the front.
#[derive(Debug, Default)]
struct Sieve {
    queue: VecDeque<(String, bool)>,
    hand: Option<String>,
}

impl Sieve {
    fn position(&self, key: &str) -> Option<usize> {
        self.queue.iter().position(|(k, _)| k == key)
    }
}

impl PolicyState for Sieve {
    fn on_insert(&mut self, key: &str) {
        self.queue.push_front((key.to_owned(), false));
    }

    fn on_access(&mut self, key: &str) {
        if let Some(idx) = self.position(key) {
            self.queue[idx].1 = true;
        }
    }

    fn on_remove(&mut self, key: &str) {
        let Some(idx) = self.position(key) else {
            return;
        };
        // Removing the hand itself: park it one step toward the front so
        // the sweep resumes where it left off.
        if self.hand.as_deref() == Some(key) {
            self.hand = idx
                .checked_sub(1)
                .map(|prev| self.queue[prev].0.clone());
        }
        self.queue.remove(idx);
    }

    fn select_victim(&mut self) -> Option<String> {
        let len = self.queue.len();
        if len == 0 {
            return None;
        }
        let mut idx = self
            .hand
            .as_deref()
            .and_then(|hand| self.position(hand))
            .unwrap_or(len - 1);

        // One full sweep clears every visited bit, so two passes bound the
        // scan even when everything was recently touched.
        for _ in 0..=2 * len {
            let (key, visited) = &mut self.queue[idx];
            if *visited {
                *visited = false;
                idx = if idx == 0 { len - 1 } else { idx - 1 };
            } else {
                let key = key.clone();
                self.hand = idx.checked_sub(1).map(|prev| self.queue[prev].0.clone());
                return Some(key);
            }
        }
        unreachable!("sieve sweep found no unvisited entry in two passes");
    }
}

// ── CLOCK ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Clock {
    slots: Vec<(String, bool)>,
    hand: usize,
}

impl PolicyState for Clock {
    fn on_insert(&mut self, key: &str) {
        self.slots.push((key.to_owned(), false));
    }

    fn on_access(&mut self, key: &str) {
        if let Some(slot) = self.slots.iter_mut().find(|(k, _)| k == key) {
            slot.1 = true;
        }
    }

    fn on_remove(&mut self, key: &str) {
        let Some(idx) = self.slots.iter().position(|(k, _)| k == key) else {
            return;
        };
        self.slots.remove(idx);
        if idx < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.slots.len() {
            self.hand = 0;
        }
    }

    fn select_victim(&mut self) -> Option<String> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        if self.hand >= len {
            self.hand = 0;
        }
        for _ in 0..=2 * len {
            let (key, referenced) = &mut self.slots[self.hand];
            if *referenced {
                *referenced = false;
                self.hand = (self.hand + 1) % len;
            } else {
                return Some(key.clone());
            }
        }
        unreachable!("clock sweep found no unreferenced entry in two passes");
    }
}
