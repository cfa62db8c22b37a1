//! Element identifiers and the Lamport clock that mints them.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One editing participant.
pub type SiteId = Uuid;

/// Globally unique, totally ordered identifier of a character element.
///
/// Ordered by `clock` first and `site` second. Because `clock` is a Lamport
/// counter, an element always orders after every element its site had seen
/// when it was created, including its anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub clock: u64,
    pub site: SiteId,
}

impl ElementId {
    pub fn new(clock: u64, site: SiteId) -> Self {
        Self { clock, site }
    }
}

impl Ord for ElementId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.site.cmp(&other.site))
    }
}

impl PartialOrd for ElementId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, &self.site.to_string()[..8])
    }
}

/// Per-site Lamport clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock(u64);

impl LamportClock {
    pub fn new() -> Self {
        Self(0)
    }

    /// Advance and return the next value.
    pub fn tick(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }

    /// Fold in a clock value seen on a remote element.
    pub fn observe(&mut self, remote: u64) {
        if remote > self.0 {
            self.0 = remote;
        }
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}
