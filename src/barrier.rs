//! Ordering applied once after all stores of a durable copy.

use crate::flush::drain;

/// Whether a store fence must follow the non-temporal stores of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Barrier {
    /// Issue `sfence`.
    Fence,
    /// Issue nothing; the caller drains later (e.g. once for a batch).
    NoFence,
}

impl Barrier {
    #[inline(always)]
    pub fn apply(self) {
        match self {
            Barrier::Fence => drain(),
            Barrier::NoFence => {}
        }
    }
}
