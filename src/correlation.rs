use std::sync::atomic::{AtomicU32, Ordering};

use crate::frame::HANDSHAKE_ID;

/// Source of correlation ids for the requests of one connection.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u32;
}

/// Hands out 1, 2, 3, ... wrapping around at `u32::MAX` and never yielding the handshake id.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU32,
}

impl SequentialIds {
    pub fn new() -> SequentialIds {
        SequentialIds {
            next: AtomicU32::new(HANDSHAKE_ID + 1),
        }
    }

    #[cfg(test)]
    fn starting_at(id: u32) -> SequentialIds {
        SequentialIds {
            next: AtomicU32::new(id),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != HANDSHAKE_ID {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_after_the_handshake_id() {
        let ids = SequentialIds::new();

        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn wraps_around_skipping_the_handshake_id() {
        let ids = SequentialIds::starting_at(u32::MAX);

        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
    }
}
