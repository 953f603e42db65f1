//! Packet identifier allocation
//!
//! Always hands out the smallest identifier not currently in use. Ids are
//! handed out contiguously from 1 up to a high-water mark; released ids
//! below the mark are kept in an ordered set and reused first.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::protocol::PacketId;

/// Width of the packet identifier space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketIdWidth {
    /// Standard 16-bit identifiers (1..=65535)
    #[default]
    U16,
    /// Extended 32-bit identifiers (1..=4294967295)
    U32,
}

impl PacketIdWidth {
    pub fn max(self) -> PacketId {
        match self {
            PacketIdWidth::U16 => u16::MAX as PacketId,
            PacketIdWidth::U32 => u32::MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketIdPool {
    max: PacketId,
    /// Every id in `1..=high_water` is in use unless listed in `released`
    high_water: PacketId,
    released: BTreeSet<PacketId>,
}

impl PacketIdPool {
    pub fn new(width: PacketIdWidth) -> Self {
        Self::with_max(width.max())
    }

    pub(crate) fn with_max(max: PacketId) -> Self {
        Self {
            max,
            high_water: 0,
            released: BTreeSet::new(),
        }
    }

    /// Allocate the smallest free id, or `None` when the space is exhausted
    pub fn allocate(&mut self) -> Option<PacketId> {
        if let Some(id) = self.released.pop_first() {
            return Some(id);
        }
        if self.high_water < self.max {
            self.high_water += 1;
            Some(self.high_water)
        } else {
            None
        }
    }

    /// Return an id to the pool. Returns false if it was not in use.
    pub fn release(&mut self, id: PacketId) -> bool {
        if !self.is_in_use(id) {
            return false;
        }

        if id == self.high_water {
            self.high_water -= 1;
            // Fold released ids at the top back below the mark
            while self.high_water > 0 && self.released.remove(&self.high_water) {
                self.high_water -= 1;
            }
        } else {
            self.released.insert(id);
        }
        true
    }

    pub fn is_in_use(&self, id: PacketId) -> bool {
        id != 0 && id <= self.high_water && !self.released.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.high_water as usize - self.released.len()
    }

    /// Release every id
    pub fn clear(&mut self) {
        self.high_water = 0;
        self.released.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_smallest_free() {
        let mut pool = PacketIdPool::new(PacketIdWidth::U16);
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(3));

        assert!(pool.release(2));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(4));
    }

    #[test]
    fn test_release_unknown() {
        let mut pool = PacketIdPool::new(PacketIdWidth::U16);
        assert!(!pool.release(0));
        assert!(!pool.release(1));
        let id = pool.allocate().unwrap();
        assert!(pool.release(id));
        assert!(!pool.release(id));
    }

    #[test]
    fn test_high_water_folds_back() {
        let mut pool = PacketIdPool::new(PacketIdWidth::U16);
        for _ in 0..5 {
            pool.allocate();
        }
        pool.release(3);
        pool.release(4);
        pool.release(5);
        assert_eq!(pool.in_use_count(), 2);
        assert!(pool.released.is_empty());
        assert_eq!(pool.allocate(), Some(3));
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = PacketIdPool::with_max(3);
        assert_eq!(pool.allocate(), Some(1));
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), Some(3));
        assert_eq!(pool.allocate(), None);

        pool.release(2);
        assert_eq!(pool.allocate(), Some(2));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_width_range() {
        assert_eq!(PacketIdWidth::U16.max(), 65535);
        assert_eq!(PacketIdWidth::U32.max(), u32::MAX);

        let mut pool = PacketIdPool::new(PacketIdWidth::U16);
        let ids: Vec<_> = std::iter::from_fn(|| pool.allocate()).collect();
        assert_eq!(ids.len(), 65535);
        assert_eq!(ids.last(), Some(&65535));
    }
}
