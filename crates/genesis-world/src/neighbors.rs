//! Neighbor readiness tracking.
//!
//! Every resident cell carries a 7×7 residency bitmask centered on itself.
//! Bits are kept symmetric: if `a` sees `b` at offset `(dx, dz)`, then `b`
//! sees `a` at `(-dx, -dz)`. Subscribers are told about every mask change
//! with the old and new value and decide themselves which thresholds
//! flipped.

use ahash::AHashMap;
use genesis_common::CellPos;

/// Chebyshev radius covered by a [`NeighborMask`].
pub const NEIGHBOR_RADIUS: i32 = 3;

const DIAMETER: i32 = NEIGHBOR_RADIUS * 2 + 1;

const fn bit_index(dx: i32, dz: i32) -> u32 {
    ((dx + NEIGHBOR_RADIUS) + (dz + NEIGHBOR_RADIUS) * DIAMETER) as u32
}

const fn radius_mask(radius: i32) -> u64 {
    let mut mask = 0u64;
    let mut dz = -radius;
    while dz <= radius {
        let mut dx = -radius;
        while dx <= radius {
            mask |= 1 << bit_index(dx, dz);
            dx += 1;
        }
        dz += 1;
    }
    mask
}

/// Bits that must be set for each radius to be satisfied.
pub const RADIUS_MASKS: [u64; NEIGHBOR_RADIUS as usize + 1] =
    [radius_mask(0), radius_mask(1), radius_mask(2), radius_mask(3)];

/// Residency of the cells around one cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NeighborMask(u64);

impl NeighborMask {
    /// No neighbor resident, not even the cell itself.
    pub const EMPTY: Self = Self(0);

    /// Bit index for an offset, or `None` outside the radius.
    #[must_use]
    pub const fn index(dx: i32, dz: i32) -> Option<u32> {
        if dx.abs() > NEIGHBOR_RADIUS || dz.abs() > NEIGHBOR_RADIUS {
            None
        } else {
            Some(bit_index(dx, dz))
        }
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether the cell at `(dx, dz)` is resident.
    #[must_use]
    pub const fn contains(self, dx: i32, dz: i32) -> bool {
        match Self::index(dx, dz) {
            Some(bit) => self.0 & (1 << bit) != 0,
            None => false,
        }
    }

    /// Mask with the bit for `(dx, dz)` set or cleared.
    #[must_use]
    pub const fn with(self, dx: i32, dz: i32, resident: bool) -> Self {
        match Self::index(dx, dz) {
            Some(bit) if resident => Self(self.0 | (1 << bit)),
            Some(bit) => Self(self.0 & !(1 << bit)),
            None => self,
        }
    }

    /// Whether every cell within Chebyshev `radius` is resident.
    #[must_use]
    pub const fn is_satisfied(self, radius: u32) -> bool {
        if radius > NEIGHBOR_RADIUS as u32 {
            return false;
        }
        let required = RADIUS_MASKS[radius as usize];
        self.0 & required == required
    }

    /// Number of resident cells, the cell itself included.
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl std::fmt::Debug for NeighborMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NeighborMask({:#015x})", self.0)
    }
}

/// Called with `(pos, old, new)` whenever a mask changes.
pub type MaskCallback = Box<dyn Fn(CellPos, NeighborMask, NeighborMask) + Send + Sync>;

/// Residency masks of every resident cell.
#[derive(Default)]
pub struct NeighborTracker {
    masks: AHashMap<CellPos, NeighborMask>,
    subscribers: Vec<MaskCallback>,
}

impl NeighborTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mask change callback.
    ///
    /// Callbacks run synchronously inside tracker updates and must not
    /// mutate the world; queue work instead.
    pub fn subscribe(&mut self, callback: MaskCallback) {
        self.subscribers.push(callback);
    }

    /// Makes `pos` resident and links it with every resident cell within
    /// the radius. Returns false if it already was resident.
    pub fn insert(&mut self, pos: CellPos) -> bool {
        if self.masks.contains_key(&pos) {
            return false;
        }
        let own = NeighborMask::EMPTY.with(0, 0, true);
        self.masks.insert(pos, own);
        self.notify(pos, NeighborMask::EMPTY, own);

        for (dx, dz) in offsets() {
            if self.masks.contains_key(&pos.offset(dx, dz)) {
                self.link(pos, dx, dz);
            }
        }
        true
    }

    /// Makes `pos` non-resident, clearing its bit in every neighbor.
    /// Returns the mask it had.
    pub fn remove(&mut self, pos: CellPos) -> Option<NeighborMask> {
        if !self.masks.contains_key(&pos) {
            return None;
        }
        for (dx, dz) in offsets() {
            self.unlink(pos, dx, dz);
        }
        let old = self.masks.remove(&pos)?;
        self.notify(pos, old, NeighborMask::EMPTY);
        Some(old)
    }

    /// Records that the cells at `pos` and `pos + (dx, dz)` see each other.
    /// Both must be resident. Returns whether anything changed.
    pub fn link(&mut self, pos: CellPos, dx: i32, dz: i32) -> bool {
        self.set_pair(pos, dx, dz, true)
    }

    /// Clears the link between `pos` and `pos + (dx, dz)` in both
    /// directions. Returns whether anything changed.
    pub fn unlink(&mut self, pos: CellPos, dx: i32, dz: i32) -> bool {
        self.set_pair(pos, dx, dz, false)
    }

    fn set_pair(&mut self, pos: CellPos, dx: i32, dz: i32, resident: bool) -> bool {
        if (dx, dz) == (0, 0) || NeighborMask::index(dx, dz).is_none() {
            return false;
        }
        let other = pos.offset(dx, dz);
        if resident && !(self.masks.contains_key(&pos) && self.masks.contains_key(&other)) {
            return false;
        }
        let a = self.update(pos, |m| m.with(dx, dz, resident));
        let b = self.update(other, |m| m.with(-dx, -dz, resident));
        a || b
    }

    fn update(&mut self, pos: CellPos, f: impl FnOnce(NeighborMask) -> NeighborMask) -> bool {
        let Some(mask) = self.masks.get_mut(&pos) else {
            return false;
        };
        let old = *mask;
        let new = f(old);
        if old == new {
            return false;
        }
        *mask = new;
        self.notify(pos, old, new);
        true
    }

    fn notify(&self, pos: CellPos, old: NeighborMask, new: NeighborMask) {
        for subscriber in &self.subscribers {
            subscriber(pos, old, new);
        }
    }

    /// Mask of a resident cell.
    #[must_use]
    pub fn mask(&self, pos: CellPos) -> Option<NeighborMask> {
        self.masks.get(&pos).copied()
    }

    /// Whether `pos` is resident.
    #[must_use]
    pub fn is_resident(&self, pos: CellPos) -> bool {
        self.masks.contains_key(&pos)
    }

    /// Whether `pos` is resident with every cell within `radius` resident.
    #[must_use]
    pub fn is_satisfied(&self, pos: CellPos, radius: u32) -> bool {
        self.mask(pos).is_some_and(|m| m.is_satisfied(radius))
    }

    /// Number of resident cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Whether no cell is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// First bit that breaks symmetry: a set bit whose counterpart is
    /// missing or points at a non-resident cell.
    #[must_use]
    pub fn find_asymmetry(&self) -> Option<(CellPos, i32, i32)> {
        self.masks.iter().find_map(|(&pos, mask)| {
            let broken = offsets().find(|&(dx, dz)| {
                let other = self.mask(pos.offset(dx, dz));
                let expected = other.is_some_and(|o| o.contains(-dx, -dz));
                mask.contains(dx, dz) != expected
            });
            broken.map(|(dx, dz)| (pos, dx, dz))
        })
    }
}

impl std::fmt::Debug for NeighborTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborTracker")
            .field("resident", &self.masks.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Every offset within the radius except the center.
fn offsets() -> impl Iterator<Item = (i32, i32)> {
    (-NEIGHBOR_RADIUS..=NEIGHBOR_RADIUS)
        .flat_map(|dz| (-NEIGHBOR_RADIUS..=NEIGHBOR_RADIUS).map(move |dx| (dx, dz)))
        .filter(|&offset| offset != (0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_radius_masks() {
        assert_eq!(RADIUS_MASKS[0].count_ones(), 1);
        assert_eq!(RADIUS_MASKS[1].count_ones(), 9);
        assert_eq!(RADIUS_MASKS[2].count_ones(), 25);
        assert_eq!(RADIUS_MASKS[3].count_ones(), 49);
        assert_eq!(NeighborMask::index(0, 0), Some(24));
        assert_eq!(NeighborMask::index(-3, -3), Some(0));
        assert_eq!(NeighborMask::index(4, 0), None);
    }

    #[test]
    fn test_mask_bits() {
        let mask = NeighborMask::EMPTY.with(1, -2, true);
        assert!(mask.contains(1, -2));
        assert!(!mask.contains(-1, 2));
        assert!(!mask.with(1, -2, false).contains(1, -2));
        assert!(!NeighborMask(RADIUS_MASKS[3]).is_satisfied(4));
    }

    #[test]
    fn test_insert_links_both_ways() {
        let mut tracker = NeighborTracker::new();
        let a = CellPos::new(0, 0);
        let b = CellPos::new(2, -1);
        assert!(tracker.insert(a));
        assert!(!tracker.insert(a));
        tracker.insert(b);
        assert!(tracker.mask(a).is_some_and(|m| m.contains(2, -1)));
        assert!(tracker.mask(b).is_some_and(|m| m.contains(-2, 1)));

        tracker.remove(b);
        assert!(!tracker.mask(a).is_some_and(|m| m.contains(2, -1)));
        assert!(tracker.find_asymmetry().is_none());
    }

    #[test]
    fn test_far_cells_not_linked() {
        let mut tracker = NeighborTracker::new();
        tracker.insert(CellPos::new(0, 0));
        tracker.insert(CellPos::new(4, 0));
        assert_eq!(tracker.mask(CellPos::new(0, 0)).map(NeighborMask::count), Some(1));
        assert!(!tracker.link(CellPos::new(0, 0), 4, 0));
    }

    #[test]
    fn test_link_requires_both_resident() {
        let mut tracker = NeighborTracker::new();
        tracker.insert(CellPos::new(0, 0));
        assert!(!tracker.link(CellPos::new(0, 0), 1, 0));
        assert!(tracker.find_asymmetry().is_none());
    }

    fn ready_counter(tracker: &mut NeighborTracker, watched: CellPos) -> Arc<AtomicUsize> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        tracker.subscribe(Box::new(move |pos, old, new| {
            if pos == watched && !old.is_satisfied(1) && new.is_satisfied(1) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        fired
    }

    #[test]
    fn test_ready_fires_once_in_either_order() {
        let center = CellPos::new(5, 5);
        let ring: Vec<_> = center.square(1).filter(|&p| p != center).collect();

        for reverse in [false, true] {
            let mut tracker = NeighborTracker::new();
            let fired = ready_counter(&mut tracker, center);
            tracker.insert(center);

            let mut order = ring.clone();
            if reverse {
                order.reverse();
            }
            let (last, rest) = order.split_last().expect("ring is non-empty");
            for &pos in rest {
                tracker.insert(pos);
            }
            assert!(!tracker.is_satisfied(center, 1));
            tracker.insert(*last);
            assert!(tracker.is_satisfied(center, 1));
            // Reinserting changes nothing.
            tracker.insert(*last);
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_ready_fires_again_after_loss() {
        let center = CellPos::new(0, 0);
        let mut tracker = NeighborTracker::new();
        let fired = ready_counter(&mut tracker, center);
        for pos in center.square(1) {
            tracker.insert(pos);
        }
        tracker.remove(CellPos::new(1, 1));
        assert!(!tracker.is_satisfied(center, 1));
        tracker.insert(CellPos::new(1, 1));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_masks_stay_symmetric(
            ops in prop::collection::vec((any::<bool>(), -4i32..4, -4i32..4), 1..80)
        ) {
            let mut tracker = NeighborTracker::new();
            for (insert, x, z) in ops {
                let pos = CellPos::new(x, z);
                if insert {
                    tracker.insert(pos);
                } else {
                    tracker.remove(pos);
                }
                prop_assert_eq!(tracker.find_asymmetry(), None);
            }
            for pos in CellPos::new(0, 0).square(4) {
                if let Some(mask) = tracker.mask(pos) {
                    for (dx, dz) in offsets() {
                        prop_assert_eq!(
                            mask.contains(dx, dz),
                            tracker.is_resident(pos.offset(dx, dz))
                        );
                    }
                }
            }
        }
    }
}
