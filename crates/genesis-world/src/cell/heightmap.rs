//! Per-column height summaries and the sets of them stages guarantee.

use crate::content::ContentFlags;
use genesis_common::{ContentId, CELL_COLUMNS, CELL_WIDTH};

/// Kind of heightmap. Each kind counts a different class of content as
/// "opaque".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HeightmapKind {
    /// Any non-empty content, during generation
    WorldSurfaceWg,
    /// Motion-blocking content, during generation
    OceanFloorWg,
    /// Any non-empty content
    WorldSurface,
    /// Motion-blocking content
    OceanFloor,
    /// Motion-blocking content or fluid
    MotionBlocking,
    /// Motion-blocking content or fluid, ignoring leaves
    MotionBlockingNoLeaves,
}

impl HeightmapKind {
    /// All kinds, in bit order.
    pub const ALL: [Self; 6] = [
        Self::WorldSurfaceWg,
        Self::OceanFloorWg,
        Self::WorldSurface,
        Self::OceanFloor,
        Self::MotionBlocking,
        Self::MotionBlockingNoLeaves,
    ];

    /// Key used in persisted records.
    #[must_use]
    pub const fn serialization_key(self) -> &'static str {
        match self {
            Self::WorldSurfaceWg => "WORLD_SURFACE_WG",
            Self::OceanFloorWg => "OCEAN_FLOOR_WG",
            Self::WorldSurface => "WORLD_SURFACE",
            Self::OceanFloor => "OCEAN_FLOOR",
            Self::MotionBlocking => "MOTION_BLOCKING",
            Self::MotionBlockingNoLeaves => "MOTION_BLOCKING_NO_LEAVES",
        }
    }

    /// Inverse of [`HeightmapKind::serialization_key`].
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.serialization_key() == key)
    }

    /// Whether `content` stops a downward scan for this kind.
    #[must_use]
    pub const fn is_opaque(self, content: ContentId, flags: ContentFlags) -> bool {
        let blocks = flags.contains(ContentFlags::BLOCKS_MOTION);
        match self {
            Self::WorldSurfaceWg | Self::WorldSurface => !content.is_empty(),
            Self::OceanFloorWg | Self::OceanFloor => blocks,
            Self::MotionBlocking => blocks || flags.contains(ContentFlags::FLUID),
            Self::MotionBlockingNoLeaves => {
                (blocks || flags.contains(ContentFlags::FLUID))
                    && !flags.contains(ContentFlags::LEAVES)
            },
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of heightmap kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeightmapSet(u8);

impl HeightmapSet {
    /// No heightmaps.
    pub const EMPTY: Self = Self(0);

    /// Heightmaps maintained while terrain is still being shaped.
    pub const PRE_FEATURES: Self =
        Self(HeightmapKind::WorldSurfaceWg.bit() | HeightmapKind::OceanFloorWg.bit());

    /// Heightmaps maintained from decoration onwards.
    pub const POST_FEATURES: Self = Self(
        HeightmapKind::WorldSurface.bit()
            | HeightmapKind::OceanFloor.bit()
            | HeightmapKind::MotionBlocking.bit()
            | HeightmapKind::MotionBlockingNoLeaves.bit(),
    );

    /// Returns the set with `kind` added.
    #[must_use]
    pub const fn with(self, kind: HeightmapKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Checks membership.
    #[must_use]
    pub const fn contains(self, kind: HeightmapKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Whether the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates the kinds in the set.
    pub fn iter(self) -> impl Iterator<Item = HeightmapKind> {
        HeightmapKind::ALL.into_iter().filter(move |&kind| self.contains(kind))
    }
}

/// Height of the first free block above the highest opaque block, per
/// column. Columns with nothing opaque hold the cell's minimum Y.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heightmap {
    kind: HeightmapKind,
    heights: Box<[i32]>,
}

impl Heightmap {
    /// Creates a heightmap with every column at `min_y`.
    #[must_use]
    pub fn new(kind: HeightmapKind, min_y: i32) -> Self {
        Self {
            kind,
            heights: vec![min_y; CELL_COLUMNS].into_boxed_slice(),
        }
    }

    /// Kind of this heightmap.
    #[must_use]
    pub const fn kind(&self) -> HeightmapKind {
        self.kind
    }

    /// Height of column `(lx, lz)`.
    #[must_use]
    pub fn get(&self, lx: usize, lz: usize) -> i32 {
        self.heights[column(lx, lz)]
    }

    pub(crate) fn set(&mut self, lx: usize, lz: usize, height: i32) {
        self.heights[column(lx, lz)] = height;
    }

    /// Packs heights relative to `min_y` into 64-bit words. Values never
    /// straddle two words.
    #[must_use]
    pub fn pack(&self, min_y: i32, height: u32) -> Vec<u64> {
        let bits = bits_for(height);
        let per_word = 64 / bits;
        let mask = (1u64 << bits) - 1;
        let mut words = vec![0u64; CELL_COLUMNS.div_ceil(per_word as usize)];
        for (i, &h) in self.heights.iter().enumerate() {
            let value = (h - min_y).clamp(0, height as i32) as u64;
            let word = i / per_word as usize;
            let shift = (i % per_word as usize) as u32 * bits;
            words[word] |= (value & mask) << shift;
        }
        words
    }

    /// Inverse of [`Heightmap::pack`]. Returns `None` when the word count
    /// does not match the layout.
    #[must_use]
    pub fn unpack(kind: HeightmapKind, min_y: i32, height: u32, words: &[u64]) -> Option<Self> {
        let bits = bits_for(height);
        let per_word = 64 / bits;
        if words.len() != CELL_COLUMNS.div_ceil(per_word as usize) {
            return None;
        }
        let mask = (1u64 << bits) - 1;
        let heights = (0..CELL_COLUMNS)
            .map(|i| {
                let word = words[i / per_word as usize];
                let shift = (i % per_word as usize) as u32 * bits;
                min_y + ((word >> shift) & mask) as i32
            })
            .collect();
        Some(Self { kind, heights })
    }
}

const fn column(lx: usize, lz: usize) -> usize {
    lx + lz * CELL_WIDTH as usize
}

/// Bits needed to store values in `0..=height`.
fn bits_for(height: u32) -> u32 {
    (u32::BITS - height.leading_zeros()).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_membership() {
        assert!(HeightmapSet::PRE_FEATURES.contains(HeightmapKind::OceanFloorWg));
        assert!(!HeightmapSet::PRE_FEATURES.contains(HeightmapKind::MotionBlocking));
        assert_eq!(HeightmapSet::POST_FEATURES.iter().count(), 4);
        assert!(HeightmapSet::EMPTY.is_empty());
    }

    #[test]
    fn test_opacity_rules() {
        let leaves = ContentFlags::LEAVES | ContentFlags::BLOCKS_MOTION;
        let id = ContentId::new(4);
        assert!(HeightmapKind::MotionBlocking.is_opaque(id, leaves));
        assert!(!HeightmapKind::MotionBlockingNoLeaves.is_opaque(id, leaves));
        assert!(HeightmapKind::MotionBlocking.is_opaque(id, ContentFlags::FLUID));
        assert!(!HeightmapKind::OceanFloor.is_opaque(id, ContentFlags::FLUID));
        assert!(HeightmapKind::WorldSurface.is_opaque(id, ContentFlags::NONE));
        assert!(!HeightmapKind::WorldSurface.is_opaque(ContentId::EMPTY, ContentFlags::NONE));
    }

    #[test]
    fn test_pack_layout() {
        let mut map = Heightmap::new(HeightmapKind::WorldSurface, -64);
        map.set(3, 7, 100);
        map.set(15, 15, 319);
        // 384 blocks tall needs 9 bits, 7 values per word.
        let words = map.pack(-64, 384);
        assert_eq!(words.len(), 37);
        let restored =
            Heightmap::unpack(HeightmapKind::WorldSurface, -64, 384, &words).expect("same layout");
        assert_eq!(restored, map);
        assert!(Heightmap::unpack(HeightmapKind::WorldSurface, -64, 384, &words[1..]).is_none());
    }

    #[test]
    fn test_keys_round_trip() {
        for kind in HeightmapKind::ALL {
            assert_eq!(HeightmapKind::from_key(kind.serialization_key()), Some(kind));
        }
        assert_eq!(HeightmapKind::from_key("LIGHT_BLOCKING"), None);
    }
}
