//! Coordinate types for cells, blocks, and section-local offsets.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Width of a cell along X and Z, in blocks.
pub const CELL_WIDTH: i32 = 16;

/// Height of a vertical section, in blocks.
pub const SECTION_HEIGHT: i32 = 16;

/// Number of columns in a cell (`CELL_WIDTH * CELL_WIDTH`).
pub const CELL_COLUMNS: usize = (CELL_WIDTH * CELL_WIDTH) as usize;

/// Number of blocks in a section.
pub const SECTION_VOLUME: usize = CELL_COLUMNS * SECTION_HEIGHT as usize;

/// Position of a cell in the infinite world grid.
///
/// Ordering is lexicographic on `(x, z)` and is relied upon wherever several
/// cells must be locked together.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct CellPos {
    /// X coordinate in cell space
    pub x: i32,
    /// Z coordinate in cell space
    pub z: i32,
}

impl CellPos {
    /// Creates a new cell position.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Returns the cell containing a block.
    #[must_use]
    pub const fn from_block(pos: BlockPos) -> Self {
        Self {
            x: pos.x >> 4,
            z: pos.z >> 4,
        }
    }

    /// Returns the position shifted by `(dx, dz)` cells.
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            z: self.z + dz,
        }
    }

    /// Chebyshev (chessboard) distance between two cells.
    #[must_use]
    pub fn chebyshev_distance(self, other: Self) -> u32 {
        self.x.abs_diff(other.x).max(self.z.abs_diff(other.z))
    }

    /// X coordinate of the first block column in this cell.
    #[must_use]
    pub const fn min_block_x(self) -> i32 {
        self.x * CELL_WIDTH
    }

    /// Z coordinate of the first block column in this cell.
    #[must_use]
    pub const fn min_block_z(self) -> i32 {
        self.z * CELL_WIDTH
    }

    /// Returns the block at local column `(lx, lz)` and height `y`.
    #[must_use]
    pub const fn block(self, lx: i32, y: i32, lz: i32) -> BlockPos {
        BlockPos::new(self.min_block_x() + lx, y, self.min_block_z() + lz)
    }

    /// Iterates every cell within Chebyshev `radius` of `self`, including
    /// `self`, in row-major order.
    pub fn square(self, radius: u32) -> impl Iterator<Item = CellPos> {
        let r = radius as i32;
        (-r..=r).flat_map(move |dz| (-r..=r).map(move |dx| self.offset(dx, dz)))
    }
}

impl std::fmt::Display for CellPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Absolute block position.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Pod,
    Zeroable,
)]
#[repr(C)]
pub struct BlockPos {
    /// X coordinate in block space
    pub x: i32,
    /// Y coordinate in block space
    pub y: i32,
    /// Z coordinate in block space
    pub z: i32,
}

impl BlockPos {
    /// Creates a new block position.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Cell containing this block.
    #[must_use]
    pub const fn cell(self) -> CellPos {
        CellPos::from_block(self)
    }

    /// Index of the vertical section containing this block.
    #[must_use]
    pub const fn section_y(self) -> i32 {
        self.y >> 4
    }

    /// Local X within the cell (0..16).
    #[must_use]
    pub const fn local_x(self) -> usize {
        (self.x & (CELL_WIDTH - 1)) as usize
    }

    /// Local Z within the cell (0..16).
    #[must_use]
    pub const fn local_z(self) -> usize {
        (self.z & (CELL_WIDTH - 1)) as usize
    }

    /// Local Y within the section (0..16).
    #[must_use]
    pub const fn local_y(self) -> usize {
        (self.y & (SECTION_HEIGHT - 1)) as usize
    }

    /// Packs the section-local offset into 12 bits: `x | z << 4 | y << 8`.
    #[must_use]
    pub const fn pack_section_offset(self) -> u16 {
        (self.local_x() | (self.local_z() << 4) | (self.local_y() << 8)) as u16
    }

    /// Inverse of [`BlockPos::pack_section_offset`].
    #[must_use]
    pub const fn unpack_section_offset(packed: u16, cell: CellPos, section_y: i32) -> Self {
        let lx = (packed & 15) as i32;
        let lz = ((packed >> 4) & 15) as i32;
        let ly = ((packed >> 8) & 15) as i32;
        cell.block(lx, section_y * SECTION_HEIGHT + ly, lz)
    }

    /// Index of this block inside its section's content array.
    #[must_use]
    pub const fn section_index(self) -> usize {
        self.pack_section_offset() as usize
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}
