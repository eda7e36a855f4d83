//! World configuration.
//!
//! Vertical layout, world bounds, the world border, and the ticket distance
//! table. Loaded as part of the server configuration file.

use crate::standard::DEFAULT_DISTANCE_TABLE;
use genesis_common::{BlockPos, CellPos};
use serde::{Deserialize, Serialize};

/// World configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Index of the lowest section
    pub min_section: i32,
    /// Number of sections per cell
    pub section_count: usize,
    /// Largest absolute cell coordinate the pipeline will create
    pub max_cell_coordinate: i32,
    /// Border outside of which nothing ticks
    pub border: WorldBorder,
    /// Stage names, nearest ticket distance first
    pub distance_table: Vec<String>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            min_section: -4,
            section_count: 24,
            max_cell_coordinate: 1_875_000,
            border: WorldBorder::default(),
            distance_table: DEFAULT_DISTANCE_TABLE.iter().map(|&s| s.to_owned()).collect(),
        }
    }
}

impl WorldConfig {
    /// Whether the pipeline may create a cell at `pos`.
    #[must_use]
    pub fn in_bounds(&self, pos: CellPos) -> bool {
        let max = self.max_cell_coordinate.unsigned_abs();
        pos.x.unsigned_abs() <= max && pos.z.unsigned_abs() <= max
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.section_count = self.section_count.clamp(1, 256);
        self.min_section = self.min_section.clamp(-128, 128);
        self.max_cell_coordinate = self.max_cell_coordinate.clamp(1, 1_875_000);
        self.border.radius = self.border.radius.max(1);
        if self.distance_table.is_empty() {
            self.distance_table = Self::default().distance_table;
        }
    }
}

/// Square world border, in blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldBorder {
    /// Center X
    pub center_x: i32,
    /// Center Z
    pub center_z: i32,
    /// Half the side length
    pub radius: i32,
}

impl Default for WorldBorder {
    fn default() -> Self {
        Self {
            center_x: 0,
            center_z: 0,
            radius: 29_999_984,
        }
    }
}

impl WorldBorder {
    /// Whether a block lies inside the border.
    #[must_use]
    pub fn contains(&self, pos: BlockPos) -> bool {
        let dx = i64::from(pos.x) - i64::from(self.center_x);
        let dz = i64::from(pos.z) - i64::from(self.center_z);
        let r = i64::from(self.radius);
        (-r..r).contains(&dx) && (-r..r).contains(&dz)
    }
}
