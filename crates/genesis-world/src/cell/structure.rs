//! Structure starts and the references neighbors keep to them.

use genesis_common::{CellPos, Identifier};
use serde::{Deserialize, Serialize};

/// Authoritative record of a structure whose origin is in this cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureStart {
    /// Structure kind
    pub kind: Identifier,
    /// Cell holding the start
    pub origin: CellPos,
    /// Lowest cell the structure reaches
    pub min: CellPos,
    /// Highest cell the structure reaches
    pub max: CellPos,
    /// Opaque layout data
    pub data: Vec<u8>,
}

impl StructureStart {
    /// Whether the structure reaches into `pos`.
    #[must_use]
    pub const fn covers(&self, pos: CellPos) -> bool {
        pos.x >= self.min.x && pos.x <= self.max.x && pos.z >= self.min.z && pos.z <= self.max.z
    }
}
