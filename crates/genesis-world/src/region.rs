//! The window of cells a generation task may touch.

use crate::cell::Cell;
use crate::holder::CellHolder;
use genesis_common::CellPos;
use std::sync::Arc;

/// The center cell of a generation task plus every neighbor whose
/// dependency was resolved for it, and nothing more.
#[derive(Debug, Clone)]
pub struct GenerationRegion {
    center: Arc<CellHolder>,
    cells: Vec<Arc<CellHolder>>,
    radius: u32,
}

impl GenerationRegion {
    pub(crate) fn new(center: Arc<CellHolder>, mut cells: Vec<Arc<CellHolder>>, radius: u32) -> Self {
        if !cells.iter().any(|h| h.pos() == center.pos()) {
            cells.push(Arc::clone(&center));
        }
        // Lock order.
        cells.sort_by_key(|h| h.pos());
        cells.dedup_by_key(|h| h.pos());
        Self {
            center,
            cells,
            radius,
        }
    }

    /// Holder of the center cell.
    #[must_use]
    pub fn center(&self) -> &Arc<CellHolder> {
        &self.center
    }

    /// Position of the center cell.
    #[must_use]
    pub fn pos(&self) -> CellPos {
        self.center.pos()
    }

    /// Chebyshev radius of the window.
    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    /// Number of cells in the window, center included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Never true: the center is always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Locks the window (center exclusively, neighbors shared) in position
    /// order and runs `f`. Blocking; call from the worker pool.
    pub fn with_cells<R>(&self, f: impl FnOnce(&mut Cell, &NeighborView<'_>) -> R) -> R {
        let center = self.center.pos();
        let mut center_guard = None;
        let mut reads = Vec::with_capacity(self.cells.len().saturating_sub(1));
        for holder in &self.cells {
            if holder.pos() == center {
                center_guard = Some(holder.write());
            } else {
                reads.push(holder.read());
            }
        }
        let mut center_guard = center_guard.unwrap_or_else(|| self.center.write());
        let view = NeighborView {
            center,
            radius: self.radius,
            cells: reads.iter().map(|guard| (guard.pos(), &**guard)).collect(),
        };
        f(&mut center_guard, &view)
    }
}

/// Read-only access to the neighbors in a [`GenerationRegion`].
#[derive(Debug)]
pub struct NeighborView<'a> {
    center: CellPos,
    radius: u32,
    cells: Vec<(CellPos, &'a Cell)>,
}

impl<'a> NeighborView<'a> {
    /// View with no neighbors, for running a generator hook on a lone cell.
    #[must_use]
    pub fn isolated(center: CellPos) -> Self {
        Self {
            center,
            radius: 0,
            cells: Vec::new(),
        }
    }

    /// Position of the center cell.
    #[must_use]
    pub const fn center(&self) -> CellPos {
        self.center
    }

    /// Chebyshev radius of the window.
    #[must_use]
    pub const fn radius(&self) -> u32 {
        self.radius
    }

    /// Neighbor at offset `(dx, dz)` from the center. `None` for the center
    /// itself and anything outside the window.
    #[must_use]
    pub fn get(&self, dx: i32, dz: i32) -> Option<&'a Cell> {
        self.get_at(self.center.offset(dx, dz))
    }

    /// Neighbor at an absolute position.
    #[must_use]
    pub fn get_at(&self, pos: CellPos) -> Option<&'a Cell> {
        self.cells
            .binary_search_by_key(&pos, |(p, _)| *p)
            .ok()
            .map(|i| self.cells[i].1)
    }

    /// Every neighbor in the window.
    pub fn iter(&self) -> impl Iterator<Item = &'a Cell> + '_ {
        self.cells.iter().map(|(_, cell)| *cell)
    }
}
