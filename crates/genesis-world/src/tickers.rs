//! Ticker lifecycle: rebindable ticker slots for live sub-entities.
//!
//! Each sub-entity that ticks owns a slot in a flat arena, addressed by a
//! generation-checked [`TickerHandle`]. Rebinding swaps the slot's state in
//! place, so the global tick order never churns. Unbinding swaps to
//! [`TickerState::Removed`]; the slot is reclaimed the next time
//! [`TickerList::tick_all`] walks past it.

use ahash::AHashMap;
use genesis_common::{BlockPos, CellPos, Identifier};

/// A sub-entity bound to the tick loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundTicker {
    cell: CellPos,
    pos: BlockPos,
    kind: Identifier,
    logged_invalid: bool,
}

impl BoundTicker {
    /// Cell holding the sub-entity.
    #[must_use]
    pub const fn cell(&self) -> CellPos {
        self.cell
    }

    /// Position of the sub-entity.
    #[must_use]
    pub const fn pos(&self) -> BlockPos {
        self.pos
    }

    /// Kind the ticker was bound for.
    #[must_use]
    pub const fn kind(&self) -> &Identifier {
        &self.kind
    }

    /// Returns true the first time it is called for this binding.
    pub fn first_invalid(&mut self) -> bool {
        !std::mem::replace(&mut self.logged_invalid, true)
    }
}

/// What a ticker slot currently does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickerState {
    /// Ticks the bound sub-entity
    Active(BoundTicker),
    /// Bound to a kind that has nothing to tick
    Idle,
    /// Unbound; reclaimed by the next tick pass
    Removed,
}

/// Stable reference to a ticker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickerHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    // `None` while the slot is on the free list.
    state: Option<TickerState>,
    key: (CellPos, BlockPos),
}

/// Arena of ticker slots in tick order.
#[derive(Debug, Default)]
pub struct TickerList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    bindings: AHashMap<CellPos, AHashMap<BlockPos, TickerHandle>>,
}

impl TickerList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the sub-entity at `pos` in `cell`.
    ///
    /// An existing binding is rebound in place. A kind with no ticker binds
    /// to [`TickerState::Idle`]; if nothing was bound yet no slot is taken
    /// and `None` is returned.
    pub fn bind(
        &mut self,
        cell: CellPos,
        pos: BlockPos,
        kind: &Identifier,
        has_ticker: bool,
    ) -> Option<TickerHandle> {
        let state = if has_ticker {
            TickerState::Active(BoundTicker {
                cell,
                pos,
                kind: kind.clone(),
                logged_invalid: false,
            })
        } else {
            TickerState::Idle
        };

        if let Some(handle) = self.handle_at(cell, pos) {
            if let Some(slot) = self.slot_mut(handle) {
                let unchanged = matches!(
                    (&slot.state, &state),
                    (Some(TickerState::Active(old)), TickerState::Active(new)) if old.kind == new.kind
                );
                if !unchanged {
                    slot.state = Some(state);
                }
                return Some(handle);
            }
        }
        if !has_ticker {
            return None;
        }

        let handle = self.allocate(cell, pos, state);
        self.bindings.entry(cell).or_default().insert(pos, handle);
        Some(handle)
    }

    fn allocate(&mut self, cell: CellPos, pos: BlockPos, state: TickerState) -> TickerHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.state = Some(state);
            slot.key = (cell, pos);
            return TickerHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            state: Some(state),
            key: (cell, pos),
        });
        TickerHandle {
            index,
            generation: 0,
        }
    }

    /// Unbinds the sub-entity at `pos`. Returns whether one was bound.
    pub fn unbind(&mut self, cell: CellPos, pos: BlockPos) -> bool {
        let Some(positions) = self.bindings.get_mut(&cell) else {
            return false;
        };
        let Some(handle) = positions.remove(&pos) else {
            return false;
        };
        if positions.is_empty() {
            self.bindings.remove(&cell);
        }
        self.mark_removed(handle);
        true
    }

    /// Unbinds every sub-entity of a cell. Returns how many were bound.
    pub fn unbind_cell(&mut self, cell: CellPos) -> usize {
        let Some(positions) = self.bindings.remove(&cell) else {
            return 0;
        };
        let count = positions.len();
        for handle in positions.into_values() {
            self.mark_removed(handle);
        }
        count
    }

    fn mark_removed(&mut self, handle: TickerHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.state = Some(TickerState::Removed);
        }
    }

    /// Runs `f` for every active ticker in slot order and reclaims removed
    /// slots. Returns the number of tickers visited.
    pub fn tick_all(&mut self, mut f: impl FnMut(&mut BoundTicker)) -> usize {
        let mut visited = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match &mut slot.state {
                Some(TickerState::Active(ticker)) => {
                    f(ticker);
                    visited += 1;
                },
                Some(TickerState::Removed) => {
                    slot.state = None;
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push(index as u32);
                },
                Some(TickerState::Idle) | None => {},
            }
        }
        visited
    }

    /// State of a slot, or `None` for a stale handle.
    #[must_use]
    pub fn state(&self, handle: TickerHandle) -> Option<&TickerState> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.as_ref())
    }

    fn slot_mut(&mut self, handle: TickerHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.state.is_some())
    }

    /// Handle bound for `pos`, if any.
    #[must_use]
    pub fn handle_at(&self, cell: CellPos, pos: BlockPos) -> Option<TickerHandle> {
        self.bindings.get(&cell)?.get(&pos).copied()
    }

    /// Number of bound sub-entities, active or idle.
    #[must_use]
    pub fn bound_count(&self) -> usize {
        self.bindings.values().map(|positions| positions.len()).sum()
    }

    /// Number of slots not on the free list, removed ones included.
    #[must_use]
    pub fn occupied_slots(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Position a slot was last bound for.
    #[must_use]
    pub fn key(&self, handle: TickerHandle) -> Option<(CellPos, BlockPos)> {
        self.state(handle)
            .map(|_| self.slots[handle.index as usize].key)
    }
}
