//! Sub-entities: per-position state attached to content, such as a
//! container's inventory.

use crate::error::TickError;
use ahash::AHashMap;
use genesis_common::{BlockPos, CellPos, Identifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stored form of a sub-entity, not yet attached to a cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntityPayload {
    /// Position of the sub-entity
    pub pos: BlockPos,
    /// Declared kind
    pub kind: Identifier,
    /// Opaque state
    pub data: Vec<u8>,
}

/// A live sub-entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubEntity {
    pos: BlockPos,
    kind: Identifier,
    data: Vec<u8>,
    removed: bool,
}

impl SubEntity {
    /// Creates a live sub-entity.
    #[must_use]
    pub fn new(pos: BlockPos, kind: Identifier, data: Vec<u8>) -> Self {
        Self {
            pos,
            kind,
            data,
            removed: false,
        }
    }

    /// Instantiates a stored payload.
    #[must_use]
    pub fn from_payload(payload: SubEntityPayload) -> Self {
        Self::new(payload.pos, payload.kind, payload.data)
    }

    /// Stored form of this sub-entity.
    #[must_use]
    pub fn to_payload(&self) -> SubEntityPayload {
        SubEntityPayload {
            pos: self.pos,
            kind: self.kind.clone(),
            data: self.data.clone(),
        }
    }

    /// Position.
    #[must_use]
    pub const fn pos(&self) -> BlockPos {
        self.pos
    }

    /// Declared kind.
    #[must_use]
    pub const fn kind(&self) -> &Identifier {
        &self.kind
    }

    /// Opaque state.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable opaque state.
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Whether the sub-entity has been removed from the world.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.removed
    }

    /// Marks the sub-entity as removed.
    pub fn mark_removed(&mut self) {
        self.removed = true;
    }
}

/// Context handed to a ticker.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Cell holding the sub-entity
    pub cell: CellPos,
    /// Current game time
    pub game_time: u64,
}

/// Per-tick behavior of a sub-entity kind.
pub trait SubEntityTicker: Send + Sync {
    /// Runs one tick.
    fn tick(&self, entity: &mut SubEntity, ctx: &TickContext) -> Result<(), TickError>;
}

impl<F> SubEntityTicker for F
where
    F: Fn(&mut SubEntity, &TickContext) -> Result<(), TickError> + Send + Sync,
{
    fn tick(&self, entity: &mut SubEntity, ctx: &TickContext) -> Result<(), TickError> {
        self(entity, ctx)
    }
}

/// Registry of sub-entity kinds and their tickers.
#[derive(Default, Clone)]
pub struct SubEntityKinds {
    kinds: AHashMap<Identifier, Option<Arc<dyn SubEntityTicker>>>,
}

impl SubEntityKinds {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a kind. Kinds without a ticker are valid but never tick.
    pub fn register(&mut self, kind: Identifier, ticker: Option<Arc<dyn SubEntityTicker>>) {
        self.kinds.insert(kind, ticker);
    }

    /// Whether the kind is registered.
    #[must_use]
    pub fn is_known(&self, kind: &Identifier) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Ticker of a kind, if it has one.
    #[must_use]
    pub fn ticker(&self, kind: &Identifier) -> Option<&Arc<dyn SubEntityTicker>> {
        self.kinds.get(kind).and_then(Option::as_ref)
    }
}

impl std::fmt::Debug for SubEntityKinds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubEntityKinds")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .finish()
    }
}
