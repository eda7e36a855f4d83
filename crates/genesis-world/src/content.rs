//! Content properties consulted by heightmaps and sub-entity checks.
//!
//! The pipeline does not interpret content beyond these flags: what a
//! content value *is* belongs to whoever registers it.

use ahash::AHashMap;
use genesis_common::{ContentId, Identifier};

/// Physical properties of a content value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContentFlags(u8);

impl ContentFlags {
    /// No properties (air-like).
    pub const NONE: Self = Self(0);
    /// Solid ground.
    pub const SOLID: Self = Self(1);
    /// Fluid.
    pub const FLUID: Self = Self(1 << 1);
    /// Foliage ignored by `MotionBlockingNoLeaves`.
    pub const LEAVES: Self = Self(1 << 2);
    /// Blocks entity motion.
    pub const BLOCKS_MOTION: Self = Self(1 << 3);

    /// Checks whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Checks whether any flag in `other` is set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for ContentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Registered content value.
#[derive(Debug, Clone)]
pub struct ContentProps {
    /// Name of the content value
    pub name: Identifier,
    /// Physical properties
    pub flags: ContentFlags,
    /// Sub-entity kind this content carries, if any
    pub sub_entity: Option<Identifier>,
}

/// Registry of content values, indexed by [`ContentId`].
///
/// Id 0 is always the empty value.
#[derive(Debug, Clone)]
pub struct ContentTable {
    entries: Vec<ContentProps>,
    by_name: AHashMap<Identifier, ContentId>,
}

impl ContentTable {
    /// Creates a table holding only the empty value.
    #[must_use]
    pub fn new() -> Self {
        let empty = Identifier::from_static("genesis", "empty");
        let mut by_name = AHashMap::new();
        by_name.insert(empty.clone(), ContentId::EMPTY);
        Self {
            entries: vec![ContentProps {
                name: empty,
                flags: ContentFlags::NONE,
                sub_entity: None,
            }],
            by_name,
        }
    }

    /// Registers a content value, returning the existing id if the name is
    /// already known.
    pub fn register(&mut self, props: ContentProps) -> ContentId {
        if let Some(&id) = self.by_name.get(&props.name) {
            return id;
        }
        let id = ContentId::new(self.entries.len() as u16);
        self.by_name.insert(props.name.clone(), id);
        self.entries.push(props);
        id
    }

    /// Properties of a content value. Unknown ids read as empty.
    #[must_use]
    pub fn get(&self, id: ContentId) -> &ContentProps {
        self.entries
            .get(id.raw() as usize)
            .unwrap_or(&self.entries[0])
    }

    /// Looks up a content value by name.
    #[must_use]
    pub fn by_name(&self, name: &Identifier) -> Option<ContentId> {
        self.by_name.get(name).copied()
    }

    /// Flags of a content value.
    #[must_use]
    pub fn flags(&self, id: ContentId) -> ContentFlags {
        self.get(id).flags
    }

    /// Sub-entity kind declared by a content value.
    #[must_use]
    pub fn sub_entity_kind(&self, id: ContentId) -> Option<&Identifier> {
        self.get(id).sub_entity.as_ref()
    }

    /// Number of registered values, including the empty one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the empty value is registered on construction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ContentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> Identifier {
        Identifier::genesis(path).expect("valid identifier")
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut table = ContentTable::new();
        let stone = table.register(ContentProps {
            name: id("stone"),
            flags: ContentFlags::SOLID | ContentFlags::BLOCKS_MOTION,
            sub_entity: None,
        });
        let again = table.register(ContentProps {
            name: id("stone"),
            flags: ContentFlags::NONE,
            sub_entity: None,
        });
        assert_eq!(stone, again);
        assert_eq!(table.len(), 2);
        assert!(table.flags(stone).contains(ContentFlags::SOLID));
    }

    #[test]
    fn test_unknown_id_reads_as_empty() {
        let table = ContentTable::new();
        assert_eq!(table.flags(ContentId::new(99)), ContentFlags::NONE);
        assert!(table.sub_entity_kind(ContentId::new(99)).is_none());
    }
}
