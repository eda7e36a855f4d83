//! Flat terrain used by the headless server.

use genesis_common::{ContentId, Identifier};
use genesis_world::{
    Cell, ContentFlags, ContentGenerator, ContentProps, ContentTable, NeighborView,
    SubEntityPayload, TaskError,
};

/// Top of the generated ground.
pub const SURFACE_Y: i32 = 64;

/// Depth of the dirt layer under the grass.
const DIRT_DEPTH: i32 = 3;

/// Content values the flat generator places.
#[derive(Debug, Clone)]
pub struct FlatContent {
    /// Bulk terrain
    pub stone: ContentId,
    /// Layer under the surface
    pub dirt: ContentId,
    /// Surface
    pub grass: ContentId,
    /// Ticking block placed on some cells
    pub furnace: ContentId,
    /// Sub-entity kind of the furnace
    pub furnace_kind: Identifier,
}

impl FlatContent {
    /// Registers the flat content set in `table`.
    pub fn register(table: &mut ContentTable) -> Result<Self, TaskError> {
        let named = |path: &str| {
            Identifier::genesis(path).map_err(|e| TaskError::Failed(e.to_string()))
        };
        let solid = ContentFlags::SOLID | ContentFlags::BLOCKS_MOTION;
        let furnace_kind = named("furnace")?;

        let mut add = |path: &str, sub_entity: Option<Identifier>| -> Result<ContentId, TaskError> {
            Ok(table.register(ContentProps {
                name: named(path)?,
                flags: solid,
                sub_entity,
            }))
        };
        Ok(Self {
            stone: add("stone", None)?,
            dirt: add("dirt", None)?,
            grass: add("grass", None)?,
            furnace: add("furnace", Some(furnace_kind.clone()))?,
            furnace_kind,
        })
    }
}

/// Generator producing flat ground with a furnace on every fourth cell.
#[derive(Debug, Clone)]
pub struct FlatGenerator {
    content: FlatContent,
}

impl FlatGenerator {
    /// Creates a generator placing `content`.
    pub fn new(content: FlatContent) -> Self {
        Self { content }
    }

    fn fill_layer(cell: &mut Cell, from: i32, to: i32, content: ContentId) {
        let pos = cell.pos();
        for y in from..to {
            for lz in 0..16 {
                for lx in 0..16 {
                    cell.set_content(pos.block(lx, y, lz), content);
                }
            }
        }
    }
}

impl ContentGenerator for FlatGenerator {
    fn fill_noise(&self, cell: &mut Cell, _neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        let bottom = cell.layout().min_y();
        Self::fill_layer(cell, bottom, SURFACE_Y - DIRT_DEPTH - 1, self.content.stone);
        Ok(())
    }

    fn build_surface(
        &self,
        cell: &mut Cell,
        _neighbors: &NeighborView<'_>,
    ) -> Result<(), TaskError> {
        Self::fill_layer(
            cell,
            SURFACE_Y - DIRT_DEPTH - 1,
            SURFACE_Y - 1,
            self.content.dirt,
        );
        Self::fill_layer(cell, SURFACE_Y - 1, SURFACE_Y, self.content.grass);
        Ok(())
    }

    fn spawn(&self, cell: &mut Cell, _neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        let pos = cell.pos();
        if (pos.x + pos.z).rem_euclid(4) != 0 {
            return Ok(());
        }
        let at = pos.block(8, SURFACE_Y, 8);
        if cell.set_content(at, self.content.furnace).is_none() {
            return Ok(());
        }
        cell.add_pending_sub_entity(SubEntityPayload {
            pos: at,
            kind: self.content.furnace_kind.clone(),
            data: Vec::new(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_common::CellPos;
    use genesis_world::{CellLayout, HeightmapKind, StageChain};
    use std::sync::Arc;

    fn setup(pos: CellPos) -> (FlatGenerator, Cell) {
        let mut table = ContentTable::new();
        let content = FlatContent::register(&mut table).expect("register");
        let layout = CellLayout::new(-4, 24, Arc::new(table));
        let generator = FlatGenerator::new(content);
        let chain = StageChain::standard(Arc::new(generator.clone()), &["full"])
            .expect("valid chain");
        (generator, Cell::new(pos, chain.first(), layout))
    }

    #[test]
    fn test_register_content() {
        let mut table = ContentTable::new();
        let content = FlatContent::register(&mut table).expect("register");
        assert_eq!(table.len(), 5);
        assert_eq!(table.sub_entity_kind(content.furnace), Some(&content.furnace_kind));
        assert_eq!(table.sub_entity_kind(content.stone), None);
    }

    #[test]
    fn test_flat_layers() {
        let (generator, mut cell) = setup(CellPos::new(1, 0));
        let view = NeighborView::isolated(cell.pos());
        generator.fill_noise(&mut cell, &view).expect("noise");
        generator.build_surface(&mut cell, &view).expect("surface");
        generator.spawn(&mut cell, &view).expect("spawn");

        let flat = &generator.content;
        let pos = cell.pos();
        assert_eq!(cell.content(pos.block(0, -64, 0)), flat.stone);
        assert_eq!(cell.content(pos.block(3, SURFACE_Y - 2, 5)), flat.dirt);
        assert_eq!(cell.content(pos.block(15, SURFACE_Y - 1, 15)), flat.grass);
        assert!(cell.content(pos.block(0, SURFACE_Y, 0)).is_empty());
        assert_eq!(cell.height(HeightmapKind::WorldSurface, 4, 4), SURFACE_Y);
        assert_eq!(cell.pending_sub_entity_count(), 0);
    }

    #[test]
    fn test_furnace_on_every_fourth_cell() {
        let (generator, mut cell) = setup(CellPos::new(2, 2));
        let view = NeighborView::isolated(cell.pos());
        generator.spawn(&mut cell, &view).expect("spawn");
        assert_eq!(
            cell.content(cell.pos().block(8, SURFACE_Y, 8)),
            generator.content.furnace
        );
        assert_eq!(cell.pending_sub_entity_count(), 1);
    }
}
