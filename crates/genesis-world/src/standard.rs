//! The standard thirteen-stage chain.
//!
//! Stage tasks delegate the actual content to a [`ContentGenerator`]; the
//! chain itself only fixes ordering, neighbor radii, heightmap guarantees,
//! and the bookkeeping stages (structure references, lighting, heightmap
//! priming).

use crate::cell::{Cell, HeightmapSet};
use crate::error::{StageChainError, TaskError};
use crate::region::NeighborView;
use crate::stage::{StageChain, StageDef, StageKind};
use crate::task::{LightTask, PassthroughTask, SimpleTask, StageContext, StageTask};
use genesis_common::Identifier;
use std::sync::Arc;

/// Default ticket distance table, nearest first.
pub const DEFAULT_DISTANCE_TABLE: [&str; 12] = [
    "full",
    "features",
    "liquid_carvers",
    "biomes",
    "structure_starts",
    "structure_starts",
    "structure_starts",
    "structure_starts",
    "structure_starts",
    "structure_starts",
    "structure_starts",
    "structure_starts",
];

/// Content hooks called by the standard chain. Every hook defaults to
/// doing nothing.
///
/// Hooks run on the blocking pool with the center cell locked for writing
/// and the resolved neighbors locked for reading.
#[allow(unused_variables)]
pub trait ContentGenerator: Send + Sync {
    /// Places structure starts. Sees no neighbors.
    fn structure_starts(&self, cell: &mut Cell) -> Result<(), TaskError> {
        Ok(())
    }

    /// Assigns biomes.
    fn biomes(&self, cell: &mut Cell, neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Fills the base terrain shape.
    fn fill_noise(&self, cell: &mut Cell, neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Replaces the top layers of the terrain.
    fn build_surface(
        &self,
        cell: &mut Cell,
        neighbors: &NeighborView<'_>,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    /// Carves caves; `liquid` selects the liquid carver pass.
    fn carve(
        &self,
        cell: &mut Cell,
        neighbors: &NeighborView<'_>,
        liquid: bool,
    ) -> Result<(), TaskError> {
        Ok(())
    }

    /// Places features. Post-feature heightmaps are primed beforehand.
    fn decorate(&self, cell: &mut Cell, neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// Seeds initial sub-entities and creatures.
    fn spawn(&self, cell: &mut Cell, neighbors: &NeighborView<'_>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Generator that leaves every cell empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyGenerator;

impl ContentGenerator for EmptyGenerator {}

type Hook = fn(&dyn ContentGenerator, &mut Cell, &NeighborView<'_>) -> Result<(), TaskError>;

fn hook_task(generator: &Arc<dyn ContentGenerator>, hook: Hook) -> Arc<dyn StageTask> {
    let generator = Arc::clone(generator);
    Arc::new(SimpleTask::new(
        move |_: &StageContext, cell: &mut Cell, neighbors: &NeighborView<'_>| {
            hook(generator.as_ref(), cell, neighbors)
        },
    ))
}

/// Records, for every structure start in the window that reaches the
/// center, a reference to the cell holding it.
fn link_structure_references(cell: &mut Cell, neighbors: &NeighborView<'_>) {
    let center = cell.pos();
    let mut found: Vec<(Identifier, _)> = cell
        .structure_starts()
        .filter(|start| start.covers(center))
        .map(|start| (start.kind.clone(), center))
        .collect();
    for neighbor in neighbors.iter() {
        found.extend(
            neighbor
                .structure_starts()
                .filter(|start| start.covers(center))
                .map(|start| (start.kind.clone(), neighbor.pos())),
        );
    }
    for (kind, origin) in found {
        cell.add_structure_reference(&kind, origin);
    }
}

impl StageChain {
    /// Builds the standard chain around `generator`, with a distance table
    /// given by stage names nearest-first.
    pub fn standard<S: AsRef<str>>(
        generator: Arc<dyn ContentGenerator>,
        table: &[S],
    ) -> Result<Self, StageChainError> {
        let pre = HeightmapSet::PRE_FEATURES;
        let post = HeightmapSet::POST_FEATURES;
        let passthrough: Arc<dyn StageTask> = Arc::new(PassthroughTask);
        let light: Arc<dyn StageTask> = Arc::new(LightTask);

        let starts = {
            let generator = Arc::clone(&generator);
            Arc::new(SimpleTask::new(
                move |_: &StageContext, cell: &mut Cell, _: &NeighborView<'_>| {
                    generator.structure_starts(cell)
                },
            )) as Arc<dyn StageTask>
        };
        let references = Arc::new(SimpleTask::new(
            |_: &StageContext, cell: &mut Cell, neighbors: &NeighborView<'_>| {
                link_structure_references(cell, neighbors);
                Ok(())
            },
        )) as Arc<dyn StageTask>;
        let features = {
            let generator = Arc::clone(&generator);
            Arc::new(SimpleTask::new(
                move |_: &StageContext, cell: &mut Cell, neighbors: &NeighborView<'_>| {
                    cell.prime_heightmaps(HeightmapSet::POST_FEATURES);
                    generator.decorate(cell, neighbors)
                },
            )) as Arc<dyn StageTask>
        };

        let stages: [(&str, u32, HeightmapSet, Arc<dyn StageTask>); 13] = [
            ("empty", 0, pre, Arc::clone(&passthrough)),
            ("structure_starts", 0, pre, starts),
            ("structure_references", 8, pre, references),
            ("biomes", 8, pre, hook_task(&generator, |g, c, n| g.biomes(c, n))),
            ("noise", 8, pre, hook_task(&generator, |g, c, n| g.fill_noise(c, n))),
            ("surface", 8, pre, hook_task(&generator, |g, c, n| g.build_surface(c, n))),
            ("carvers", 8, pre, hook_task(&generator, |g, c, n| g.carve(c, n, false))),
            ("liquid_carvers", 8, post, hook_task(&generator, |g, c, n| g.carve(c, n, true))),
            ("features", 8, post, features),
            ("light", 1, post, light),
            ("spawn", 0, post, hook_task(&generator, |g, c, n| g.spawn(c, n))),
            ("heightmaps", 0, post, Arc::clone(&passthrough)),
            ("full", 0, post, passthrough),
        ];

        let mut builder = Self::builder();
        let last = stages.len() - 1;
        for (index, (name, neighbor_radius, heightmaps, task)) in stages.into_iter().enumerate() {
            builder.register(StageDef {
                name: Identifier::genesis(name)?,
                parent: builder.tail(),
                neighbor_radius,
                heightmaps,
                kind: if index == last {
                    StageKind::Final
                } else {
                    StageKind::Intermediate
                },
                task,
            })?;
        }
        builder.build_with_names(table)
    }
}

/// Small chain for tests: `empty → shape(1) → decorate(1) → full(1)`.
#[cfg(test)]
pub(crate) fn test_chain() -> StageChain {
    let mut builder = StageChain::builder();
    for (name, radius, kind) in [
        ("empty", 0, StageKind::Intermediate),
        ("shape", 1, StageKind::Intermediate),
        ("decorate", 1, StageKind::Intermediate),
        ("full", 1, StageKind::Final),
    ] {
        builder
            .register(StageDef {
                name: Identifier::genesis(name).expect("valid name"),
                parent: builder.tail(),
                neighbor_radius: radius,
                heightmaps: HeightmapSet::PRE_FEATURES,
                kind,
                task: Arc::new(PassthroughTask),
            })
            .expect("valid stage");
    }
    builder
        .build_with_names(&["full", "decorate", "shape", "empty"])
        .expect("valid chain")
}
