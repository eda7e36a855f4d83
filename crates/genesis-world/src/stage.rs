//! Stage registry: the ordered chain of generation stages and the distance
//! table that maps ticket distances to stages.

use crate::cell::HeightmapSet;
use crate::error::StageChainError;
use crate::task::StageTask;
use ahash::AHashMap;
use genesis_common::Identifier;
use std::sync::Arc;

/// Handle to a stage within one [`StageChain`]. Comparison follows chain
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(u8);

impl StageId {
    /// Position of the stage in its chain.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether `self` comes at or after `other` in the chain.
    #[must_use]
    pub const fn is_at_least(self, other: Self) -> bool {
        self.0 >= other.0
    }
}

/// Whether a stage is intermediate or the terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Cell stays in proto form
    Intermediate,
    /// Cell is promoted to full form on reaching this stage
    Final,
}

/// A registered stage.
pub struct Stage {
    name: Identifier,
    id: StageId,
    parent: StageId,
    neighbor_radius: u32,
    heightmaps: HeightmapSet,
    kind: StageKind,
    task: Arc<dyn StageTask>,
}

impl Stage {
    /// Namespaced name.
    #[must_use]
    pub const fn name(&self) -> &Identifier {
        &self.name
    }

    /// Handle of this stage.
    #[must_use]
    pub const fn id(&self) -> StageId {
        self.id
    }

    /// Preceding stage; the first stage is its own parent.
    #[must_use]
    pub const fn parent(&self) -> StageId {
        self.parent
    }

    /// Chebyshev radius of neighbors the stage's generation task reads.
    #[must_use]
    pub const fn neighbor_radius(&self) -> u32 {
        self.neighbor_radius
    }

    /// Heightmaps guaranteed primed once a cell reaches this stage.
    #[must_use]
    pub const fn heightmaps(&self) -> HeightmapSet {
        self.heightmaps
    }

    /// Intermediate or final.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        self.kind
    }

    /// Whether this is the final stage.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.kind == StageKind::Final
    }

    /// Work performed by the stage.
    #[must_use]
    pub fn task(&self) -> &Arc<dyn StageTask> {
        &self.task
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("neighbor_radius", &self.neighbor_radius)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Description of a stage to register.
pub struct StageDef {
    /// Namespaced name
    pub name: Identifier,
    /// Preceding stage; must be the current tail, or `None` for the first
    pub parent: Option<StageId>,
    /// Neighbor radius of the generation task
    pub neighbor_radius: u32,
    /// Heightmaps primed after the stage
    pub heightmaps: HeightmapSet,
    /// Intermediate or final
    pub kind: StageKind,
    /// Work performed by the stage
    pub task: Arc<dyn StageTask>,
}

/// Builds a [`StageChain`], one stage at a time.
#[derive(Default)]
pub struct StageChainBuilder {
    stages: Vec<Stage>,
}

impl StageChainBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tail of the chain.
    #[must_use]
    pub fn tail(&self) -> Option<StageId> {
        self.stages.last().map(|s| s.id)
    }

    /// Appends a stage. Its declared parent must be the current tail.
    pub fn register(&mut self, def: StageDef) -> Result<StageId, StageChainError> {
        let name = def.name.to_string();
        if self.stages.iter().any(|s| s.name == def.name) {
            return Err(StageChainError::DuplicateName(name));
        }
        if self.stages.last().is_some_and(Stage::is_final) {
            return Err(StageChainError::AfterFinal(name));
        }
        let tail = self.tail();
        if def.parent != tail {
            let describe = |id: Option<StageId>| {
                id.and_then(|id| self.stages.get(id.index()))
                    .map_or_else(|| "<none>".to_owned(), |s| s.name.to_string())
            };
            return Err(StageChainError::ParentMismatch {
                stage: name,
                expected: describe(tail),
                actual: describe(def.parent),
            });
        }
        let Ok(index) = u8::try_from(self.stages.len()) else {
            return Err(StageChainError::TooManyStages(name));
        };
        let id = StageId(index);
        self.stages.push(Stage {
            name: def.name,
            id,
            parent: def.parent.unwrap_or(id),
            neighbor_radius: def.neighbor_radius,
            heightmaps: def.heightmaps,
            kind: def.kind,
            task: def.task,
        });
        Ok(id)
    }

    /// Validates the chain against a distance table, given by stage names
    /// nearest-first.
    pub fn build_with_names<S: AsRef<str>>(
        self,
        table: &[S],
    ) -> Result<StageChain, StageChainError> {
        let ids = table
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.stages
                    .iter()
                    .find(|s| s.name.matches(name))
                    .map(|s| s.id)
                    .ok_or_else(|| StageChainError::UnknownStage(name.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.build(ids)
    }

    /// Validates the chain against a distance table, nearest-first.
    pub fn build(self, table: Vec<StageId>) -> Result<StageChain, StageChainError> {
        if !self.stages.last().is_some_and(Stage::is_final) {
            return Err(StageChainError::NoFinalStage);
        }
        let table = DistanceTable::new(table, self.stages.len())?;
        let chain = StageChain {
            by_name: self
                .stages
                .iter()
                .map(|s| (s.name.clone(), s.id))
                .collect(),
            stages: self.stages,
            table,
        };
        for stage in &chain.stages {
            if stage.neighbor_radius == 0 {
                continue;
            }
            // Rings further out only ever need earlier stages, so ring 1 is
            // the one that could wait on the stage itself.
            let dependency = chain.dependency_stage(stage.id, 1);
            if dependency.is_at_least(stage.id) {
                return Err(StageChainError::DependencyCycle {
                    stage: stage.name.to_string(),
                    dependency: chain.get(dependency).name.to_string(),
                });
            }
        }
        Ok(chain)
    }
}

/// Minimal stage per ticket distance, and its inverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceTable {
    stage_by_distance: Vec<StageId>,
    distance_by_stage: Vec<u32>,
}

impl DistanceTable {
    /// Validates and inverts a nearest-first table for a chain of
    /// `stage_count` stages.
    pub fn new(
        stage_by_distance: Vec<StageId>,
        stage_count: usize,
    ) -> Result<Self, StageChainError> {
        if stage_by_distance.is_empty() {
            return Err(StageChainError::EmptyDistanceTable);
        }
        if let Some(bad) = stage_by_distance.iter().find(|id| id.index() >= stage_count) {
            return Err(StageChainError::UnknownStage(format!("#{}", bad.index())));
        }
        if let Some(i) = stage_by_distance
            .windows(2)
            .position(|pair| pair[1] > pair[0])
        {
            return Err(StageChainError::DistanceTableNotMonotonic(i + 1));
        }

        // A stage's distance is the furthest bucket whose stage still sits
        // at or after it, or 0 when even the nearest bucket is earlier.
        let mut distance_by_stage = vec![0u32; stage_count];
        let mut distance = 0usize;
        for index in (0..stage_count).rev() {
            while distance + 1 < stage_by_distance.len()
                && index <= stage_by_distance[distance + 1].index()
            {
                distance += 1;
            }
            distance_by_stage[index] = distance as u32;
        }
        Ok(Self {
            stage_by_distance,
            distance_by_stage,
        })
    }

    /// Number of distances with a stage.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stage_by_distance.len()
    }

    /// Always false once constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stage_by_distance.is_empty()
    }

    fn stage_at(&self, distance: u32, first: StageId) -> StageId {
        self.stage_by_distance
            .get(distance as usize)
            .copied()
            .unwrap_or(first)
    }

    fn distance_of(&self, stage: StageId) -> u32 {
        self.distance_by_stage
            .get(stage.index())
            .copied()
            .unwrap_or(0)
    }
}

/// The immutable, validated stage chain.
pub struct StageChain {
    stages: Vec<Stage>,
    by_name: AHashMap<Identifier, StageId>,
    table: DistanceTable,
}

impl StageChain {
    /// Starts a new chain.
    #[must_use]
    pub fn builder() -> StageChainBuilder {
        StageChainBuilder::new()
    }

    /// Stage for a handle from this chain.
    ///
    /// # Panics
    ///
    /// Panics if `id` came from a different chain with more stages.
    #[must_use]
    pub fn get(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    /// Looks up a stage by `namespace:path` or bare path.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<StageId> {
        match Identifier::parse(name) {
            Ok(id) => self.by_name.get(&id).copied(),
            Err(_) => None,
        }
    }

    /// First stage (load-or-create).
    #[must_use]
    pub fn first(&self) -> StageId {
        StageId(0)
    }

    /// The final stage.
    #[must_use]
    pub fn final_stage(&self) -> StageId {
        StageId((self.stages.len() - 1) as u8)
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built chain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in chain order.
    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Stage a cell at ticket `distance` must reach. Distances past the
    /// table need only the first stage.
    #[must_use]
    pub fn ticket_stage_for(&self, distance: u32) -> StageId {
        self.table.stage_at(distance, self.first())
    }

    /// Smallest ticket distance at which `stage` is still required.
    #[must_use]
    pub fn distance_for(&self, stage: StageId) -> u32 {
        self.table.distance_of(stage)
    }

    /// Number of ticket distances that require more than nothing.
    #[must_use]
    pub fn max_distance(&self) -> u32 {
        self.table.len() as u32
    }

    /// Stage a cell `distance` cells away must reach before `target` can run
    /// on the center. Distance 0 is the center itself.
    #[must_use]
    pub fn dependency_stage(&self, target: StageId, distance: u32) -> StageId {
        if distance == 0 {
            return self.get(target).parent;
        }
        self.ticket_stage_for(self.distance_for(target) + distance)
    }

    /// The weakest stage every cell within `target`'s radius must reach,
    /// together with that radius.
    #[must_use]
    pub fn required_neighbor_stage(&self, target: StageId) -> (StageId, u32) {
        let stage = self.get(target);
        let radius = stage.neighbor_radius;
        if radius == 0 {
            (stage.parent, 0)
        } else {
            (self.dependency_stage(target, radius), radius)
        }
    }

    /// Largest neighbor radius of any stage.
    #[must_use]
    pub fn max_neighbor_radius(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.neighbor_radius)
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for StageChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageChain")
            .field("stages", &self.stages)
            .field("table", &self.table)
            .finish()
    }
}
