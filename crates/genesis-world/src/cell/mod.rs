//! The cell container: sections, heightmaps, structures, sub-entities,
//! scheduled ticks, and the flags the pipeline and storage rely on.

mod heightmap;
mod section;
mod structure;
mod sub_entity;
mod ticks;

pub use heightmap::{Heightmap, HeightmapKind, HeightmapSet};
pub use section::Section;
pub use structure::StructureStart;
pub use sub_entity::{
    SubEntity, SubEntityKinds, SubEntityPayload, SubEntityTicker, TickContext,
};
pub use ticks::{ScheduledTick, TickPriority, TickSchedule};

use crate::content::ContentTable;
use crate::error::RecordError;
use crate::stage::{StageChain, StageId};
use crate::storage::PersistedCell;
use ahash::AHashMap;
use genesis_common::{BlockPos, CellPos, ContentId, Identifier, SECTION_HEIGHT};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Vertical extent shared by every cell of a world, plus the content table
/// used to interpret section data.
#[derive(Debug, Clone)]
pub struct CellLayout {
    min_section: i32,
    section_count: usize,
    content: Arc<ContentTable>,
}

impl CellLayout {
    /// Creates a layout of `section_count` sections starting at
    /// `min_section`.
    #[must_use]
    pub fn new(min_section: i32, section_count: usize, content: Arc<ContentTable>) -> Self {
        Self {
            min_section,
            section_count: section_count.max(1),
            content,
        }
    }

    /// Index of the lowest section.
    #[must_use]
    pub const fn min_section(&self) -> i32 {
        self.min_section
    }

    /// Number of sections.
    #[must_use]
    pub const fn section_count(&self) -> usize {
        self.section_count
    }

    /// Lowest block Y.
    #[must_use]
    pub const fn min_y(&self) -> i32 {
        self.min_section * SECTION_HEIGHT
    }

    /// Height in blocks.
    #[must_use]
    pub const fn height(&self) -> u32 {
        (self.section_count as i32 * SECTION_HEIGHT) as u32
    }

    /// One past the highest block Y.
    #[must_use]
    pub const fn max_y(&self) -> i32 {
        self.min_y() + self.height() as i32
    }

    /// Content table.
    #[must_use]
    pub fn content(&self) -> &ContentTable {
        &self.content
    }

    fn section_index(&self, y: i32) -> Option<usize> {
        let index = (y >> 4) - self.min_section;
        (0..self.section_count as i32)
            .contains(&index)
            .then_some(index as usize)
    }
}

/// Form of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellForm {
    /// Still being generated
    Proto,
    /// Reached the final stage
    Full,
}

/// A 16×16 column of the world and everything attached to it.
#[derive(Debug)]
pub struct Cell {
    pos: CellPos,
    stage: StageId,
    form: CellForm,
    layout: CellLayout,
    sections: Vec<Section>,
    heightmaps: AHashMap<HeightmapKind, Heightmap>,
    structure_starts: AHashMap<Identifier, StructureStart>,
    structure_references: AHashMap<Identifier, BTreeSet<CellPos>>,
    pending_sub_entities: AHashMap<BlockPos, SubEntityPayload>,
    live_sub_entities: AHashMap<BlockPos, SubEntity>,
    post_processing: Vec<Vec<u16>>,
    block_ticks: TickSchedule,
    fluid_ticks: TickSchedule,
    unsaved: bool,
    light_correct: bool,
}

impl Cell {
    /// Creates an empty proto cell at `stage`.
    #[must_use]
    pub fn new(pos: CellPos, stage: StageId, layout: CellLayout) -> Self {
        let sections = vec![Section::empty(); layout.section_count];
        let post_processing = vec![Vec::new(); layout.section_count];
        Self {
            pos,
            stage,
            form: CellForm::Proto,
            layout,
            sections,
            heightmaps: AHashMap::new(),
            structure_starts: AHashMap::new(),
            structure_references: AHashMap::new(),
            pending_sub_entities: AHashMap::new(),
            live_sub_entities: AHashMap::new(),
            post_processing,
            block_ticks: TickSchedule::new(),
            fluid_ticks: TickSchedule::new(),
            unsaved: false,
            light_correct: false,
        }
    }

    /// Position of the cell.
    #[must_use]
    pub const fn pos(&self) -> CellPos {
        self.pos
    }

    /// Last stage committed for this cell.
    #[must_use]
    pub const fn stage(&self) -> StageId {
        self.stage
    }

    /// Proto or full.
    #[must_use]
    pub const fn form(&self) -> CellForm {
        self.form
    }

    /// Whether the cell reached the final stage.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.form == CellForm::Full
    }

    /// Vertical layout and content table.
    #[must_use]
    pub const fn layout(&self) -> &CellLayout {
        &self.layout
    }

    /// Raises the stage and primes the heightmaps it guarantees. Never
    /// lowers it. Returns whether the stage changed.
    pub(crate) fn advance_to(&mut self, stage: StageId, heightmaps: HeightmapSet) -> bool {
        if self.stage.is_at_least(stage) {
            return false;
        }
        self.stage = stage;
        self.prime_heightmaps(heightmaps);
        self.unsaved = true;
        true
    }

    /// Switches to full form and promotes every pending sub-entity.
    /// Returns the positions promoted.
    pub(crate) fn promote_to_full(&mut self) -> Vec<BlockPos> {
        if self.form != CellForm::Full {
            self.form = CellForm::Full;
            self.unsaved = true;
        }
        self.promote_all_pending()
    }

    // Content

    /// Content at `pos`. Positions outside the vertical range read as empty.
    #[must_use]
    pub fn content(&self, pos: BlockPos) -> ContentId {
        self.layout
            .section_index(pos.y)
            .map_or(ContentId::EMPTY, |i| self.sections[i].get(pos.section_index()))
    }

    /// Writes content and keeps primed heightmaps current. Returns the
    /// previous content, or `None` if `pos` is outside the vertical range.
    ///
    /// Sub-entities at `pos` are left alone; a ticker bound to one whose
    /// kind the new content no longer declares is skipped with a warning.
    pub fn set_content(&mut self, pos: BlockPos, content: ContentId) -> Option<ContentId> {
        let index = self.layout.section_index(pos.y)?;
        let old = self.sections[index].set(pos.section_index(), content);
        if old == content {
            return Some(old);
        }
        self.unsaved = true;

        let (lx, lz) = (pos.local_x(), pos.local_z());
        let flags = self.layout.content.flags(content);
        for heightmap in self.heightmaps.values_mut() {
            let kind = heightmap.kind();
            let current = heightmap.get(lx, lz);
            if kind.is_opaque(content, flags) {
                if pos.y + 1 > current {
                    heightmap.set(lx, lz, pos.y + 1);
                }
            } else if pos.y + 1 == current {
                let height = column_height(&self.sections, &self.layout, kind, lx, lz, pos.y);
                heightmap.set(lx, lz, height);
            }
        }
        Some(old)
    }

    /// Section by index from the bottom.
    #[must_use]
    pub fn section(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// All sections, bottom first.
    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    // Heightmaps

    /// Height of column `(lx, lz)` in a heightmap. A heightmap no stage has
    /// primed yet is primed now, with a warning.
    pub fn height(&mut self, kind: HeightmapKind, lx: usize, lz: usize) -> i32 {
        if !self.heightmaps.contains_key(&kind) {
            warn!(
                "Heightmap {} queried on cell {} before it was primed",
                kind.serialization_key(),
                self.pos
            );
            self.prime_heightmaps(HeightmapSet::EMPTY.with(kind));
        }
        self.heightmaps
            .get(&kind)
            .map_or(self.layout.min_y(), |map| map.get(lx & 15, lz & 15))
    }

    /// Heightmap if primed.
    #[must_use]
    pub fn heightmap(&self, kind: HeightmapKind) -> Option<&Heightmap> {
        self.heightmaps.get(&kind)
    }

    /// Computes every heightmap in `kinds` that is not primed yet.
    pub fn prime_heightmaps(&mut self, kinds: HeightmapSet) {
        for kind in kinds.iter() {
            if self.heightmaps.contains_key(&kind) {
                continue;
            }
            let mut map = Heightmap::new(kind, self.layout.min_y());
            for lz in 0..16 {
                for lx in 0..16 {
                    let top = self.layout.max_y() - 1;
                    map.set(lx, lz, column_height(&self.sections, &self.layout, kind, lx, lz, top));
                }
            }
            self.heightmaps.insert(kind, map);
        }
    }

    // Structures

    /// Structure start of a kind, if this cell holds one.
    #[must_use]
    pub fn structure_start(&self, kind: &Identifier) -> Option<&StructureStart> {
        self.structure_starts.get(kind)
    }

    /// All structure starts in this cell.
    pub fn structure_starts(&self) -> impl Iterator<Item = &StructureStart> {
        self.structure_starts.values()
    }

    /// Records a structure start.
    pub fn set_structure_start(&mut self, start: StructureStart) {
        self.structure_starts.insert(start.kind.clone(), start);
        self.unsaved = true;
    }

    /// Records that the structure `kind` starting in `origin` reaches this
    /// cell.
    pub fn add_structure_reference(&mut self, kind: &Identifier, origin: CellPos) {
        if self
            .structure_references
            .entry(kind.clone())
            .or_default()
            .insert(origin)
        {
            self.unsaved = true;
        }
    }

    /// Cells holding starts of `kind` that reach this cell.
    #[must_use]
    pub fn structure_references(&self, kind: &Identifier) -> Option<&BTreeSet<CellPos>> {
        self.structure_references.get(kind)
    }

    // Sub-entities

    /// Stores a raw sub-entity to be promoted later.
    pub fn add_pending_sub_entity(&mut self, payload: SubEntityPayload) {
        self.live_sub_entities.remove(&payload.pos);
        self.pending_sub_entities.insert(payload.pos, payload);
        self.unsaved = true;
    }

    /// Number of sub-entities still pending.
    #[must_use]
    pub fn pending_sub_entity_count(&self) -> usize {
        self.pending_sub_entities.len()
    }

    /// Stores a live sub-entity, replacing anything at its position.
    pub fn set_sub_entity(&mut self, entity: SubEntity) {
        self.pending_sub_entities.remove(&entity.pos());
        self.live_sub_entities.insert(entity.pos(), entity);
        self.unsaved = true;
    }

    /// Live sub-entity at `pos`, without promoting.
    #[must_use]
    pub fn sub_entity(&self, pos: BlockPos) -> Option<&SubEntity> {
        self.live_sub_entities.get(&pos)
    }

    /// Live sub-entity at `pos`, promoting a pending payload first if there
    /// is one. Promotion happens at most once per payload.
    pub fn get_or_promote(&mut self, pos: BlockPos) -> Option<&mut SubEntity> {
        if let Some(payload) = self.pending_sub_entities.remove(&pos) {
            if let Some(entity) = self.promote(payload) {
                self.live_sub_entities.insert(pos, entity);
            }
        }
        self.live_sub_entities.get_mut(&pos)
    }

    /// Removes the live sub-entity at `pos`, marking it removed.
    pub fn remove_sub_entity(&mut self, pos: BlockPos) -> Option<SubEntity> {
        self.pending_sub_entities.remove(&pos);
        let mut entity = self.live_sub_entities.remove(&pos)?;
        entity.mark_removed();
        self.unsaved = true;
        Some(entity)
    }

    /// Live sub-entities.
    pub fn live_sub_entities(&self) -> impl Iterator<Item = &SubEntity> {
        self.live_sub_entities.values()
    }

    /// Promotes every pending payload. Returns the positions now live.
    pub fn promote_all_pending(&mut self) -> Vec<BlockPos> {
        let pending: Vec<_> = self.pending_sub_entities.drain().map(|(_, p)| p).collect();
        let mut promoted = Vec::with_capacity(pending.len());
        for payload in pending {
            let pos = payload.pos;
            if let Some(entity) = self.promote(payload) {
                self.live_sub_entities.insert(pos, entity);
                promoted.push(pos);
            }
        }
        promoted
    }

    fn promote(&self, payload: SubEntityPayload) -> Option<SubEntity> {
        let content = self.content(payload.pos);
        match self.layout.content.sub_entity_kind(content) {
            Some(kind) if *kind == payload.kind => Some(SubEntity::from_payload(payload)),
            _ => {
                warn!(
                    "Dropping sub-entity {} at {}: content {} does not carry it",
                    payload.kind,
                    payload.pos,
                    self.layout.content.get(content).name
                );
                None
            },
        }
    }

    // Post-processing

    /// Queues `pos` for post-processing once the cell's neighbors are
    /// resident.
    pub fn mark_for_post_processing(&mut self, pos: BlockPos) {
        if let Some(index) = self.layout.section_index(pos.y) {
            let packed = pos.pack_section_offset();
            let list = &mut self.post_processing[index];
            if !list.contains(&packed) {
                list.push(packed);
                self.unsaved = true;
            }
        }
    }

    /// Number of queued post-processing positions.
    #[must_use]
    pub fn post_processing_len(&self) -> usize {
        self.post_processing.iter().map(Vec::len).sum()
    }

    /// Empties the post-processing queue, returning the positions.
    pub fn drain_post_processing(&mut self) -> Vec<BlockPos> {
        let mut positions = Vec::with_capacity(self.post_processing_len());
        for (index, list) in self.post_processing.iter_mut().enumerate() {
            let section_y = self.layout.min_section + index as i32;
            positions.extend(
                list.drain(..)
                    .map(|packed| BlockPos::unpack_section_offset(packed, self.pos, section_y)),
            );
        }
        if !positions.is_empty() {
            self.unsaved = true;
        }
        positions
    }

    // Ticks

    /// Scheduled content ticks.
    #[must_use]
    pub fn block_ticks(&self) -> &TickSchedule {
        &self.block_ticks
    }

    /// Mutable scheduled content ticks.
    pub fn block_ticks_mut(&mut self) -> &mut TickSchedule {
        self.unsaved = true;
        &mut self.block_ticks
    }

    /// Scheduled fluid ticks.
    #[must_use]
    pub fn fluid_ticks(&self) -> &TickSchedule {
        &self.fluid_ticks
    }

    /// Mutable scheduled fluid ticks.
    pub fn fluid_ticks_mut(&mut self) -> &mut TickSchedule {
        self.unsaved = true;
        &mut self.fluid_ticks
    }

    // Flags

    /// Whether the cell changed since it was last persisted.
    #[must_use]
    pub const fn is_unsaved(&self) -> bool {
        self.unsaved
    }

    /// Sets or clears the unsaved flag.
    pub fn set_unsaved(&mut self, unsaved: bool) {
        self.unsaved = unsaved;
    }

    /// Whether lighting finished for the cell's current content.
    #[must_use]
    pub const fn is_light_correct(&self) -> bool {
        self.light_correct
    }

    /// Records the lighting state.
    pub fn set_light_correct(&mut self, correct: bool) {
        if self.light_correct != correct {
            self.light_correct = correct;
            self.unsaved = true;
        }
    }

    // Persistence

    /// Snapshot for storage. Live sub-entities are written back as payloads.
    #[must_use]
    pub fn to_record(&self, chain: &StageChain) -> PersistedCell {
        let min_y = self.layout.min_y();
        let height = self.layout.height();
        let mut heightmaps: Vec<_> = self
            .heightmaps
            .values()
            .map(|map| {
                (
                    map.kind().serialization_key().to_owned(),
                    map.pack(min_y, height),
                )
            })
            .collect();
        heightmaps.sort();

        let mut structure_starts: Vec<_> = self.structure_starts.values().cloned().collect();
        structure_starts.sort_by(|a, b| a.kind.cmp(&b.kind));
        let mut structure_references: Vec<_> = self
            .structure_references
            .iter()
            .map(|(kind, origins)| (kind.clone(), origins.iter().copied().collect()))
            .collect();
        structure_references.sort();

        let mut sub_entities: Vec<_> = self
            .pending_sub_entities
            .values()
            .cloned()
            .chain(
                self.live_sub_entities
                    .values()
                    .filter(|e| !e.is_removed())
                    .map(SubEntity::to_payload),
            )
            .collect();
        sub_entities.sort_by_key(|p| p.pos);

        PersistedCell {
            pos: self.pos,
            stage: chain.get(self.stage).name().to_string(),
            full: self.is_full(),
            min_section: self.layout.min_section,
            sections: self.sections.iter().map(Section::to_raw).collect(),
            heightmaps,
            structure_starts,
            structure_references,
            sub_entities,
            post_processing: self.post_processing.clone(),
            block_ticks: self.block_ticks.to_vec(),
            fluid_ticks: self.fluid_ticks.to_vec(),
            light_correct: self.light_correct,
        }
    }

    /// Rebuilds a cell from storage. The result is not unsaved and keeps its
    /// sub-entities pending until promoted.
    pub fn from_record(
        record: PersistedCell,
        chain: &StageChain,
        layout: CellLayout,
    ) -> Result<Self, RecordError> {
        let stage = chain
            .by_name(&record.stage)
            .ok_or_else(|| RecordError::UnknownStage(record.stage.clone()))?;
        if record.sections.len() != layout.section_count || record.min_section != layout.min_section
        {
            return Err(RecordError::LayoutMismatch {
                sections: record.sections.len(),
                min_section: record.min_section,
                expected_sections: layout.section_count,
                expected_min: layout.min_section,
            });
        }

        let mut cell = Self::new(record.pos, stage, layout);
        for (index, raw) in record.sections.into_iter().enumerate() {
            cell.sections[index] = Section::from_raw(raw)
                .map_err(|reason| RecordError::InvalidSection { index, reason })?;
        }

        let (min_y, height) = (cell.layout.min_y(), cell.layout.height());
        for (key, words) in record.heightmaps {
            let Some(kind) = HeightmapKind::from_key(&key) else {
                debug!("Ignoring unknown heightmap {key} on cell {}", record.pos);
                continue;
            };
            match Heightmap::unpack(kind, min_y, height, &words) {
                Some(map) => {
                    cell.heightmaps.insert(kind, map);
                },
                None => warn!("Heightmap {key} on cell {} has the wrong size", record.pos),
            }
        }

        for start in record.structure_starts {
            cell.structure_starts.insert(start.kind.clone(), start);
        }
        for (kind, origins) in record.structure_references {
            cell.structure_references
                .insert(kind, origins.into_iter().collect());
        }
        for payload in record.sub_entities {
            cell.pending_sub_entities.insert(payload.pos, payload);
        }
        for (index, list) in record
            .post_processing
            .into_iter()
            .take(cell.layout.section_count)
            .enumerate()
        {
            cell.post_processing[index] = list;
        }
        cell.block_ticks = TickSchedule::from_ticks(record.block_ticks);
        cell.fluid_ticks = TickSchedule::from_ticks(record.fluid_ticks);
        cell.light_correct = record.light_correct;
        if record.full {
            cell.form = CellForm::Full;
        }
        Ok(cell)
    }
}

/// Height of the first free block above the highest block at or below
/// `from_y` that is opaque for `kind`.
fn column_height(
    sections: &[Section],
    layout: &CellLayout,
    kind: HeightmapKind,
    lx: usize,
    lz: usize,
    from_y: i32,
) -> i32 {
    let mut y = from_y.min(layout.max_y() - 1);
    while y >= layout.min_y() {
        let Some(index) = layout.section_index(y) else {
            break;
        };
        let section = &sections[index];
        if section.is_empty() {
            y = (y & !(SECTION_HEIGHT - 1)) - 1;
            continue;
        }
        let content = section.get(BlockPos::new(lx as i32, y, lz as i32).section_index());
        if kind.is_opaque(content, layout.content.flags(content)) {
            return y + 1;
        }
        y -= 1;
    }
    layout.min_y()
}
