//! Pipeline executor: advances cells through the stage chain.
//!
//! Every `(cell, stage)` pair has at most one in-flight future, shared by all
//! requesters. A stage future first waits for the same cell's parent stage,
//! then for each neighbor within the stage's radius to reach the stage the
//! distance table asks of it, then runs the stage task and commits. Cells
//! already at or past the stage (typically loaded from storage) run the
//! stage's load task instead, over the same resolved window.
//!
//! Residency loss resolves every pending future of the cell with
//! [`PipelineError::Unloaded`]; tasks already running on the blocking pool
//! finish, but their commit is discarded. Until an unloaded cell's flush
//! settles, a new holder at the same position waits for it before reading
//! storage.

use crate::cell::{Cell, CellLayout};
use crate::config::WorldConfig;
use crate::content::ContentTable;
use crate::error::{PipelineError, PipelineResult};
use crate::holder::{CellHolder, StageFuture};
use crate::lighting::LightingEngine;
use crate::region::GenerationRegion;
use crate::stage::{StageChain, StageId};
use crate::storage::CellStorage;
use crate::task::StageContext;
use crossbeam_channel::{Receiver, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use genesis_common::{CellPos, StorageError, StorageResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Completion of an unload's flush. Resolves to whether a record was
/// written.
pub type FlushHandle = BoxFuture<'static, StorageResult<bool>>;

/// Settles once an unload's flush finished, whatever its outcome.
type FlushSettled = Shared<BoxFuture<'static, ()>>;

/// Notifications for the world's execution context.
#[derive(Debug)]
pub enum PipelineEvent {
    /// The cell committed the final stage for the first time since it was
    /// created.
    Promoted(Arc<CellHolder>),
}

/// Drives cells through the stage chain.
pub struct PipelineExecutor {
    chain: Arc<StageChain>,
    layout: CellLayout,
    config: WorldConfig,
    storage: Arc<dyn CellStorage>,
    lighting: Arc<dyn LightingEngine>,
    holders: DashMap<CellPos, Arc<CellHolder>>,
    /// Flushes still in flight, tagged so a later unload's entry survives
    /// an earlier flush settling.
    flushing: Arc<DashMap<CellPos, (u64, FlushSettled)>>,
    flush_tickets: AtomicU64,
    events: Sender<PipelineEvent>,
    runtime: Handle,
}

impl PipelineExecutor {
    /// Creates an executor. Stage futures are spawned on `runtime`; the
    /// receiver delivers [`PipelineEvent`]s to the world.
    pub fn new(
        chain: Arc<StageChain>,
        config: WorldConfig,
        content: Arc<ContentTable>,
        storage: Arc<dyn CellStorage>,
        lighting: Arc<dyn LightingEngine>,
        runtime: Handle,
    ) -> (Arc<Self>, Receiver<PipelineEvent>) {
        let (events, receiver) = crossbeam_channel::unbounded();
        let layout = CellLayout::new(config.min_section, config.section_count, content);
        let executor = Arc::new(Self {
            chain,
            layout,
            config,
            storage,
            lighting,
            holders: DashMap::new(),
            flushing: Arc::new(DashMap::new()),
            flush_tickets: AtomicU64::new(0),
            events,
            runtime,
        });
        (executor, receiver)
    }

    /// The stage chain.
    #[must_use]
    pub fn chain(&self) -> &Arc<StageChain> {
        &self.chain
    }

    /// Layout of every cell.
    #[must_use]
    pub const fn layout(&self) -> &CellLayout {
        &self.layout
    }

    /// World configuration.
    #[must_use]
    pub const fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Whether cells may exist at `pos`.
    #[must_use]
    pub fn in_bounds(&self, pos: CellPos) -> bool {
        self.config.in_bounds(pos)
    }

    /// Holder at `pos`, if resident.
    #[must_use]
    pub fn get_if_present(&self, pos: CellPos) -> Option<Arc<CellHolder>> {
        self.holders.get(&pos).map(|h| Arc::clone(h.value()))
    }

    /// Number of resident holders, at any stage.
    #[must_use]
    pub fn holder_count(&self) -> usize {
        self.holders.len()
    }

    /// Positions of every resident holder.
    #[must_use]
    pub fn positions(&self) -> Vec<CellPos> {
        self.holders.iter().map(|e| *e.key()).collect()
    }

    /// Requests `pos` at `target`, generating or loading it and any
    /// neighbors the chain requires.
    pub fn request(
        self: &Arc<Self>,
        pos: CellPos,
        target: StageId,
    ) -> BoxFuture<'static, PipelineResult<Arc<CellHolder>>> {
        if !self.in_bounds(pos) {
            return future::err(PipelineError::OutOfBounds(pos)).boxed();
        }
        let holder = self.get_or_create(pos);
        let stage = self.schedule(&holder, target);
        async move { stage.await.map(|()| holder) }.boxed()
    }

    /// Requests the stage a cell at ticket `level` must reach. `None` when
    /// the level is too far to need anything.
    pub fn request_for_ticket(
        self: &Arc<Self>,
        pos: CellPos,
        level: u32,
    ) -> Option<BoxFuture<'static, PipelineResult<Arc<CellHolder>>>> {
        (level < self.chain.max_distance())
            .then(|| self.request(pos, self.chain.ticket_stage_for(level)))
    }

    /// Re-runs the generation task of `target` on a resident cell, even if
    /// the cell is already past it.
    pub fn regenerate(
        self: &Arc<Self>,
        pos: CellPos,
        target: StageId,
    ) -> BoxFuture<'static, PipelineResult<Arc<CellHolder>>> {
        let this = Arc::clone(self);
        async move {
            let holder = this
                .get_if_present(pos)
                .ok_or(PipelineError::Unloaded(pos))?;
            let stage = this.chain.get(target);
            this.schedule(&holder, stage.parent()).await?;
            let region = this.resolve_region(&holder, target).await?;
            Arc::clone(stage.task())
                .run_generation(this.context(target, true), region)
                .await
                .map_err(|e| this.task_failed(pos, target, &e.to_string()))?;
            this.commit(&holder, target)?;
            Ok(holder)
        }
        .boxed()
    }

    /// Unloads `pos`: pending requests fail with `Unloaded`, and the cell is
    /// written to storage if it has unsaved changes. `None` if the cell was
    /// not resident.
    ///
    /// A request for `pos` made before the flush settles loads what the
    /// flush wrote.
    pub fn unload(&self, pos: CellPos) -> Option<FlushHandle> {
        // The flush is registered while the holder's shard is still locked,
        // so no new holder can read storage ahead of it.
        let Entry::Occupied(entry) = self.holders.entry(pos) else {
            return None;
        };
        let ticket = self.flush_tickets.fetch_add(1, Ordering::Relaxed);
        let (done, settled) = oneshot::channel::<()>();
        let settled: FlushSettled = settled.map(|_| ()).boxed().shared();
        let previous = self
            .flushing
            .insert(pos, (ticket, settled))
            .map(|(_, earlier)| earlier);
        let holder = entry.remove();
        holder.mark_unloaded();
        debug!("Unloading cell {pos}");

        let storage = Arc::clone(&self.storage);
        let chain = Arc::clone(&self.chain);
        let flushing = Arc::clone(&self.flushing);
        let task = self.runtime.spawn(async move {
            if let Some(earlier) = previous {
                earlier.await;
            }
            let result =
                tokio::task::spawn_blocking(move || flush(storage.as_ref(), &chain, &holder))
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))
                    .and_then(|written| written);
            flushing.remove_if(&pos, |_, (current, _)| *current == ticket);
            trace!("Flush of {pos} settled");
            // Waiters wake on a dropped sender too.
            let _ = done.send(());
            result
        });
        Some(
            async move {
                task.await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
            }
            .boxed(),
        )
    }

    /// Number of unloaded cells whose flush has not settled.
    #[must_use]
    pub fn pending_flushes(&self) -> usize {
        self.flushing.len()
    }

    /// Writes every resident cell with unsaved changes. Blocking.
    ///
    /// Every cell is attempted; the first failure is returned after the
    /// rest were written.
    pub fn save_all(&self) -> StorageResult<usize> {
        let holders: Vec<_> = self.holders.iter().map(|e| Arc::clone(e.value())).collect();
        let mut saved = 0;
        let mut first_error = None;
        for holder in holders {
            match flush(self.storage.as_ref(), &self.chain, &holder) {
                Ok(true) => saved += 1,
                Ok(false) => {},
                Err(e) => {
                    warn!("Failed to save cell {}: {e}", holder.pos());
                    first_error.get_or_insert(e);
                },
            }
        }
        info!("Saved {saved} cells");
        first_error.map_or(Ok(saved), Err)
    }

    fn get_or_create(&self, pos: CellPos) -> Arc<CellHolder> {
        let entry = self.holders.entry(pos).or_insert_with(|| {
            trace!("Creating holder for {pos}");
            let cell = Cell::new(pos, self.chain.first(), self.layout.clone());
            Arc::new(CellHolder::new(cell, self.chain.len()))
        });
        Arc::clone(entry.value())
    }

    fn context(&self, stage: StageId, forced: bool) -> StageContext {
        StageContext {
            chain: Arc::clone(&self.chain),
            stage,
            forced,
            lighting: Arc::clone(&self.lighting),
        }
    }

    fn task_failed(&self, pos: CellPos, stage: StageId, reason: &str) -> PipelineError {
        PipelineError::TaskFailed {
            pos,
            stage: self.chain.get(stage).name().clone(),
            reason: reason.to_owned(),
        }
    }

    /// Returns the shared future for `(holder, target)`, spawning it if none
    /// is in flight. A future that already failed is replaced.
    fn schedule(self: &Arc<Self>, holder: &Arc<CellHolder>, target: StageId) -> StageFuture {
        let mut slots = holder.futures().lock();
        if let Some(existing) = &slots[target.index()] {
            if !matches!(existing.peek(), Some(Err(_))) {
                return existing.clone();
            }
        }

        let pos = holder.pos();
        let work = if target == self.chain.first() {
            Arc::clone(self).load_or_create(Arc::clone(holder)).boxed()
        } else {
            Arc::clone(self).advance(Arc::clone(holder), target).boxed()
        };
        let unloaded = holder.wait_unloaded();
        let task = self.runtime.spawn(async move {
            tokio::select! {
                biased;
                () = unloaded => Err(PipelineError::Unloaded(pos)),
                result = work => result,
            }
        });

        let failed = self.task_failed(pos, target, "stage future panicked");
        let stage = async move { task.await.unwrap_or(Err(failed)) }
            .boxed()
            .shared();
        slots[target.index()] = Some(stage.clone());
        stage
    }

    async fn load_or_create(self: Arc<Self>, holder: Arc<CellHolder>) -> PipelineResult<()> {
        let pos = holder.pos();
        let first = self.chain.first();
        let pending = self.flushing.get(&pos).map(|e| e.value().1.clone());
        if let Some(settled) = pending {
            debug!("Waiting for the previous flush of {pos}");
            settled.await;
        }
        let storage = Arc::clone(&self.storage);
        let stored = tokio::task::spawn_blocking(move || storage.read(pos))
            .await
            .map_err(|e| self.task_failed(pos, first, &e.to_string()))?
            .map_err(|e| PipelineError::Storage {
                pos,
                reason: e.to_string(),
            })?;

        let loaded = match stored {
            Some(record) => match Cell::from_record(record, &self.chain, self.layout.clone()) {
                Ok(cell) => {
                    debug!(
                        "Loaded cell {pos} at stage {}",
                        self.chain.get(cell.stage()).name()
                    );
                    *holder.write() = cell;
                    holder.set_loaded();
                    true
                },
                Err(e) => {
                    warn!("Discarding stored cell {pos}: {e}");
                    false
                },
            },
            None => false,
        };

        let task = Arc::clone(self.chain.get(first).task());
        let ctx = self.context(first, false);
        let region = GenerationRegion::new(Arc::clone(&holder), Vec::new(), 0);
        let result = if loaded {
            task.run_load(ctx, region).await
        } else {
            task.run_generation(ctx, region).await
        };
        result.map_err(|e| self.task_failed(pos, first, &e.to_string()))?;
        self.commit(&holder, first)
    }

    async fn advance(self: Arc<Self>, holder: Arc<CellHolder>, target: StageId) -> PipelineResult<()> {
        let pos = holder.pos();
        let stage = self.chain.get(target);
        self.schedule(&holder, stage.parent()).await?;

        let region = self.resolve_region(&holder, target).await?;
        let task = Arc::clone(stage.task());
        let ctx = self.context(target, false);
        let result = if holder.stage().is_at_least(target) {
            trace!("Loading {} on {pos} over {} cells", stage.name(), region.len());
            task.run_load(ctx, region).await
        } else {
            trace!("Running {} on {pos} over {} cells", stage.name(), region.len());
            task.run_generation(ctx, region).await
        };
        result.map_err(|e| self.task_failed(pos, target, &e.to_string()))?;
        self.commit(&holder, target)
    }

    /// Waits for every neighbor within the target's radius to reach its
    /// dependency stage. Fails fast on the first neighbor failure.
    async fn resolve_region(
        self: &Arc<Self>,
        holder: &Arc<CellHolder>,
        target: StageId,
    ) -> PipelineResult<GenerationRegion> {
        let pos = holder.pos();
        let radius = self.chain.get(target).neighbor_radius();
        let mut pending = Vec::new();
        for neighbor in pos.square(radius) {
            if neighbor == pos {
                continue;
            }
            if !self.in_bounds(neighbor) {
                return Err(PipelineError::dependency(
                    pos,
                    neighbor,
                    PipelineError::OutOfBounds(neighbor),
                ));
            }
            let needed = self
                .chain
                .dependency_stage(target, pos.chebyshev_distance(neighbor));
            let neighbor_holder = self.get_or_create(neighbor);
            let stage = self.schedule(&neighbor_holder, needed);
            pending.push(async move {
                stage
                    .await
                    .map(|()| neighbor_holder)
                    .map_err(|e| PipelineError::dependency(pos, neighbor, e))
            });
        }
        let cells = future::try_join_all(pending).await?;
        Ok(GenerationRegion::new(Arc::clone(holder), cells, radius))
    }

    /// Records that `holder` reached `target`. Discarded when the holder is
    /// no longer resident.
    fn commit(&self, holder: &Arc<CellHolder>, target: StageId) -> PipelineResult<()> {
        let pos = holder.pos();
        let stage = self.chain.get(target);
        let mut cell = holder.write();
        if !holder.is_resident() {
            debug!("Discarding {} for unloaded cell {pos}", stage.name());
            return Err(PipelineError::Unloaded(pos));
        }
        if cell.advance_to(target, stage.heightmaps()) {
            trace!("Cell {pos} reached {}", stage.name());
        }
        if !stage.is_final() {
            return Ok(());
        }

        let promoted = cell.promote_to_full();
        drop(cell);
        if holder.mark_promoted() {
            debug!(
                "Cell {pos} promoted to full with {} sub-entities",
                promoted.len()
            );
            if self
                .events
                .send(PipelineEvent::Promoted(Arc::clone(holder)))
                .is_err()
            {
                trace!("No world listening for promoted cell {pos}");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("stages", &self.chain.len())
            .field("holders", &self.holders.len())
            .field("flushing", &self.flushing.len())
            .finish_non_exhaustive()
    }
}

/// Writes the cell if it has unsaved changes. The cell stays locked
/// throughout so no change slips in between the snapshot and clearing the
/// flag.
fn flush(storage: &dyn CellStorage, chain: &StageChain, holder: &CellHolder) -> StorageResult<bool> {
    let mut cell = holder.write();
    if !cell.is_unsaved() {
        return Ok(false);
    }
    storage.write(&cell.to_record(chain))?;
    cell.set_unsaved(false);
    Ok(true)
}
