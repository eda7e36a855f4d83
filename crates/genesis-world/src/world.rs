//! The world: the single execution context that owns residency.
//!
//! Worker tasks only ever produce cells. Everything that crosses cell
//! boundaries (neighbor masks, ticker bindings, post-processing, ticking
//! escalation) happens here, on `&mut World`, fed by the pipeline's event
//! channel and the world's own task queue.

use crate::cell::{Cell, ScheduledTick, SubEntity, SubEntityKinds, TickContext};
use crate::config::WorldBorder;
use crate::holder::CellHolder;
use crate::neighbors::{NeighborMask, NeighborTracker};
use crate::pipeline::{FlushHandle, PipelineEvent, PipelineExecutor};
use crate::tickers::TickerList;
use ahash::AHashMap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use genesis_common::{BlockPos, CellPos, ContentId};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Radius whose satisfaction makes a cell send-ready.
pub const SEND_READY_RADIUS: u32 = 1;

/// Radius whose satisfaction lets a cell tick.
pub const TICKING_RADIUS: u32 = 2;

/// Decides which cells may be promoted to the ticking tier.
pub trait TicketSink: Send + Sync {
    /// Whether the cell should tick once its neighbors allow it.
    fn wants_ticking(&self, pos: CellPos) -> bool;

    /// Promotes the cell to the ticking tier.
    fn escalate(&self, pos: CellPos);
}

/// Delivers send-ready cells to observers.
pub trait ObserverDelivery: Send + Sync {
    /// Whether any observer is close enough to care about the cell.
    fn is_observed(&self, pos: CellPos) -> bool;

    /// The cell may now be transmitted.
    fn on_send_ready(&self, pos: CellPos);
}

/// Content behavior the world runs on full cells. Defaults do nothing.
#[allow(unused_variables)]
pub trait WorldHooks: Send + Sync {
    /// Resolves one position queued for post-processing.
    fn post_process(&self, cell: &mut Cell, pos: BlockPos) {}

    /// Runs a due scheduled tick; `fluid` tells which schedule it came from.
    fn scheduled_tick(&self, cell: &mut Cell, tick: &ScheduledTick, fluid: bool) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl WorldHooks for NoHooks {}

/// Work queued for the world's next [`World::run_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainTask {
    /// The cell's neighbors within `radius` became resident
    Ready {
        /// Cell whose threshold rose
        pos: CellPos,
        /// Threshold radius
        radius: u32,
    },
    /// A neighbor within `radius` stopped being resident
    Lost {
        /// Cell whose threshold fell
        pos: CellPos,
        /// Threshold radius
        radius: u32,
    },
}

/// Unbounded queue of [`MainTask`]s.
#[derive(Debug)]
pub struct TaskQueue {
    sender: Sender<MainTask>,
    receiver: Receiver<MainTask>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    /// Queues a task.
    pub fn publish(&self, task: MainTask) {
        // The receiver lives as long as the queue.
        let _ = self.sender.send(task);
    }

    /// Drains all queued tasks.
    pub fn drain(&self) -> Vec<MainTask> {
        self.receiver.try_iter().collect()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// New sender handle.
    #[must_use]
    pub fn sender(&self) -> Sender<MainTask> {
        self.sender.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    send_ready: bool,
    escalated: bool,
}

/// Outcome of one [`World::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Game time after the tick
    pub game_time: u64,
    /// Sub-entity tickers that ran
    pub tickers_run: usize,
    /// Tickers skipped because their sub-entity or cell was not eligible
    pub tickers_skipped: usize,
    /// Tickers that returned an error
    pub ticker_errors: usize,
    /// Scheduled content ticks run
    pub block_ticks: usize,
    /// Scheduled fluid ticks run
    pub fluid_ticks: usize,
}

/// Owner of every full, attached cell.
pub struct World {
    pipeline: Arc<PipelineExecutor>,
    events: Receiver<PipelineEvent>,
    tracker: NeighborTracker,
    tickers: TickerList,
    live: AHashMap<CellPos, Arc<CellHolder>>,
    readiness: AHashMap<CellPos, Readiness>,
    tasks: TaskQueue,
    kinds: Arc<SubEntityKinds>,
    observers: Arc<dyn ObserverDelivery>,
    tickets: Arc<dyn TicketSink>,
    hooks: Arc<dyn WorldHooks>,
    border: WorldBorder,
    game_time: u64,
}

impl World {
    /// Creates a world fed by `pipeline`'s event receiver.
    pub fn new(
        pipeline: Arc<PipelineExecutor>,
        events: Receiver<PipelineEvent>,
        kinds: Arc<SubEntityKinds>,
        observers: Arc<dyn ObserverDelivery>,
        tickets: Arc<dyn TicketSink>,
    ) -> Self {
        let tasks = TaskQueue::new();
        let mut tracker = NeighborTracker::new();
        let sender = tasks.sender();
        tracker.subscribe(Box::new(move |pos, old, new| {
            for task in threshold_edges(pos, old, new) {
                let _ = sender.send(task);
            }
        }));

        Self {
            border: pipeline.config().border,
            pipeline,
            events,
            tracker,
            tickers: TickerList::new(),
            live: AHashMap::new(),
            readiness: AHashMap::new(),
            tasks,
            kinds,
            observers,
            tickets,
            hooks: Arc::new(NoHooks),
            game_time: 0,
        }
    }

    /// Replaces the content hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn WorldHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The pipeline feeding this world.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<PipelineExecutor> {
        &self.pipeline
    }

    /// Residency masks.
    #[must_use]
    pub fn tracker(&self) -> &NeighborTracker {
        &self.tracker
    }

    /// Ticker slots.
    #[must_use]
    pub fn tickers(&self) -> &TickerList {
        &self.tickers
    }

    /// Current game time.
    #[must_use]
    pub const fn game_time(&self) -> u64 {
        self.game_time
    }

    /// Number of attached cells.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Holder of an attached cell.
    #[must_use]
    pub fn cell(&self, pos: CellPos) -> Option<&Arc<CellHolder>> {
        self.live.get(&pos)
    }

    /// Whether the cell was post-processed and handed to observers.
    #[must_use]
    pub fn is_send_ready(&self, pos: CellPos) -> bool {
        self.readiness.get(&pos).is_some_and(|r| r.send_ready)
    }

    /// Whether the cell was escalated to the ticking tier.
    #[must_use]
    pub fn is_escalated(&self, pos: CellPos) -> bool {
        self.readiness.get(&pos).is_some_and(|r| r.escalated)
    }

    /// Whether a cell may tick: attached with every cell within the ticking
    /// radius resident.
    #[must_use]
    pub fn is_ticking(&self, pos: CellPos) -> bool {
        self.live.contains_key(&pos) && self.tracker.is_satisfied(pos, TICKING_RADIUS)
    }

    /// Attaches promoted cells and runs queued tasks until both queues are
    /// empty. Returns the number of items handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let events: Vec<_> = self.events.try_iter().collect();
            let tasks = self.tasks.drain();
            if events.is_empty() && tasks.is_empty() {
                return handled;
            }
            handled += events.len() + tasks.len();
            for PipelineEvent::Promoted(holder) in events {
                self.attach(holder);
            }
            for task in tasks {
                self.run_task(task);
            }
        }
    }

    /// Makes a full cell resident in the world and binds its tickers.
    pub fn attach(&mut self, holder: Arc<CellHolder>) {
        let pos = holder.pos();
        if !holder.is_resident() {
            debug!("Not attaching {pos}: unloaded before it arrived");
            return;
        }
        if self.live.contains_key(&pos) {
            return;
        }
        {
            let cell = holder.read();
            for entity in cell.live_sub_entities() {
                self.bind(pos, entity);
            }
        }
        self.live.insert(pos, holder);
        self.readiness.insert(pos, Readiness::default());
        self.tracker.insert(pos);
        trace!("Attached cell {pos}");
    }

    fn bind(&mut self, cell: CellPos, entity: &SubEntity) {
        let has_ticker = self.kinds.ticker(entity.kind()).is_some();
        if !has_ticker && !self.kinds.is_known(entity.kind()) {
            debug!("Sub-entity kind {} at {} is not registered", entity.kind(), entity.pos());
        }
        self.tickers
            .bind(cell, entity.pos(), entity.kind(), has_ticker);
    }

    fn run_task(&mut self, task: MainTask) {
        match task {
            MainTask::Ready { pos, radius } if radius == SEND_READY_RADIUS => self.post_process(pos),
            MainTask::Ready { pos, radius } if radius == TICKING_RADIUS => self.escalate(pos),
            MainTask::Lost { pos, radius } => {
                if let Some(readiness) = self.readiness.get_mut(&pos) {
                    match radius {
                        SEND_READY_RADIUS => readiness.send_ready = false,
                        TICKING_RADIUS => readiness.escalated = false,
                        _ => {},
                    }
                }
            },
            MainTask::Ready { .. } => {},
        }
    }

    /// Resolves deferred positions, promotes pending sub-entities, and
    /// hands the cell to observers. Runs at most once per rise of the
    /// send-ready threshold.
    fn post_process(&mut self, pos: CellPos) {
        if !self.tracker.is_satisfied(pos, SEND_READY_RADIUS) || self.is_send_ready(pos) {
            return;
        }
        let Some(holder) = self.live.get(&pos).map(Arc::clone) else {
            return;
        };
        if !self.observers.is_observed(pos) {
            trace!("Deferring post-processing of {pos}: no observer");
            return;
        }

        let promoted: Vec<SubEntity> = {
            let mut cell = holder.write();
            let pending = cell.drain_post_processing();
            for block in &pending {
                self.hooks.post_process(&mut cell, *block);
            }
            if !pending.is_empty() {
                trace!("Post-processed {} positions in {pos}", pending.len());
            }
            let positions = cell.promote_all_pending();
            positions
                .iter()
                .filter_map(|&p| cell.sub_entity(p).cloned())
                .collect()
        };
        for entity in &promoted {
            self.bind(pos, entity);
        }

        if !self.tracker.is_satisfied(pos, SEND_READY_RADIUS) {
            return;
        }
        if let Some(readiness) = self.readiness.get_mut(&pos) {
            readiness.send_ready = true;
        }
        self.observers.on_send_ready(pos);
        debug!("Cell {pos} is send-ready");
    }

    fn escalate(&mut self, pos: CellPos) {
        if !self.tracker.is_satisfied(pos, TICKING_RADIUS) || self.is_escalated(pos) {
            return;
        }
        if !self.tickets.wants_ticking(pos) {
            return;
        }
        if let Some(readiness) = self.readiness.get_mut(&pos) {
            readiness.escalated = true;
            self.tickets.escalate(pos);
            debug!("Cell {pos} escalated to ticking");
        }
    }

    /// Re-checks send-readiness once an observer starts caring about `pos`.
    pub fn notify_observed(&mut self, pos: CellPos) {
        self.tasks.publish(MainTask::Ready {
            pos,
            radius: SEND_READY_RADIUS,
        });
    }

    /// Runs `f` on the sub-entity at `pos`, promoting a pending payload and
    /// binding its ticker first. `None` if the cell is not attached or holds
    /// nothing there.
    pub fn sub_entity_mut<R>(
        &mut self,
        pos: BlockPos,
        f: impl FnOnce(&mut SubEntity) -> R,
    ) -> Option<R> {
        let cell_pos = pos.cell();
        let holder = Arc::clone(self.live.get(&cell_pos)?);
        let mut cell = holder.write();
        let entity = cell.get_or_promote(pos)?;
        if self.tickers.handle_at(cell_pos, pos).is_none() {
            let has_ticker = self.kinds.ticker(entity.kind()).is_some();
            self.tickers.bind(cell_pos, pos, entity.kind(), has_ticker);
        }
        let result = f(entity);
        cell.set_unsaved(true);
        Some(result)
    }

    /// Writes content in an attached cell. Returns the previous content, or
    /// `None` if the cell is not attached or `pos` is outside its vertical
    /// range.
    ///
    /// A live sub-entity at `pos` follows the content: when the new content
    /// declares another kind it is replaced by a fresh one of that kind,
    /// keeping its ticker slot; when it declares none it is removed and its
    /// ticker unbound.
    pub fn set_content(&mut self, pos: BlockPos, content: ContentId) -> Option<ContentId> {
        let cell_pos = pos.cell();
        let holder = Arc::clone(self.live.get(&cell_pos)?);
        let mut cell = holder.write();
        let old = cell.set_content(pos, content)?;
        let declared = cell.layout().content().sub_entity_kind(content).cloned();
        let Some(current) = cell.sub_entity(pos).map(|e| e.kind().clone()) else {
            return Some(old);
        };
        match declared {
            Some(kind) if kind == current => {},
            Some(kind) => {
                trace!("Sub-entity at {pos} changes from {current} to {kind}");
                let entity = SubEntity::new(pos, kind, Vec::new());
                self.bind(cell_pos, &entity);
                cell.set_sub_entity(entity);
            },
            None => {
                cell.remove_sub_entity(pos);
                if self.tickers.unbind(cell_pos, pos) {
                    trace!("Unbound ticker of {current} at {pos}");
                }
            },
        }
        Some(old)
    }

    /// Stores a live sub-entity in an attached cell, replacing anything at
    /// its position, and binds its ticker. A replaced binding keeps its
    /// handle. Returns false if the cell is not attached.
    pub fn set_sub_entity(&mut self, entity: SubEntity) -> bool {
        let cell_pos = entity.pos().cell();
        let Some(holder) = self.live.get(&cell_pos).map(Arc::clone) else {
            return false;
        };
        self.bind(cell_pos, &entity);
        holder.write().set_sub_entity(entity);
        true
    }

    /// Removes the sub-entity at `pos` and unbinds its ticker. Other
    /// sub-entities of the cell stay bound.
    pub fn remove_sub_entity(&mut self, pos: BlockPos) -> Option<SubEntity> {
        let cell_pos = pos.cell();
        let holder = Arc::clone(self.live.get(&cell_pos)?);
        let removed = holder.write().remove_sub_entity(pos);
        self.tickers.unbind(cell_pos, pos);
        removed
    }

    /// Advances game time by one and ticks every eligible cell.
    pub fn tick(&mut self) -> TickReport {
        self.run_pending();
        self.game_time += 1;
        let mut report = TickReport {
            game_time: self.game_time,
            ..TickReport::default()
        };

        let game_time = self.game_time;
        let live = &self.live;
        let tracker = &self.tracker;
        let border = self.border;
        let kinds = &self.kinds;
        self.tickers.tick_all(|ticker| {
            let cell_pos = ticker.cell();
            let pos = ticker.pos();
            let Some(holder) = live.get(&cell_pos) else {
                report.tickers_skipped += 1;
                return;
            };
            if !tracker.is_satisfied(cell_pos, TICKING_RADIUS) || !border.contains(pos) {
                report.tickers_skipped += 1;
                return;
            }

            let mut cell = holder.write();
            let declared = cell
                .layout()
                .content()
                .sub_entity_kind(cell.content(pos))
                .cloned();
            let Some(entity) = cell.get_or_promote(pos).filter(|e| !e.is_removed()) else {
                report.tickers_skipped += 1;
                return;
            };
            if declared.as_ref() != Some(entity.kind()) || entity.kind() != ticker.kind() {
                if ticker.first_invalid() {
                    warn!(
                        "Ticker for {} at {pos} no longer matches its content; skipping",
                        ticker.kind()
                    );
                }
                report.tickers_skipped += 1;
                return;
            }
            let Some(behavior) = kinds.ticker(entity.kind()) else {
                report.tickers_skipped += 1;
                return;
            };
            let ctx = TickContext {
                cell: cell_pos,
                game_time,
            };
            match behavior.tick(entity, &ctx) {
                Ok(()) => report.tickers_run += 1,
                Err(e) => {
                    warn!("Ticker for {} at {pos} failed: {e}", ticker.kind());
                    report.ticker_errors += 1;
                },
            }
            cell.set_unsaved(true);
        });

        for (&pos, holder) in &self.live {
            if !self.tracker.is_satisfied(pos, TICKING_RADIUS) {
                continue;
            }
            let mut cell = holder.write();
            for tick in cell.block_ticks_mut().pop_due(game_time) {
                self.hooks.scheduled_tick(&mut cell, &tick, false);
                report.block_ticks += 1;
            }
            for tick in cell.fluid_ticks_mut().pop_due(game_time) {
                self.hooks.scheduled_tick(&mut cell, &tick, true);
                report.fluid_ticks += 1;
            }
        }
        report
    }

    /// Detaches a cell and unloads it from the pipeline: tickers are
    /// unbound, neighbor bits cleared, and dirty state flushed.
    pub fn unload_cell(&mut self, pos: CellPos) -> Option<FlushHandle> {
        let unbound = self.tickers.unbind_cell(pos);
        self.tracker.remove(pos);
        self.live.remove(&pos);
        self.readiness.remove(&pos);
        if unbound > 0 {
            trace!("Unbound {unbound} tickers of {pos}");
        }
        self.pipeline.unload(pos)
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("live", &self.live.len())
            .field("tracker", &self.tracker)
            .field("tickers", &self.tickers.bound_count())
            .field("game_time", &self.game_time)
            .finish_non_exhaustive()
    }
}

/// Tasks for every watched threshold that flipped between `old` and `new`.
fn threshold_edges(pos: CellPos, old: NeighborMask, new: NeighborMask) -> Vec<MainTask> {
    [SEND_READY_RADIUS, TICKING_RADIUS]
        .into_iter()
        .filter_map(|radius| match (old.is_satisfied(radius), new.is_satisfied(radius)) {
            (false, true) => Some(MainTask::Ready { pos, radius }),
            (true, false) => Some(MainTask::Lost { pos, radius }),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_edges() {
        let pos = CellPos::new(0, 0);
        let mut ring1 = NeighborMask::EMPTY;
        for p in pos.square(1) {
            ring1 = ring1.with(p.x, p.z, true);
        }
        let mut ring2 = ring1;
        for p in pos.square(2) {
            ring2 = ring2.with(p.x, p.z, true);
        }

        assert_eq!(
            threshold_edges(pos, NeighborMask::EMPTY, ring1),
            vec![MainTask::Ready { pos, radius: 1 }]
        );
        assert_eq!(
            threshold_edges(pos, ring1, ring2),
            vec![MainTask::Ready { pos, radius: 2 }]
        );
        assert_eq!(
            threshold_edges(pos, ring2, NeighborMask::EMPTY),
            vec![
                MainTask::Lost { pos, radius: 1 },
                MainTask::Lost { pos, radius: 2 }
            ]
        );
        assert!(threshold_edges(pos, ring1, ring1).is_empty());
    }

    #[test]
    fn test_task_queue() {
        let queue = TaskQueue::new();
        let pos = CellPos::new(1, 1);
        queue.publish(MainTask::Ready { pos, radius: 1 });
        queue.sender().send(MainTask::Lost { pos, radius: 2 }).expect("open");
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.drain().len(), 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
